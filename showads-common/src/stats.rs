use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Serialize, Serializer};

/// Running counters of the validation and deduplication stages.
/// Shared behind an `Arc` as the stages run on a blocking thread while the caller reads them.
#[derive(Debug, Default)]
pub struct ParseStats {
    read: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    unique: AtomicU64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_valid(&self) {
        self.valid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unique(&self) {
        self.unique.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn valid(&self) -> u64 {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn invalid(&self) -> u64 {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn unique(&self) -> u64 {
        self.unique.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> ParseSummary {
        ParseSummary {
            read: self.read(),
            valid: self.valid(),
            invalid: self.invalid(),
            unique: self.unique(),
        }
    }
}

/// Point in time copy of `ParseStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseSummary {
    pub read: u64,
    pub valid: u64,
    pub invalid: u64,
    pub unique: u64,
}

/// Delivery metrics of one run.
/// Every counter only grows during a run; `final_parallelism` and `final_backoff` describe the
/// throttling state the dispatcher ended the run with.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SendMetrics {
    pub read: u64,
    pub valid: u64,
    pub invalid: u64,
    pub unique: u64,
    /// Rows handed to the dispatcher.
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub total_batches: u64,
    pub total_retries: u64,
    pub max_retries: u64,
    pub final_parallelism: usize,
    #[serde(rename = "final_backoff_s", serialize_with = "serialize_secs")]
    pub final_backoff: Duration,
    #[serde(rename = "total_batch_time_s", serialize_with = "serialize_secs")]
    pub total_batch_time: Duration,
}

impl SendMetrics {
    pub fn merge_parse_summary(&mut self, summary: ParseSummary) {
        self.read = summary.read;
        self.valid = summary.valid;
        self.invalid = summary.invalid;
        self.unique = summary.unique;
    }

    /// Account one finished batch, whether it was delivered or not.
    pub fn record_batch(&mut self, rows: usize, delivered: bool, retries: u64, duration: Duration) {
        if delivered {
            self.sent += rows as u64;
        } else {
            self.failed += rows as u64;
        }
        self.total_retries += retries;
        self.max_retries = self.max_retries.max(retries);
        self.total_batch_time += duration;
    }

    pub fn avg_batch_time(&self) -> Duration {
        match u32::try_from(self.total_batches) {
            Ok(0) => Duration::ZERO,
            Ok(batches) => self.total_batch_time / batches,
            Err(_) => Duration::from_secs_f64(
                self.total_batch_time.as_secs_f64() / self.total_batches as f64,
            ),
        }
    }

    /// Nothing was delivered but some rows were attempted and failed.
    /// Callers should treat this as a failed run even though no error was raised.
    pub fn is_failed_run(&self) -> bool {
        self.sent == 0 && self.failed > 0
    }
}

fn serialize_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats_summary() {
        let stats = ParseStats::new();
        stats.record_read();
        stats.record_read();
        stats.record_valid();
        stats.record_invalid();
        stats.record_unique();

        assert_eq!(
            stats.summary(),
            ParseSummary {
                read: 2,
                valid: 1,
                invalid: 1,
                unique: 1
            }
        );
    }

    #[test]
    fn test_record_batch() {
        let mut metrics = SendMetrics::default();
        metrics.record_batch(10, true, 0, Duration::from_millis(100));
        metrics.record_batch(5, false, 3, Duration::from_millis(300));
        metrics.record_batch(2, true, 1, Duration::from_millis(200));
        metrics.total_batches = 3;

        assert_eq!(metrics.sent, 12);
        assert_eq!(metrics.failed, 5);
        assert_eq!(metrics.total_retries, 4);
        assert_eq!(metrics.max_retries, 3);
        assert_eq!(metrics.total_batch_time, Duration::from_millis(600));
        assert_eq!(metrics.avg_batch_time(), Duration::from_millis(200));
        assert!(!metrics.is_failed_run());
    }

    #[test]
    fn test_failed_run() {
        let mut metrics = SendMetrics::default();
        assert!(!metrics.is_failed_run());
        assert_eq!(metrics.avg_batch_time(), Duration::ZERO);

        metrics.record_batch(3, false, 4, Duration::from_secs(1));
        assert!(metrics.is_failed_run());
    }

    #[test]
    fn test_serialize_durations_as_seconds() {
        let metrics = SendMetrics {
            final_backoff: Duration::from_millis(1500),
            total_batch_time: Duration::from_secs(2),
            ..Default::default()
        };

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["final_backoff_s"], 1.5);
        assert_eq!(json["total_batch_time_s"], 2.0);
        assert_eq!(json["sent"], 0);
    }
}
