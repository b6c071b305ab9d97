//! # Dispatcher
//!
//! Bounded concurrency delivery of batches through a `BulkSender`.
//!
//! A blocking producer pulls batches from the (synchronous) batch iterator and pushes them into a
//! bounded channel of capacity `2 * parallelism`, which is the only backpressure in the pipeline.
//! A pool of workers drains the channel. Every rate limit signal shrinks the shared concurrency
//! target and doubles the shared backoff; workers above the target retire after their current
//! batch, so the live worker count never grows back during a run.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use showads_common::batch::Batch;
use showads_common::error::ConfigError;
use showads_common::record::ValidatedRecord;
use showads_common::stats::SendMetrics;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::BulkResponse;
use crate::error::{ClientError, PipelineError};

/// Something that can deliver one batch to the remote API.
#[async_trait]
pub trait BulkSender: Send + Sync + 'static {
    async fn send(&self, batch: &[ValidatedRecord]) -> Result<BulkResponse, ClientError>;
}

/// Upper bound on concurrent workers in one run.
pub const MAX_PARALLELISM: usize = 1024;

/// Called with the row count of every delivered batch.
pub type ProgressCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    /// Initial number of workers.
    pub parallelism: usize,
    /// Rate limited attempts a batch may retry before it is marked failed.
    pub max_retries: u32,
    /// Initial shared backoff; doubled on every rate limit signal.
    pub backoff: Duration,
}

/// Concurrency target and backoff shared by all workers of a run.
#[derive(Debug, Clone, Copy)]
struct Throttle {
    parallelism: usize,
    backoff: Duration,
}

type TaggedBatch = (u64, Batch);

struct Shared<S> {
    sender: Arc<S>,
    max_retries: u32,
    progress: Option<ProgressCallback>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<TaggedBatch>>,
    throttle: Mutex<Throttle>,
    live_workers: AtomicUsize,
    metrics: Mutex<SendMetrics>,
}

enum Delivery {
    Sent { retries: u32 },
    Failed { retries: u32 },
}

impl<S: BulkSender> Shared<S> {
    fn throttle(&self) -> MutexGuard<'_, Throttle> {
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> MutexGuard<'_, SendMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shrink the concurrency target (never below 1) and double the backoff.
    /// Returns the new state.
    fn throttle_down(&self) -> Throttle {
        let mut throttle = self.throttle();
        throttle.parallelism = throttle.parallelism.saturating_sub(1).max(1);
        throttle.backoff = throttle.backoff.saturating_mul(2);
        *throttle
    }

    /// Decrement the live worker count if it exceeds the target. The caller must exit when
    /// this returns `true`.
    fn retire_if_over_target(&self) -> bool {
        let target = self.throttle().parallelism;
        self.live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > target).then(|| live - 1)
            })
            .is_ok()
    }

    async fn next_batch(&self) -> Option<TaggedBatch> {
        self.receiver.lock().await.recv().await
    }

    async fn deliver(&self, batch_index: u64, batch: &Batch) -> Delivery {
        let mut tries: u32 = 0;

        loop {
            match self.sender.send(batch).await {
                Ok(response) if response.is_success() => {
                    return Delivery::Sent {
                        retries: tries + response.retries,
                    };
                }
                Ok(response) => {
                    error!(
                        batch_index,
                        status = response.status.as_u16(),
                        "bulk request was not accepted"
                    );
                    return Delivery::Failed {
                        retries: tries + response.retries,
                    };
                }
                Err(e) if e.is_rate_limited() => {
                    self.metrics().rate_limited += 1;
                    metrics::counter!("showads_rate_limited").increment(1);
                    tries += 1;

                    if tries > self.max_retries {
                        return Delivery::Failed { retries: tries };
                    }

                    let throttle = self.throttle_down();
                    warn!(
                        batch_index,
                        parallelism = throttle.parallelism,
                        backoff_s = throttle.backoff.as_secs_f64(),
                        "rate_limited"
                    );
                    tokio::time::sleep(throttle.backoff).await;
                }
                Err(e) => {
                    error!(batch_index, "bulk request failed: {}", e);
                    return Delivery::Failed { retries: tries };
                }
            }
        }
    }

    async fn work(&self) {
        while let Some((batch_index, batch)) = self.next_batch().await {
            let start = Instant::now();
            let delivery = self.deliver(batch_index, &batch).await;
            let duration = start.elapsed();
            let size = batch.len();

            metrics::histogram!("showads_batch_duration_seconds").record(duration.as_secs_f64());
            match delivery {
                Delivery::Sent { retries } => {
                    self.metrics()
                        .record_batch(size, true, u64::from(retries), duration);
                    info!(
                        batch_index,
                        size,
                        duration_s = duration.as_secs_f64(),
                        retries,
                        "batch_sent"
                    );
                    metrics::counter!("showads_batches_sent").increment(1);
                    if let Some(progress) = &self.progress {
                        progress(size);
                    }
                }
                Delivery::Failed { retries } => {
                    self.metrics()
                        .record_batch(size, false, u64::from(retries), duration);
                    error!(
                        batch_index,
                        size,
                        duration_s = duration.as_secs_f64(),
                        retries,
                        "batch_failed"
                    );
                    metrics::counter!("showads_batches_failed").increment(1);
                }
            }

            if self.retire_if_over_target() {
                debug!(batch_index, "worker_retired");
                return;
            }
        }
    }
}

pub struct Dispatcher<S> {
    sender: Arc<S>,
    settings: DispatchSettings,
    progress: Option<ProgressCallback>,
}

impl<S: BulkSender> Dispatcher<S> {
    pub fn new(sender: Arc<S>, settings: DispatchSettings) -> Result<Self, ConfigError> {
        if settings.parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        if settings.parallelism > MAX_PARALLELISM {
            return Err(ConfigError::ParallelismTooHigh {
                requested: settings.parallelism,
                max: MAX_PARALLELISM,
            });
        }

        Ok(Self {
            sender,
            settings,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Deliver every batch and return the aggregated metrics.
    ///
    /// `batches` is consumed on a blocking thread, so it may do synchronous I/O. Per batch
    /// failures are recorded in the metrics and never abort the run.
    pub async fn run<I>(self, batches: I) -> Result<SendMetrics, PipelineError>
    where
        I: Iterator<Item = Batch> + Send + 'static,
    {
        let parallelism = self.settings.parallelism;
        let (tx, rx) = mpsc::channel::<TaggedBatch>(parallelism * 2);

        let shared = Arc::new(Shared {
            sender: self.sender,
            max_retries: self.settings.max_retries,
            progress: self.progress,
            receiver: tokio::sync::Mutex::new(rx),
            throttle: Mutex::new(Throttle {
                parallelism,
                backoff: self.settings.backoff,
            }),
            live_workers: AtomicUsize::new(parallelism),
            metrics: Mutex::new(SendMetrics::default()),
        });

        let mut workers = JoinSet::new();
        for _ in 0..parallelism {
            let shared = shared.clone();
            workers.spawn(async move { shared.work().await });
        }

        let mut producer = tokio::task::spawn_blocking(move || {
            let mut rows: u64 = 0;
            let mut count: u64 = 0;
            for batch in batches {
                count += 1;
                rows += batch.len() as u64;
                if tx.blocking_send((count, batch)).is_err() {
                    // The channel was closed after a worker failure.
                    break;
                }
            }
            (rows, count)
        });

        // Workers are joined while the producer runs, so a failed worker can unblock it.
        let mut produced = None;
        loop {
            tokio::select! {
                result = &mut producer, if produced.is_none() => produced = Some(result?),
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        error!("dispatch worker failed: {}", e);
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                        shared.receiver.lock().await.close();
                        if produced.is_none() {
                            if let Err(join) = producer.await {
                                error!("batch producer failed: {}", join);
                            }
                        }
                        return Err(PipelineError::Join(e));
                    }
                    None => break,
                },
            }
        }
        let (rows, count) = match produced {
            Some(produced) => produced,
            None => producer.await?,
        };

        let throttle = *shared.throttle();
        let mut metrics = shared.metrics().clone();
        metrics.total = rows;
        metrics.total_batches = count;
        metrics.final_parallelism = throttle.parallelism;
        metrics.final_backoff = throttle.backoff;

        info!(
            sent = metrics.sent,
            failed = metrics.failed,
            rate_limited = metrics.rate_limited,
            batches = metrics.total_batches,
            final_parallelism = metrics.final_parallelism,
            "dispatch finished"
        );

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use showads_common::batch::chunked;
    use std::sync::atomic::AtomicU64;

    fn record(i: u32) -> ValidatedRecord {
        ValidatedRecord {
            name: "Alice".to_owned(),
            age: 30,
            banner_id: (i % 100) as u8,
            cookie: format!("00000000-0000-0000-0000-{i:012}"),
        }
    }

    fn batches_of(rows: u32, size: usize) -> Vec<Batch> {
        chunked((0..rows).map(record), size).unwrap().collect()
    }

    fn settings(parallelism: usize, max_retries: u32) -> DispatchSettings {
        DispatchSettings {
            parallelism,
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    fn ok(retries: u32) -> Result<BulkResponse, ClientError> {
        Ok(BulkResponse {
            status: StatusCode::OK,
            retries,
        })
    }

    #[derive(Default)]
    struct RecordingSender {
        delivered: Mutex<Vec<Batch>>,
    }

    #[async_trait]
    impl BulkSender for RecordingSender {
        async fn send(&self, batch: &[ValidatedRecord]) -> Result<BulkResponse, ClientError> {
            self.delivered.lock().unwrap().push(batch.to_vec());
            ok(0)
        }
    }

    /// Rate limits the first `limit` calls, then accepts everything.
    struct RateLimitedSender {
        calls: AtomicU64,
        limit: u64,
    }

    impl RateLimitedSender {
        fn new(limit: u64) -> Self {
            Self {
                calls: AtomicU64::new(0),
                limit,
            }
        }
    }

    #[async_trait]
    impl BulkSender for RateLimitedSender {
        async fn send(&self, _batch: &[ValidatedRecord]) -> Result<BulkResponse, ClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.limit {
                Err(ClientError::RateLimited { attempts: 1 })
            } else {
                ok(0)
            }
        }
    }

    struct StatusSender(StatusCode);

    #[async_trait]
    impl BulkSender for StatusSender {
        async fn send(&self, _batch: &[ValidatedRecord]) -> Result<BulkResponse, ClientError> {
            Ok(BulkResponse {
                status: self.0,
                retries: 2,
            })
        }
    }

    struct PanickingSender;

    #[async_trait]
    impl BulkSender for PanickingSender {
        async fn send(&self, _batch: &[ValidatedRecord]) -> Result<BulkResponse, ClientError> {
            panic!("sender blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_sender_fails_the_run() {
        let dispatcher = Dispatcher::new(Arc::new(PanickingSender), settings(1, 0)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.run(batches_of(10, 1).into_iter()),
        )
        .await
        .expect("run should not hang when every worker dies");

        assert!(matches!(result, Err(PipelineError::Join(_))));
    }

    #[tokio::test]
    async fn test_panicking_progress_callback_fails_the_run() {
        let progress: ProgressCallback = Arc::new(|_| panic!("progress blew up"));
        let dispatcher = Dispatcher::new(Arc::new(RecordingSender::default()), settings(2, 0))
            .unwrap()
            .with_progress(progress);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.run(batches_of(20, 1).into_iter()),
        )
        .await
        .expect("run should not hang when every worker dies");

        assert!(matches!(result, Err(PipelineError::Join(_))));
    }

    #[tokio::test]
    async fn test_sends_every_batch() {
        let sender = Arc::new(RecordingSender::default());
        let batches = batches_of(5, 2);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let metrics = Dispatcher::new(sender.clone(), settings(2, 3))
            .unwrap()
            .run(batches.into_iter())
            .await
            .unwrap();

        assert_eq!(metrics.sent, 5);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.total, 5);
        assert_eq!(metrics.total_batches, 3);
        assert_eq!(metrics.final_parallelism, 2);
        assert_eq!(metrics.final_backoff, Duration::from_millis(1));

        let mut delivered: Vec<ValidatedRecord> = sender.delivered.lock().unwrap().concat();
        delivered.sort_by(|a, b| a.cookie.cmp(&b.cookie));
        assert_eq!(delivered, (0..5).map(record).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_rate_limit_shrinks_parallelism() {
        let sender = Arc::new(RateLimitedSender::new(1));

        let metrics = Dispatcher::new(sender, settings(2, 3))
            .unwrap()
            .run(batches_of(2, 1).into_iter())
            .await
            .unwrap();

        assert_eq!(metrics.rate_limited, 1);
        assert_eq!(metrics.final_parallelism, 1);
        assert_eq!(metrics.final_backoff, Duration::from_millis(2));
        assert_eq!(metrics.total_batches, 2);
        assert_eq!(metrics.sent, 2);
        assert_eq!(metrics.total_retries, 1);
        assert_eq!(metrics.max_retries, 1);
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_budget_fails_batch() {
        let sender = Arc::new(RateLimitedSender::new(u64::MAX));

        let metrics = Dispatcher::new(sender, settings(1, 2))
            .unwrap()
            .run(batches_of(3, 3).into_iter())
            .await
            .unwrap();

        assert_eq!(metrics.sent, 0);
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.rate_limited, 3);
        assert_eq!(metrics.max_retries, 3);
        assert!(metrics.is_failed_run());
    }

    #[tokio::test]
    async fn test_one_poisoned_batch_does_not_stop_the_run() {
        // Only the first batch is rate limited past its budget.
        let sender = Arc::new(RateLimitedSender::new(2));

        let metrics = Dispatcher::new(sender, settings(1, 1))
            .unwrap()
            .run(batches_of(4, 2).into_iter())
            .await
            .unwrap();

        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.sent, 2);
        assert!(!metrics.is_failed_run());
    }

    #[tokio::test]
    async fn test_server_error_response_fails_batch() {
        let sender = Arc::new(StatusSender(StatusCode::SERVICE_UNAVAILABLE));

        let metrics = Dispatcher::new(sender, settings(2, 3))
            .unwrap()
            .run(batches_of(3, 2).into_iter())
            .await
            .unwrap();

        assert_eq!(metrics.sent, 0);
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.total_retries, 4);
        assert_eq!(metrics.rate_limited, 0);
        assert_eq!(metrics.final_parallelism, 2);
    }

    #[tokio::test]
    async fn test_parallelism_never_drops_below_one() {
        let sender = Arc::new(RateLimitedSender::new(20));

        let metrics = Dispatcher::new(sender, settings(4, 1))
            .unwrap()
            .run(batches_of(30, 1).into_iter())
            .await
            .unwrap();

        assert_eq!(metrics.final_parallelism, 1);
        assert_eq!(metrics.sent + metrics.failed, 30);
        assert_eq!(metrics.rate_limited, 20);
    }

    #[tokio::test]
    async fn test_progress_reports_delivered_rows() {
        let reported = Arc::new(AtomicUsize::new(0));
        let progress: ProgressCallback = {
            let reported = reported.clone();
            Arc::new(move |rows| {
                reported.fetch_add(rows, Ordering::SeqCst);
            })
        };

        let metrics = Dispatcher::new(Arc::new(RecordingSender::default()), settings(3, 0))
            .unwrap()
            .with_progress(progress)
            .run(batches_of(7, 3).into_iter())
            .await
            .unwrap();

        assert_eq!(reported.load(Ordering::SeqCst), 7);
        assert_eq!(metrics.sent, 7);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let metrics = Dispatcher::new(Arc::new(RecordingSender::default()), settings(2, 0))
            .unwrap()
            .run(std::iter::empty())
            .await
            .unwrap();

        assert_eq!(metrics.total_batches, 0);
        assert_eq!(metrics.sent, 0);
        assert!(!metrics.is_failed_run());
    }

    #[test]
    fn test_parallelism_bounds() {
        let result = Dispatcher::new(Arc::new(RecordingSender::default()), settings(0, 0));
        assert!(matches!(result, Err(ConfigError::InvalidParallelism)));

        let result = Dispatcher::new(
            Arc::new(RecordingSender::default()),
            settings(MAX_PARALLELISM + 1, 0),
        );
        assert!(matches!(result, Err(ConfigError::ParallelismTooHigh { .. })));
    }

    #[test]
    fn test_workers_retire_down_to_target() {
        let (_tx, rx) = mpsc::channel(1);
        let shared = Shared {
            sender: Arc::new(RecordingSender::default()),
            max_retries: 0,
            progress: None,
            receiver: tokio::sync::Mutex::new(rx),
            throttle: Mutex::new(Throttle {
                parallelism: 3,
                backoff: Duration::from_millis(1),
            }),
            live_workers: AtomicUsize::new(3),
            metrics: Mutex::new(SendMetrics::default()),
        };

        assert!(!shared.retire_if_over_target());
        for _ in 0..5 {
            shared.throttle_down();
        }
        assert_eq!(shared.throttle().parallelism, 1);
        assert!(shared.retire_if_over_target());
        assert!(shared.retire_if_over_target());
        assert!(!shared.retire_if_over_target());
        assert_eq!(shared.live_workers.load(Ordering::SeqCst), 1);
    }
}
