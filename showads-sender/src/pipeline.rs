//! # Pipeline
//!
//! Composition of row source, record validator, deduplicator, batcher and dispatcher.
use std::sync::Arc;

use serde::Serialize;
use showads_common::batch::{batches, effective_batch_size};
use showads_common::dedup::{Deduplicator, SharedDedupStore};
use showads_common::error::ConfigError;
use showads_common::processor::{ErrorSink, RecordValidator, RowSource};
use showads_common::record::ValidatedRecord;
use showads_common::stats::{ParseStats, ParseSummary, SendMetrics};
use tracing::info;

use crate::dispatcher::{
    BulkSender, DispatchSettings, Dispatcher, ProgressCallback, MAX_PARALLELISM,
};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub min_age: i64,
    pub max_age: i64,
    /// Requested batch size; clamped to the API limit.
    pub batch_size: usize,
    pub dedup_window: Option<usize>,
    pub dispatch: DispatchSettings,
}

/// What a run without network would have sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DryRunSummary {
    pub rows_would_send: u64,
    pub batches: u64,
    #[serde(skip)]
    pub parse: ParseSummary,
}

pub struct Pipeline {
    settings: PipelineSettings,
    batch_size: usize,
    /// Caller supplied dedup state. Without one every run starts from an empty set.
    dedup_store: Option<SharedDedupStore>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings) -> Result<Self, ConfigError> {
        let batch_size = effective_batch_size(settings.batch_size)?;
        if settings.dedup_window == Some(0) {
            return Err(ConfigError::InvalidDedupWindow);
        }
        if settings.dispatch.parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        if settings.dispatch.parallelism > MAX_PARALLELISM {
            return Err(ConfigError::ParallelismTooHigh {
                requested: settings.dispatch.parallelism,
                max: MAX_PARALLELISM,
            });
        }
        if settings.min_age > settings.max_age {
            return Err(ConfigError::InvalidAgeRange {
                min: settings.min_age,
                max: settings.max_age,
            });
        }

        Ok(Self {
            settings,
            batch_size,
            dedup_store: None,
        })
    }

    /// Use `store` for dedup membership, so keys survive the run or can be seeded beforehand.
    pub fn with_dedup_store(mut self, store: SharedDedupStore) -> Self {
        self.dedup_store = Some(store);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Valid, deduplicated records of `source`. Fails before reading a row when the headers
    /// are unusable.
    fn records<R: RowSource>(
        &self,
        source: R,
        error_sink: Option<Box<dyn ErrorSink + Send>>,
        stats: Arc<ParseStats>,
    ) -> Result<impl Iterator<Item = ValidatedRecord>, ConfigError> {
        let mut validator = RecordValidator::new(
            source,
            self.settings.min_age,
            self.settings.max_age,
            stats.clone(),
        )?;
        if let Some(sink) = error_sink {
            validator = validator.with_error_sink(sink);
        }

        Deduplicator::with_store(
            validator,
            self.settings.dedup_window,
            self.dedup_store.clone().unwrap_or_default(),
            stats,
        )
    }

    /// Validate and deduplicate without batching or sending.
    pub fn validate_only<R: RowSource>(
        &self,
        source: R,
        error_sink: Option<Box<dyn ErrorSink + Send>>,
    ) -> Result<ParseSummary, ConfigError> {
        let stats = Arc::new(ParseStats::new());
        let records = self.records(source, error_sink, stats.clone())?;
        records.for_each(drop);

        Ok(stats.summary())
    }

    /// Validate, deduplicate and batch without sending.
    pub fn dry_run<R: RowSource>(
        &self,
        source: R,
        error_sink: Option<Box<dyn ErrorSink + Send>>,
    ) -> Result<DryRunSummary, ConfigError> {
        let stats = Arc::new(ParseStats::new());
        let records = self.records(source, error_sink, stats.clone())?;

        let mut rows_would_send: u64 = 0;
        let mut batch_count: u64 = 0;
        for batch in batches(records, self.batch_size)? {
            rows_would_send += batch.len() as u64;
            batch_count += 1;
        }

        Ok(DryRunSummary {
            rows_would_send,
            batches: batch_count,
            parse: stats.summary(),
        })
    }

    /// Run the whole pipeline and return the delivery metrics, including the validation and
    /// dedup counts.
    pub async fn run<R, S>(
        &self,
        source: R,
        error_sink: Option<Box<dyn ErrorSink + Send>>,
        sender: Arc<S>,
        progress: Option<ProgressCallback>,
    ) -> Result<SendMetrics, PipelineError>
    where
        R: RowSource + Send + 'static,
        S: BulkSender,
    {
        let stats = Arc::new(ParseStats::new());
        let records = self.records(source, error_sink, stats.clone())?;
        let batches = batches(records, self.batch_size)?;

        let mut dispatcher = Dispatcher::new(sender, self.settings.dispatch)?;
        if let Some(progress) = progress {
            dispatcher = dispatcher.with_progress(progress);
        }

        info!(
            batch_size = self.batch_size,
            parallelism = self.settings.dispatch.parallelism,
            "starting delivery"
        );
        let mut metrics = dispatcher.run(batches).await?;
        metrics.merge_parse_summary(stats.summary());

        Ok(metrics)
    }
}
