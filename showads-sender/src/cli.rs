use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use showads_common::error::ConfigError;
use showads_common::processor::ErrorSink;
use showads_common::stats::SendMetrics;
use tracing::{debug, info};

use crate::client::ShowAdsClient;
use crate::config::{Config, ConfigOverrides, EnvSecsDuration};
use crate::dispatcher::ProgressCallback;
use crate::error::{PipelineError, SourceError};
use crate::pipeline::Pipeline;
use crate::sink::CsvErrorSink;
use crate::source::CsvRowSource;

#[derive(Parser, Debug)]
#[command(
    name = "showads",
    version,
    about = "Validate banner view CSVs and deliver them to the ShowAds bulk API",
    long_about = None
)]
pub struct Cli {
    /// Minimum accepted age (overrides MIN_AGE)
    #[arg(long, global = true)]
    min_age: Option<i64>,

    /// Maximum accepted age (overrides MAX_AGE)
    #[arg(long, global = true)]
    max_age: Option<i64>,

    /// Records per bulk request, at most 1000 (overrides BULK_BATCH_SIZE)
    #[arg(long, global = true)]
    bulk_batch_size: Option<usize>,

    /// Concurrent bulk requests (overrides PARALLEL_REQUESTS)
    #[arg(long, global = true)]
    parallel_requests: Option<usize>,

    /// Retries per batch (overrides MAX_RETRIES)
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Base retry backoff in seconds (overrides RETRY_BACKOFF_SECONDS)
    #[arg(long, global = true)]
    retry_backoff: Option<EnvSecsDuration>,

    /// Number of recent unique (cookie, banner_id) keys remembered (overrides DEDUP_WINDOW)
    #[arg(long, global = true)]
    dedup_window: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a CSV and print a summary, without network access
    Validate {
        csv: PathBuf,

        /// Write rejected rows with their reason to this CSV
        #[arg(long)]
        errors_out: Option<PathBuf>,
    },
    /// Validate, deduplicate and deliver a CSV in batches
    Send {
        csv: PathBuf,

        /// Report what would be sent without contacting the API
        #[arg(long)]
        dry_run: bool,

        /// Write rejected rows with their reason to this CSV
        #[arg(long)]
        errors_out: Option<PathBuf>,

        /// Write the full delivery metrics as JSON to this file
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Validate { .. } => "validate",
            Commands::Send { .. } => "send",
        }
    }
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            min_age: self.min_age,
            max_age: self.max_age,
            bulk_batch_size: self.bulk_batch_size,
            parallel_requests: self.parallel_requests,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff.map(|backoff| backoff.0),
            dedup_window: self.dedup_window,
        }
    }
}

/// How a command that did not error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Nothing was delivered while some rows failed.
    FailedRun,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::FailedRun => 1,
        }
    }
}

/// Whether `error` stems from unusable configuration or input headers rather than a failed run.
pub fn is_config_error(error: &anyhow::Error) -> bool {
    error.downcast_ref::<ConfigError>().is_some()
        || matches!(
            error.downcast_ref::<SourceError>(),
            Some(SourceError::Config(_))
        )
        || matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::Config(_))
        )
}

fn open_error_sink(path: Option<&Path>) -> anyhow::Result<Option<Box<dyn ErrorSink + Send>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let sink = CsvErrorSink::create(path)
        .with_context(|| format!("failed to create errors file {}", path.display()))?;
    Ok(Some(Box::new(sink)))
}

fn write_metrics(path: &Path, metrics: &SendMetrics) -> anyhow::Result<()> {
    let mut value = serde_json::to_value(metrics)?;
    value["avg_batch_time_s"] = json!(metrics.avg_batch_time().as_secs_f64());

    let file = File::create(path)
        .with_context(|| format!("failed to create metrics file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &value)?;
    writer.flush()?;
    Ok(())
}

fn progress_logger() -> ProgressCallback {
    let delivered = Arc::new(AtomicU64::new(0));
    Arc::new(move |rows| {
        let total = delivered.fetch_add(rows as u64, Ordering::Relaxed) + rows as u64;
        debug!(rows_sent = total, "progress");
    })
}

/// Execute the parsed command against `config`, printing the JSON summary to `out`.
pub async fn run<W: Write>(cli: Cli, mut config: Config, out: &mut W) -> anyhow::Result<RunStatus> {
    config.apply(&cli.overrides());
    config.validate()?;
    let pipeline = Pipeline::new(config.pipeline_settings())?;

    match cli.command {
        Commands::Validate { csv, errors_out } => {
            let source = CsvRowSource::open(&csv)?;
            let sink = open_error_sink(errors_out.as_deref())?;
            let summary = pipeline.validate_only(source, sink)?;

            info!(valid = summary.valid, invalid = summary.invalid, "validation finished");
            let report = json!({
                "valid": summary.valid,
                "invalid": summary.invalid,
                "unique": summary.unique
            });
            writeln!(out, "{report}")?;
            Ok(RunStatus::Success)
        }
        Commands::Send {
            csv,
            dry_run,
            errors_out,
            metrics_out,
        } => {
            let source = CsvRowSource::open(&csv)?;
            let sink = open_error_sink(errors_out.as_deref())?;

            if dry_run {
                let summary = pipeline.dry_run(source, sink)?;
                writeln!(out, "{}", serde_json::to_string(&summary)?)?;
                return Ok(RunStatus::Success);
            }

            let client = ShowAdsClient::new(
                &config.base_url,
                &config.project_key,
                config.request_timeout.0,
                config.retry_policy(),
            )
            .context("failed to build HTTP client")?;

            let metrics = pipeline
                .run(source, sink, Arc::new(client), Some(progress_logger()))
                .await?;

            if let Some(path) = metrics_out {
                write_metrics(&path, &metrics)?;
            }
            writeln!(
                out,
                "{}",
                json!({"rows_sent": metrics.sent, "rows_failed": metrics.failed})
            )?;

            if metrics.is_failed_run() {
                Ok(RunStatus::FailedRun)
            } else {
                Ok(RunStatus::Success)
            }
        }
    }
}
