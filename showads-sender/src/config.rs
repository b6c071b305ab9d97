use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use showads_common::error::ConfigError;
use showads_common::retry::RetryPolicy;

use crate::dispatcher::{DispatchSettings, MAX_PARALLELISM};
use crate::pipeline::PipelineSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A duration given in (possibly fractional) seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvSecsDuration(pub Duration);

impl FromStr for EnvSecsDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("Invalid duration in seconds {}: {}", s, e))?;
        Duration::try_from_secs_f64(secs)
            .map(EnvSecsDuration)
            .map_err(|e| format!("Invalid duration in seconds {}: {}", s, e))
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "SHOWADS_BASE_URL", default = "https://api.showads.example.com")]
    pub base_url: String,

    // Never log this.
    #[envconfig(from = "SHOWADS_PROJECT_KEY", default = "")]
    pub project_key: String,

    #[envconfig(from = "MIN_AGE", default = "18")]
    pub min_age: i64,

    #[envconfig(from = "MAX_AGE", default = "99")]
    pub max_age: i64,

    #[envconfig(from = "REQUEST_TIMEOUT_SECONDS", default = "10")]
    pub request_timeout: EnvSecsDuration,

    #[envconfig(from = "MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "RETRY_BACKOFF_SECONDS", default = "1.0")]
    pub retry_backoff: EnvSecsDuration,

    #[envconfig(from = "BULK_BATCH_SIZE", default = "1000")]
    pub bulk_batch_size: usize,

    #[envconfig(from = "PARALLEL_REQUESTS", default = "4")]
    pub parallel_requests: usize,

    // Unset remembers every key for the whole run.
    #[envconfig(from = "DEDUP_WINDOW")]
    pub dedup_window: Option<usize>,

    #[envconfig(from = "LOG_JSON", default = "false")]
    pub log_json: FlexBool,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("project_key", &"<redacted>")
            .field("min_age", &self.min_age)
            .field("max_age", &self.max_age)
            .field("request_timeout", &self.request_timeout.0)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff.0)
            .field("bulk_batch_size", &self.bulk_batch_size)
            .field("parallel_requests", &self.parallel_requests)
            .field("dedup_window", &self.dedup_window)
            .field("log_json", &self.log_json.0)
            .field("log_level", &self.log_level)
            .finish()
    }
}

/// Values given on the command line. Each one that is set wins over the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,
    pub bulk_batch_size: Option<usize>,
    pub parallel_requests: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub dedup_window: Option<usize>,
}

impl Config {
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(min_age) = overrides.min_age {
            self.min_age = min_age;
        }
        if let Some(max_age) = overrides.max_age {
            self.max_age = max_age;
        }
        if let Some(size) = overrides.bulk_batch_size {
            self.bulk_batch_size = size;
        }
        if let Some(parallel) = overrides.parallel_requests {
            self.parallel_requests = parallel;
        }
        if let Some(retries) = overrides.max_retries {
            self.max_retries = retries;
        }
        if let Some(backoff) = overrides.retry_backoff {
            self.retry_backoff = EnvSecsDuration(backoff);
        }
        if let Some(window) = overrides.dedup_window {
            self.dedup_window = Some(window);
        }
    }

    /// Reject settings no run can work with. Batch sizes above the API limit are clamped later,
    /// not rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bulk_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.dedup_window == Some(0) {
            return Err(ConfigError::InvalidDedupWindow);
        }
        if self.parallel_requests == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        if self.parallel_requests > MAX_PARALLELISM {
            return Err(ConfigError::ParallelismTooHigh {
                requested: self.parallel_requests,
                max: MAX_PARALLELISM,
            });
        }
        if self.min_age > self.max_age {
            return Err(ConfigError::InvalidAgeRange {
                min: self.min_age,
                max: self.max_age,
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_backoff.0)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_age: self.min_age,
            max_age: self.max_age,
            batch_size: self.bulk_batch_size,
            dedup_window: self.dedup_window,
            dispatch: DispatchSettings {
                parallelism: self.parallel_requests,
                max_retries: self.max_retries,
                backoff: self.retry_backoff.0,
            },
        }
    }
}
