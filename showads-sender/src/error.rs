use std::io;

use http::StatusCode;
use showads_common::error::ConfigError;
use thiserror::Error;

/// Enumeration of errors that can occur while obtaining an access token.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("auth endpoint responded with {0}")]
    Status(StatusCode),
    #[error("failed to parse auth response: {0}")]
    Parse(#[source] reqwest::Error),
}

/// Enumeration of errors `ShowAdsClient::send_batch` can return once its local retry budget is
/// spent. A 5xx response that exhausts the budget is not an error: the response is returned.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("bulk request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::RateLimited { .. })
    }
}

/// Enumeration of errors raised while opening a CSV input.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Enumeration of errors that abort a whole pipeline run before or while it runs.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("dispatcher task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
