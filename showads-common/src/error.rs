use thiserror::Error;

/// Enumeration of reasons a single field can be rejected.
/// Each variant carries the human readable reason that ends up in the error rows output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    InvalidName(String),
    #[error("{0}")]
    InvalidAge(String),
    #[error("{0}")]
    InvalidBannerId(String),
    #[error("{0}")]
    InvalidCookie(String),
}

impl ValidationError {
    /// Stable identifier of the error kind, used as a metrics/log label.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::InvalidName(_) => "invalid_name",
            ValidationError::InvalidAge(_) => "invalid_age",
            ValidationError::InvalidBannerId(_) => "invalid_banner_id",
            ValidationError::InvalidCookie(_) => "invalid_cookie",
        }
    }
}

/// Enumeration of fatal configuration errors. These are raised before any row is processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("CSV must contain headers: {}", .0.join(", "))]
    MissingHeaders(Vec<String>),
    #[error("duplicate headers detected: {}", .0.join(", "))]
    DuplicateHeaders(Vec<String>),
    #[error("batch size must be greater than 0")]
    InvalidBatchSize,
    #[error("dedup window must be greater than 0 when set")]
    InvalidDedupWindow,
    #[error("parallelism must be greater than 0")]
    InvalidParallelism,
    #[error("parallelism {requested} exceeds the limit of {max}")]
    ParallelismTooHigh { requested: usize, max: usize },
    #[error("min age {min} is greater than max age {max}")]
    InvalidAgeRange { min: i64, max: i64 },
}
