pub mod batch;
pub mod dedup;
pub mod error;
pub mod processor;
pub mod record;
pub mod retry;
pub mod stats;
pub mod validation;
