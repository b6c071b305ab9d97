pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod source;
