use std::io;
use std::process::ExitCode;

use clap::Parser;
use envconfig::Envconfig;
use tracing::{error, info_span, Instrument};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

use showads_sender::cli::{self, is_config_error, Cli};
use showads_sender::config::Config;

/// Logs go to stderr so stdout carries only the JSON summary.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));

    let base_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_level(true);

    let log_layer = if *config.log_json {
        base_layer.json().with_filter(filter).boxed()
    } else {
        base_layer.with_ansi(true).with_filter(filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; the environment and defaults still apply.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    init_logging(&config);

    let span = info_span!("showads", run_id = %Uuid::new_v4(), command = cli.command.name());
    let mut stdout = io::stdout();

    match cli::run(cli, config, &mut stdout).instrument(span).await {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(e) if is_config_error(&e) => {
            eprintln!("ERROR: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("run failed: {:#}", e);
            eprintln!("ERROR: {e:#}");
            ExitCode::from(1)
        }
    }
}
