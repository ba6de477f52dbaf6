//! Classdesk CLI - a command-line client for the classdesk learning platform.
//!
//! Logs in and out, keeps the session between runs, and issues
//! authenticated requests against the backend.

mod commands;

use std::io;
use std::process::ExitCode;

use anyhow::Result;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use classdesk_core::{App, Config};

/// Initialize the tracing subscriber for logging.
/// Returns the guard that flushes the log file on drop.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.log_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "classdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    // Dropped on return so the file appender flushes
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = commands::Command::parse(&args) else {
        eprintln!("{}", commands::USAGE);
        return ExitCode::from(2);
    };

    info!(?command, "Classdesk CLI starting");
    let result = run(config, command).await;
    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
    }
    ExitCode::from(exit_status(&result))
}

/// Process exit status for a finished command.
fn exit_status(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

async fn run(config: Config, command: commands::Command) -> Result<()> {
    let mut app = App::open(config)?;
    commands::run(&mut app, command).await
}
