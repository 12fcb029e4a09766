//! deskflow - multi-tenant customer-support conversation lifecycle pipeline.

use clap::Parser;
use std::process::ExitCode;

use deskflow::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = match logging::LogOptions::from_env().and_then(|o| logging::init(&o)) {
        Ok((guard, _log_dir)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Commands::parse();

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
