//! agentbus - typed pub/sub routing between agents.
//!
//! Command line entry point.

use clap::Parser;
use std::process::ExitCode;

use agentbus::cli::Commands;
use agentbus::config::{load_settings, load_settings_from, Settings};
use agentbus::logging;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    let loaded = match &args.config {
        Some(path) => match load_settings_from(path) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => load_settings(),
    };
    let (settings, load_error) = match loaded {
        Ok(settings) => (settings, None),
        Err(e) => (Settings::default(), Some(e)),
    };

    // Initialize logging
    let _guard = match logging::init(&settings.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(e) = load_error {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
    }

    // Run the command
    match args.run(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
