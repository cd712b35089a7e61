//! Logging setup for agentbus using tracing.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;

const DEFAULT_FILTER: &str = "info,agentbus=debug";
const LOG_FILE_NAME: &str = "agentbus.log";

/// Initialize logging with console output and, when enabled, a daily rolling
/// file. The returned guard flushes the file writer when dropped.
pub fn init(settings: &LoggingSettings) -> Result<Option<(WorkerGuard, PathBuf)>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_deref().unwrap_or(DEFAULT_FILTER)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    if !settings.file {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .init();
        return Ok(None);
    }

    let log_dir = match &settings.directory {
        Some(dir) => dir.clone(),
        None => get_log_dir()?,
    };
    std::fs::create_dir_all(&log_dir)?;

    // Create file appender with rotation
    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (text_layer, json_layer) = if settings.json {
        let layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(text_layer)
        .with(json_layer)
        .init();

    tracing::info!("agentbus logging initialized");
    tracing::info!("Log directory: {}", log_dir.display());

    Ok(Some((guard, log_dir)))
}

/// Get the default log directory path.
pub fn get_log_dir() -> Result<PathBuf> {
    let home = directories::ProjectDirs::from("com", "agentbus", "agentbus")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(home.data_dir().join("logs"))
}

/// Initialize logging for tests (console only, no file). Safe to call from
/// several tests.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
