//! Configuration loading for agentbus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the agentbus home directory (~/.agentbus).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentbus"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agentbus/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Run 'agentbus config --init' to create one.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings as pretty JSON, creating parent directories.
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    validate_settings(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    tracing::info!("Wrote settings to {}", path.display());
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.broker.exchange.trim().is_empty() {
        return Err(Error::Config("broker.exchange must not be empty".to_string()));
    }
    if settings.broker.queue_prefix.trim().is_empty() {
        return Err(Error::Config(
            "broker.queue_prefix must not be empty".to_string(),
        ));
    }
    if let Some(level) = settings.logging.level.as_deref() {
        if level.trim().is_empty() {
            return Err(Error::Config(
                "logging.level must not be blank; remove it to use the default".to_string(),
            ));
        }
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Which in-process broker backs the router.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Pub/sub hub with glob pattern subscriptions.
    #[default]
    #[value(name = "pubsub")]
    PubSub,
    /// Topic exchange with binding keys.
    Topic,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::PubSub => write!(f, "pubsub"),
            BrokerKind::Topic => write!(f, "topic"),
        }
    }
}

/// Log level for a dropped delivery nobody was subscribed to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

/// Broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BrokerSettings {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
}

fn default_exchange() -> String {
    "agent_communication".to_string()
}

fn default_queue_prefix() -> String {
    "agentbus".to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            exchange: default_exchange(),
            queue_prefix: default_queue_prefix(),
        }
    }
}

/// Dispatch configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DispatchSettings {
    #[serde(default)]
    pub no_agent_severity: LogSeverity,
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LoggingSettings {
    /// EnvFilter directive; `RUST_LOG` still wins when set.
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_file")]
    pub file: bool,
    pub directory: Option<PathBuf>,
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            file: default_log_file(),
            directory: None,
        }
    }
}

/// agentbus settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}
