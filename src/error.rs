//! Error types for agentbus.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Expected layout of a concrete channel, used in error hints.
pub const EXPECTED_CHANNEL_FORMAT: &str = "MessageClass:direction:session_id";

/// One handler that failed while a message was being dispatched.
#[derive(Debug)]
pub struct HandlerFailure {
    pub agent: String,
    pub error: anyhow::Error,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel '{channel}' has invalid format. Expected: '{expected}', got: '{channel}'")]
    InvalidChannelFormat { channel: String, expected: String },

    #[error("Message class '{class_name}' not found in registry.{}", available_hint(.available))]
    MessageClassNotRegistered {
        class_name: String,
        available: Vec<String>,
    },

    #[error("No agent registered to handle {message_type} on '{channel}'. Register an agent with this message type in its inbound list.")]
    NoAgentFound { message_type: String, channel: String },

    #[error("Agent {agent} rejected: {reason}")]
    InvalidAgent { agent: String, reason: String },

    #[error("Failed to deserialize {class_name}: {reason}")]
    Deserialization { class_name: String, reason: String },

    #[error("Message {class_name} failed schema validation: {reason}")]
    SchemaValidation { class_name: String, reason: String },

    #[error("Connection error ({adapter}): {reason}")]
    Connection { adapter: String, reason: String },

    #[error("Publish to '{channel}' failed ({adapter}): {reason}")]
    Publish {
        adapter: String,
        channel: String,
        reason: String,
    },

    #[error("{} handler(s) failed for {message_type}: {}", .failures.len(), failed_agents(.failures))]
    Handler {
        message_type: String,
        failures: Vec<HandlerFailure>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_channel(channel: impl Into<String>) -> Self {
        Error::InvalidChannelFormat {
            channel: channel.into(),
            expected: EXPECTED_CHANNEL_FORMAT.to_string(),
        }
    }

    pub fn invalid_agent(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidAgent {
            agent: agent.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(adapter: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Connection {
            adapter: adapter.into(),
            reason: reason.into(),
        }
    }

    pub fn publish(
        adapter: impl Into<String>,
        channel: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Publish {
            adapter: adapter.into(),
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidChannelFormat { .. } => "invalid_channel_format",
            Error::MessageClassNotRegistered { .. } => "message_class_not_registered",
            Error::NoAgentFound { .. } => "no_agent_found",
            Error::InvalidAgent { .. } => "invalid_agent",
            Error::Deserialization { .. } => "deserialization",
            Error::SchemaValidation { .. } => "schema_validation",
            Error::Connection { .. } => "connection",
            Error::Publish { .. } => "publish",
            Error::Handler { .. } => "handler",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

fn available_hint(available: &[String]) -> String {
    let mut hint = String::new();
    if !available.is_empty() {
        hint.push_str(&format!(" Available classes: {}.", available.join(", ")));
    }
    hint.push_str(" Did you forget to register this message type in the catalog?");
    hint
}

fn failed_agents(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.agent, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}
