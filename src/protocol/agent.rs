//! Agent contract: declared message sets and the handler entry point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::channel::ChannelAddress;
use super::message::{Message, MessageCatalog, MessageSet};
use crate::error::{Error, Result};

/// Routing context handed to a handler alongside the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    pub message_type: String,
    pub direction: String,
    pub session_id: String,
    /// Raw channel the message arrived on.
    pub channel: String,
}

impl MessageContext {
    pub fn from_address(address: &ChannelAddress) -> Self {
        Self {
            message_type: address.type_name.clone(),
            direction: address.direction.clone(),
            session_id: address.session_id.clone(),
            channel: address.encode(),
        }
    }
}

/// A participant that sends and/or receives typed messages.
///
/// Agents are identified by name; two agents registered under the same name
/// are the same agent as far as routing is concerned.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique agent name.
    fn name(&self) -> &str;

    /// Message types this agent receives.
    fn inbound(&self) -> MessageSet;

    /// Message types this agent is allowed to send.
    fn outbound(&self) -> MessageSet;

    /// Handle one delivered message. Errors propagate to the adapter's
    /// delivery loop.
    async fn handle_message(&self, message: &Message, context: &MessageContext)
        -> anyhow::Result<()>;

    fn validate_incoming(&self, message: &Message) -> bool {
        self.inbound().contains(message.type_name())
    }

    fn validate_outgoing(&self, message: &Message) -> bool {
        self.outbound().contains(message.type_name())
    }
}

/// Fail unless `agent` may send `message`.
pub fn validate_outgoing(agent: &dyn Agent, message: &Message) -> Result<()> {
    if agent.validate_outgoing(message) {
        Ok(())
    } else {
        Err(Error::invalid_agent(
            agent.name(),
            format!(
                "{} is not in its outbound message list. Add it to the agent's outbound set.",
                message.type_name()
            ),
        ))
    }
}

/// Check an agent's declarations before it is subscribed.
pub fn validate_declarations(agent: &dyn Agent, catalog: &MessageCatalog) -> Result<()> {
    if agent.name().is_empty() {
        return Err(Error::invalid_agent("<unnamed>", "agent name must not be empty"));
    }

    let inbound = agent.inbound();
    if inbound.is_empty() {
        return Err(Error::invalid_agent(
            agent.name(),
            "missing inbound message types. Declare at least one type the agent receives.",
        ));
    }

    let unknown: Vec<&str> = inbound
        .iter()
        .filter(|name| !catalog.contains(name))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::invalid_agent(
            agent.name(),
            format!(
                "references unregistered message type(s): {}. Register them in the catalog first.",
                unknown.join(", ")
            ),
        ));
    }

    Ok(())
}
