//! Inbound dispatch: raw (channel, payload) deliveries to agent handlers.
//!
//! Inbound-path failures (bad channel, unknown type, bad payload, nobody
//! listening) are logged and dropped here, with a counter per kind. They never
//! cross back into the adapter as errors. Handler failures do propagate,
//! after every matched agent has had its turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::registry::SubscriptionRegistry;
use crate::config::LogSeverity;
use crate::error::{Error, HandlerFailure, Result};
use crate::protocol::{channel, MessageCatalog, MessageContext};

/// What happened to one delivery.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handlers ran for this many agents.
    Delivered { agents: usize },
    /// The item was dropped on the inbound path.
    Dropped(Error),
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

/// Receiver side of a broker subscription. Adapters call `deliver` once per
/// received item and wait for it before acknowledging or moving on.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, adapter: &str, channel: &str, payload: &[u8])
        -> Result<DispatchOutcome>;
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub received: u64,
    pub delivered: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub invalid_channel: u64,
    pub unknown_type: u64,
    pub deserialization_errors: u64,
    pub no_agent: u64,
}

impl DispatchStats {
    /// Items dropped on the inbound path, for any reason.
    pub fn routing_errors(&self) -> u64 {
        self.invalid_channel + self.unknown_type + self.deserialization_errors + self.no_agent
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
    invalid_channel: AtomicU64,
    unknown_type: AtomicU64,
    deserialization_errors: AtomicU64,
    no_agent: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Decodes deliveries and invokes matching agents.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<MessageCatalog>,
    no_agent_severity: LogSeverity,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<MessageCatalog>,
        no_agent_severity: LogSeverity,
    ) -> Self {
        Self {
            registry,
            catalog,
            no_agent_severity,
            counters: Counters::default(),
        }
    }

    /// Dispatch one raw delivery.
    pub async fn dispatch(
        &self,
        adapter: &str,
        raw_channel: &str,
        payload: &[u8],
    ) -> Result<DispatchOutcome> {
        bump(&self.counters.received);

        let address = match channel::decode(raw_channel) {
            Ok(address) => address,
            Err(e) => {
                bump(&self.counters.invalid_channel);
                tracing::warn!(adapter, channel = raw_channel, error = %e, "Dropping delivery with malformed channel");
                return Ok(DispatchOutcome::Dropped(e));
            }
        };

        let message = match self.catalog.decode(&address.type_name, payload) {
            Ok(message) => message,
            Err(e) => {
                if matches!(e, Error::MessageClassNotRegistered { .. }) {
                    bump(&self.counters.unknown_type);
                } else {
                    bump(&self.counters.deserialization_errors);
                }
                tracing::warn!(adapter, channel = raw_channel, kind = e.kind(), error = %e, "Dropping undecodable delivery");
                return Ok(DispatchOutcome::Dropped(e));
            }
        };

        let agents: Vec<_> = self
            .registry
            .resolve(&address)
            .into_iter()
            .filter(|agent| agent.validate_incoming(&message))
            .collect();

        if agents.is_empty() {
            bump(&self.counters.no_agent);
            let e = Error::NoAgentFound {
                message_type: address.type_name.clone(),
                channel: raw_channel.to_string(),
            };
            self.log_no_agent(adapter, raw_channel, &e);
            return Ok(DispatchOutcome::Dropped(e));
        }

        let context = MessageContext::from_address(&address);
        let mut failures = Vec::new();
        for agent in &agents {
            bump(&self.counters.handler_invocations);
            match agent.handle_message(&message, &context).await {
                Ok(()) => {
                    tracing::debug!(adapter, channel = raw_channel, agent = agent.name(), "Delivered message");
                }
                Err(error) => {
                    bump(&self.counters.handler_failures);
                    tracing::error!(adapter, channel = raw_channel, agent = agent.name(), error = %error, "Handler failed");
                    failures.push(HandlerFailure {
                        agent: agent.name().to_string(),
                        error,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::Handler {
                message_type: address.type_name,
                failures,
            });
        }

        bump(&self.counters.delivered);
        Ok(DispatchOutcome::Delivered {
            agents: agents.len(),
        })
    }

    fn log_no_agent(&self, adapter: &str, raw_channel: &str, e: &Error) {
        match self.no_agent_severity {
            LogSeverity::Debug => tracing::debug!(adapter, channel = raw_channel, error = %e, "No agent for delivery"),
            LogSeverity::Info => tracing::info!(adapter, channel = raw_channel, error = %e, "No agent for delivery"),
            LogSeverity::Warn => tracing::warn!(adapter, channel = raw_channel, error = %e, "No agent for delivery"),
            LogSeverity::Error => tracing::error!(adapter, channel = raw_channel, error = %e, "No agent for delivery"),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            received: c.received.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_invocations: c.handler_invocations.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            invalid_channel: c.invalid_channel.load(Ordering::Relaxed),
            unknown_type: c.unknown_type.load(Ordering::Relaxed),
            deserialization_errors: c.deserialization_errors.load(Ordering::Relaxed),
            no_agent: c.no_agent.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DeliverySink for Dispatcher {
    async fn deliver(
        &self,
        adapter: &str,
        channel: &str,
        payload: &[u8],
    ) -> Result<DispatchOutcome> {
        self.dispatch(adapter, channel, payload).await
    }
}
