//! Broker adapters.

use std::sync::Arc;

pub mod adapter;
pub mod pubsub;
pub mod topic;

pub use adapter::{BrokerAdapter, SubscriptionHandle};
pub use pubsub::{PubSubAdapter, PubSubHub};
pub use topic::{TopicAdapter, TopicExchange};

use crate::config::{BrokerKind, BrokerSettings};

/// Adapter factory.
pub fn create_adapter(settings: &BrokerSettings) -> Arc<dyn BrokerAdapter> {
    match settings.kind {
        BrokerKind::PubSub => Arc::new(PubSubAdapter::new()),
        BrokerKind::Topic => Arc::new(TopicAdapter::new(
            &settings.exchange,
            &settings.queue_prefix,
        )),
    }
}
