//! Broker adapter trait for agentbus.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use crate::core::DeliverySink;
use crate::error::Result;
use crate::protocol::Pattern;

/// Opaque id of one broker-level subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(Ulid);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// A concrete broker behind the router.
///
/// Adapters own their delivery loop. Every received item goes to the sink of
/// the subscription it arrived through, or, if that subscription was dropped
/// while the item was queued, to any live subscription still matching it. The
/// loop waits for the sink before moving on. One physical message reaches a
/// connection at most once, however many of its subscriptions match.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Adapter name, used in logs and errors.
    fn name(&self) -> &str;

    /// Open the connection. Connecting twice is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Publish a payload on a concrete channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to every channel matching `pattern`.
    async fn subscribe(
        &self,
        pattern: &Pattern,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<SubscriptionHandle>;

    /// Drop a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    /// Whether the connection is usable right now.
    async fn health_check(&self) -> bool;

    /// Close the connection and drop every subscription. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_handles_are_distinct_and_ordered() {
        let handles: BTreeSet<SubscriptionHandle> =
            (0..16).map(|_| SubscriptionHandle::new()).collect();
        assert_eq!(handles.len(), 16);
        let first = handles.iter().next().copied().unwrap();
        assert!(first.to_string().starts_with("sub_"));
    }
}
