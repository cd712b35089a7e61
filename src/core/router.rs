//! Router: the registry, catalog and dispatcher wired to one broker adapter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::dispatcher::{DeliverySink, DispatchStats, Dispatcher};
use super::registry::{BrokerPlan, SubscriptionRegistry};
use crate::brokers::{BrokerAdapter, SubscriptionHandle};
use crate::config::LogSeverity;
use crate::error::{Error, Result};
use crate::protocol::{channel, validate_outgoing, Agent, Message, MessageCatalog, Pattern};

/// Routes typed messages between agents over a broker adapter.
pub struct Router {
    adapter: Arc<dyn BrokerAdapter>,
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<MessageCatalog>,
    dispatcher: Arc<Dispatcher>,
    /// Broker subscriptions currently held, keyed by carrier pattern. The
    /// lock also serializes every broker-level mutation.
    handles: Mutex<BTreeMap<Pattern, SubscriptionHandle>>,
    connected: AtomicBool,
}

impl Router {
    pub fn new(adapter: Arc<dyn BrokerAdapter>, catalog: Arc<MessageCatalog>) -> Self {
        Self::with_severity(adapter, catalog, LogSeverity::default())
    }

    /// Router whose no-agent drops are logged at `no_agent_severity`.
    pub fn with_severity(
        adapter: Arc<dyn BrokerAdapter>,
        catalog: Arc<MessageCatalog>,
        no_agent_severity: LogSeverity,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            no_agent_severity,
        ));
        Self {
            adapter,
            registry,
            catalog,
            dispatcher,
            handles: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn catalog(&self) -> &Arc<MessageCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect the adapter and subscribe every pattern registered so far.
    pub async fn connect(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        self.adapter.connect().await?;
        self.connected.store(true, Ordering::SeqCst);

        let pending = BrokerPlan {
            subscribe: self.registry.broker_patterns(),
            unsubscribe: Vec::new(),
        };
        self.apply(&mut handles, &pending).await?;
        tracing::info!(adapter = self.adapter.name(), subscriptions = handles.len(), "Router connected");
        Ok(())
    }

    /// Release every broker subscription, forget all agents and close the
    /// adapter. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        self.registry.clear();
        if !self.connected.swap(false, Ordering::SeqCst) {
            handles.clear();
            return Ok(());
        }

        let held = std::mem::take(&mut *handles);
        for (pattern, handle) in held {
            if let Err(e) = self.adapter.unsubscribe(handle).await {
                tracing::warn!(adapter = self.adapter.name(), pattern = %pattern, error = %e, "Failed to release subscription");
            }
        }
        self.adapter.close().await?;
        tracing::info!(adapter = self.adapter.name(), "Router closed");
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        let healthy = self.adapter.health_check().await;
        if !healthy {
            tracing::warn!(adapter = self.adapter.name(), "Health check failed");
        }
        healthy
    }

    /// Publish on the channel the message type derives from `direction` and
    /// `session_id`.
    pub async fn publish(&self, message: &Message, direction: &str, session_id: &str) -> Result<()> {
        let address = message.channel_of(direction, session_id)?;
        self.publish_to(message, &address.encode()).await
    }

    /// Same as [`Router::publish`].
    pub async fn broadcast(&self, message: &Message, direction: &str, session_id: &str) -> Result<()> {
        self.publish(message, direction, session_id).await
    }

    /// Publish on an explicit concrete channel.
    pub async fn publish_to(&self, message: &Message, channel_name: &str) -> Result<()> {
        if !self.catalog.contains(message.type_name()) {
            return Err(Error::MessageClassNotRegistered {
                class_name: message.type_name().to_string(),
                available: self.catalog.names(),
            });
        }

        let address = channel::decode(channel_name)?;
        if !address.is_concrete() {
            return Err(Error::publish(
                self.adapter.name(),
                channel_name,
                "wildcard '*' is only valid in subscription patterns",
            ));
        }
        if address.type_name != message.type_name() {
            return Err(Error::publish(
                self.adapter.name(),
                channel_name,
                format!(
                    "channel carries {} but the message is {}",
                    address.type_name,
                    message.type_name()
                ),
            ));
        }

        let payload = message.to_bytes()?;
        self.adapter.publish(channel_name, &payload).await?;
        tracing::debug!(adapter = self.adapter.name(), channel = channel_name, message_type = message.type_name(), "Published message");
        Ok(())
    }

    /// Publish on behalf of `agent`, which must list the type as outbound.
    pub async fn send(
        &self,
        agent: &dyn Agent,
        message: &Message,
        direction: &str,
        session_id: &str,
    ) -> Result<()> {
        validate_outgoing(agent, message)?;
        self.publish(message, direction, session_id).await
    }

    /// Register an agent: one `Type:*:*` subscription per inbound type.
    pub async fn register(&self, agent: &Arc<dyn Agent>) -> Result<()> {
        let mut handles = self.handles.lock().await;
        let held = self.registry.patterns_of(agent.name());
        let plan = self.registry.auto_subscribe(agent, &self.catalog)?;
        if let Err(e) = self.apply(&mut handles, &plan).await {
            // Only undo what this call added; earlier subscriptions stay.
            let mut undo = BrokerPlan::default();
            for pattern in self.registry.patterns_of(agent.name()) {
                if !held.contains(&pattern) {
                    undo.merge(self.registry.remove(agent.name(), &pattern));
                }
            }
            self.apply_best_effort(&mut handles, &undo).await;
            return Err(e);
        }
        tracing::info!(agent = agent.name(), adapter = self.adapter.name(), "Registered agent");
        Ok(())
    }

    /// Subscribe an agent to one explicit pattern.
    pub async fn subscribe(&self, agent: &Arc<dyn Agent>, pattern: Pattern) -> Result<()> {
        let mut handles = self.handles.lock().await;
        let already = self.registry.patterns_of(agent.name()).contains(&pattern);
        let plan = self.registry.add(agent, pattern.clone())?;
        if let Err(e) = self.apply(&mut handles, &plan).await {
            if !already {
                let undo = self.registry.remove(agent.name(), &pattern);
                self.apply_best_effort(&mut handles, &undo).await;
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, agent_name: &str, pattern: &Pattern) -> Result<()> {
        let mut handles = self.handles.lock().await;
        let plan = self.registry.remove(agent_name, pattern);
        self.apply(&mut handles, &plan).await
    }

    /// Drop every subscription of an agent.
    pub async fn deregister(&self, agent_name: &str) -> Result<()> {
        let mut handles = self.handles.lock().await;
        let plan = self.registry.remove_agent(agent_name);
        self.apply(&mut handles, &plan).await?;
        tracing::info!(agent = agent_name, "Deregistered agent");
        Ok(())
    }

    /// Apply a plan, subscribes first so coverage never lapses. Does nothing
    /// while disconnected; `connect` catches up from the registry.
    async fn apply(
        &self,
        handles: &mut BTreeMap<Pattern, SubscriptionHandle>,
        plan: &BrokerPlan,
    ) -> Result<()> {
        if plan.is_empty() || !self.is_connected() {
            return Ok(());
        }

        let sink: Arc<dyn DeliverySink> = self.dispatcher.clone();
        for pattern in &plan.subscribe {
            if handles.contains_key(pattern) {
                continue;
            }
            let handle = self.adapter.subscribe(pattern, Arc::clone(&sink)).await?;
            handles.insert(pattern.clone(), handle);
        }
        for pattern in &plan.unsubscribe {
            if let Some(handle) = handles.remove(pattern) {
                self.adapter.unsubscribe(handle).await?;
            }
        }
        Ok(())
    }

    async fn apply_best_effort(
        &self,
        handles: &mut BTreeMap<Pattern, SubscriptionHandle>,
        plan: &BrokerPlan,
    ) {
        if let Err(e) = self.apply(handles, plan).await {
            tracing::warn!(adapter = self.adapter.name(), error = %e, "Rollback of broker subscriptions incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::{PubSubAdapter, TopicAdapter};
    use crate::protocol::{MessageContext, MessageSet, MessageType, DIRECTION_REQUEST, DIRECTION_RESPONSE};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentRequestMessage {
        amount: f64,
        user_id: String,
        payment_method: String,
    }
    impl MessageType for PaymentRequestMessage {
        const NAME: &'static str = "PaymentRequestMessage";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentResponseMessage {
        status: String,
    }
    impl MessageType for PaymentResponseMessage {
        const NAME: &'static str = "PaymentResponseMessage";
    }

    struct PaymentAgent {
        seen: StdMutex<Vec<(PaymentRequestMessage, MessageContext)>>,
        tx: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Agent for PaymentAgent {
        fn name(&self) -> &str {
            "payment_agent"
        }
        fn inbound(&self) -> MessageSet {
            MessageSet::new().with::<PaymentRequestMessage>()
        }
        fn outbound(&self) -> MessageSet {
            MessageSet::new().with::<PaymentResponseMessage>()
        }
        async fn handle_message(&self, message: &Message, context: &MessageContext) -> anyhow::Result<()> {
            let request = message
                .downcast_ref::<PaymentRequestMessage>()
                .ok_or_else(|| anyhow::anyhow!("unexpected {}", message.type_name()))?;
            self.seen.lock().unwrap().push((request.clone(), context.clone()));
            let _ = self.tx.send(());
            Ok(())
        }
    }

    fn catalog() -> Arc<MessageCatalog> {
        let catalog = Arc::new(MessageCatalog::new());
        catalog.register::<PaymentRequestMessage>().unwrap();
        catalog.register::<PaymentResponseMessage>().unwrap();
        catalog
    }

    fn payment_agent() -> (Arc<PaymentAgent>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(PaymentAgent {
                seen: StdMutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    fn request() -> Message {
        Message::new(PaymentRequestMessage {
            amount: 100.0,
            user_id: "user123".into(),
            payment_method: "credit_card".into(),
        })
        .unwrap()
    }

    async fn end_to_end(adapter: Arc<dyn BrokerAdapter>) {
        crate::logging::init_test();
        let router = Router::new(adapter, catalog());
        router.connect().await.unwrap();

        let (agent, mut rx) = payment_agent();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        router.register(&dyn_agent).await.unwrap();
        // A second, narrower pattern must not cause a second delivery.
        router
            .subscribe(&dyn_agent, Pattern::parse("PaymentRequestMessage:request:*").unwrap())
            .await
            .unwrap();
        assert_eq!(
            router.registry().broker_patterns(),
            vec![Pattern::parse("PaymentRequestMessage:*:*").unwrap()]
        );

        router.publish(&request(), DIRECTION_REQUEST, "session456").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        {
            let seen = agent.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            let (message, context) = &seen[0];
            assert_eq!(message.amount, 100.0);
            assert_eq!(message.user_id, "user123");
            assert_eq!(message.payment_method, "credit_card");
            assert_eq!(context.direction, "request");
            assert_eq!(context.session_id, "session456");
        }
        assert_eq!(router.stats().delivered, 1);

        router.close().await.unwrap();
        router.close().await.unwrap();
        assert!(!router.health_check().await);
    }

    #[tokio::test]
    async fn test_end_to_end_pubsub() {
        end_to_end(Arc::new(PubSubAdapter::new())).await;
    }

    #[tokio::test]
    async fn test_end_to_end_topic() {
        end_to_end(Arc::new(TopicAdapter::new("agent_communication", "agentbus"))).await;
    }

    #[tokio::test]
    async fn test_send_checks_outbound_before_adapter() {
        // Not connected: if the check did not come first, the adapter would
        // report a publish error instead.
        let router = Router::new(Arc::new(PubSubAdapter::new()), catalog());
        let (agent, _rx) = payment_agent();
        let result = router
            .send(agent.as_ref(), &request(), DIRECTION_REQUEST, "s1")
            .await;
        assert!(matches!(result, Err(Error::InvalidAgent { .. })));

        let response = Message::new(PaymentResponseMessage { status: "ok".into() }).unwrap();
        let result = router
            .send(agent.as_ref(), &response, DIRECTION_RESPONSE, "s1")
            .await;
        assert!(matches!(result, Err(Error::Publish { .. })));
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let router = Router::new(Arc::new(PubSubAdapter::new()), catalog());
        router.connect().await.unwrap();

        assert!(matches!(
            router.publish(&request(), "*", "s1").await,
            Err(Error::Publish { .. })
        ));
        assert!(matches!(
            router.publish(&request(), "request", "").await,
            Err(Error::InvalidChannelFormat { .. })
        ));
        assert!(matches!(
            router.publish_to(&request(), "PaymentResponseMessage:request:s1").await,
            Err(Error::Publish { .. })
        ));
        assert!(router
            .publish_to(&request(), "PaymentRequestMessage:request:s1")
            .await
            .is_ok());

        #[derive(Serialize, Deserialize)]
        struct Unlisted {
            x: u8,
        }
        impl MessageType for Unlisted {
            const NAME: &'static str = "Unlisted";
        }
        let unlisted = Message::new(Unlisted { x: 1 }).unwrap();
        assert!(matches!(
            router.publish(&unlisted, "request", "s1").await,
            Err(Error::MessageClassNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_registration_before_connect_is_replayed() {
        let adapter = Arc::new(PubSubAdapter::new());
        let router = Router::new(adapter.clone(), catalog());
        let (agent, mut rx) = payment_agent();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        router.register(&dyn_agent).await.unwrap();
        assert_eq!(adapter.hub().pattern_count(), 0);

        router.connect().await.unwrap();
        assert_eq!(adapter.hub().pattern_count(), 1);
        router.publish(&request(), DIRECTION_REQUEST, "s1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_broker_presence_follows_registry() {
        let adapter = Arc::new(PubSubAdapter::new());
        let router = Router::new(adapter.clone(), catalog());
        router.connect().await.unwrap();

        let (agent, _rx) = payment_agent();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let narrow = Pattern::parse("PaymentRequestMessage:request:s1").unwrap();
        router.subscribe(&dyn_agent, narrow.clone()).await.unwrap();
        router.subscribe(&dyn_agent, narrow.clone()).await.unwrap();
        assert_eq!(adapter.hub().pattern_count(), 1);

        // The broad pattern absorbs the narrow broker subscription.
        router.register(&dyn_agent).await.unwrap();
        assert_eq!(adapter.hub().pattern_count(), 1);
        assert_eq!(router.registry().subscription_count(), 2);

        router.unsubscribe(dyn_agent.name(), &narrow).await.unwrap();
        assert_eq!(adapter.hub().pattern_count(), 1);

        router.deregister(dyn_agent.name()).await.unwrap();
        assert_eq!(adapter.hub().pattern_count(), 0);
        assert!(!router.registry().is_registered(dyn_agent.name()));
    }

    async fn absorb_keeps_queued_message(adapter: Arc<dyn BrokerAdapter>) {
        let router = Router::new(adapter, catalog());
        router.connect().await.unwrap();
        let (agent, mut rx) = payment_agent();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        router
            .subscribe(&dyn_agent, Pattern::parse("PaymentRequestMessage:request:*").unwrap())
            .await
            .unwrap();
        router.publish(&request(), DIRECTION_REQUEST, "s1").await.unwrap();

        // Absorbed into PaymentRequestMessage:*:* while the message is queued.
        router.register(&dyn_agent).await.unwrap();
        assert_eq!(
            router.registry().broker_patterns(),
            vec![Pattern::parse("PaymentRequestMessage:*:*").unwrap()]
        );

        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert_eq!(agent.seen.lock().unwrap().len(), 1);
        assert_eq!(router.stats().delivered, 1);
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_absorb_keeps_queued_message_pubsub() {
        absorb_keeps_queued_message(Arc::new(PubSubAdapter::new())).await;
    }

    #[tokio::test]
    async fn test_absorb_keeps_queued_message_topic() {
        absorb_keeps_queued_message(Arc::new(TopicAdapter::new("agent_communication", "agentbus"))).await;
    }

    /// Adapter whose subscribe starts failing on demand.
    struct FlakyAdapter {
        inner: PubSubAdapter,
        fail_subscribe: AtomicBool,
    }

    #[async_trait]
    impl BrokerAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }
        async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(&self, pattern: &Pattern, sink: Arc<dyn DeliverySink>) -> Result<SubscriptionHandle> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(Error::connection("flaky", "subscribe refused"));
            }
            self.inner.subscribe(pattern, sink).await
        }
        async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
            self.inner.unsubscribe(handle).await
        }
        async fn health_check(&self) -> bool {
            self.inner.health_check().await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_register_keeps_earlier_subscriptions() {
        let adapter = Arc::new(FlakyAdapter {
            inner: PubSubAdapter::new(),
            fail_subscribe: AtomicBool::new(false),
        });
        let router = Router::new(adapter.clone(), catalog());
        router.connect().await.unwrap();

        let (agent, _rx) = payment_agent();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let session = Pattern::parse("*:*:s1").unwrap();
        router.subscribe(&dyn_agent, session.clone()).await.unwrap();

        adapter.fail_subscribe.store(true, Ordering::SeqCst);
        assert!(matches!(
            router.register(&dyn_agent).await,
            Err(Error::Connection { .. })
        ));
        assert_eq!(router.registry().patterns_of(dyn_agent.name()), vec![session.clone()]);
        assert_eq!(router.registry().broker_patterns(), vec![session]);
        assert_eq!(adapter.inner.hub().pattern_count(), 1);
    }

    #[tokio::test]
    async fn test_no_agent_drop_keeps_router_alive() {
        let router = Router::new(Arc::new(TopicAdapter::new("agent_communication", "agentbus")), catalog());
        router.connect().await.unwrap();
        let (agent, mut rx) = payment_agent();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        router
            .subscribe(&dyn_agent, Pattern::parse("*:*:s1").unwrap())
            .await
            .unwrap();

        let response = Message::new(PaymentResponseMessage { status: "ok".into() }).unwrap();
        router.publish(&response, DIRECTION_RESPONSE, "s1").await.unwrap();
        router.publish(&request(), DIRECTION_REQUEST, "s1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(agent.seen.lock().unwrap().len(), 1);
        let stats = router.stats();
        assert_eq!(stats.no_agent, 1);
        assert_eq!(stats.delivered, 1);
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check() {
        let router = Router::new(Arc::new(PubSubAdapter::new()), catalog());
        assert!(!router.health_check().await);
        router.connect().await.unwrap();
        assert!(router.health_check().await);
        router.close().await.unwrap();
        assert!(!router.health_check().await);
    }
}
