//! In-process pub/sub hub with glob pattern subscriptions.
//!
//! The hub plays the part of a pub/sub server: connections subscribe with
//! glob patterns and every published message is pushed once to each
//! connection that has at least one matching pattern.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::adapter::{BrokerAdapter, SubscriptionHandle};
use crate::core::{DeliverySink, DispatchOutcome};
use crate::error::{Error, Result};
use crate::protocol::{Pattern, Segment, SEPARATOR};

pub const ADAPTER_NAME: &str = "pubsub";

/// Translate a pattern into the hub's glob syntax.
///
/// Exact tokens are glob-escaped, wildcards become `*`.
pub fn to_glob(pattern: &Pattern) -> String {
    pattern
        .segments()
        .iter()
        .map(|segment| match segment {
            Segment::Any => "*".to_string(),
            Segment::Exact(token) => glob::Pattern::escape(token),
        })
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

#[derive(Debug)]
struct Delivery {
    handle: SubscriptionHandle,
    channel: String,
    payload: Vec<u8>,
}

struct Connection {
    patterns: BTreeMap<SubscriptionHandle, glob::Pattern>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Shared hub. Several adapters may connect to the same hub.
#[derive(Default)]
pub struct PubSubHub {
    connections: Mutex<HashMap<u64, Connection>>,
    next_id: Mutex<u64>,
}

impl PubSubHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self) -> (u64, mpsc::UnboundedReceiver<Delivery>) {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            Connection {
                patterns: BTreeMap::new(),
                tx,
            },
        );
        (id, rx)
    }

    fn disconnect(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn is_open(&self, id: u64) -> bool {
        self.lock().get(&id).map(|c| !c.tx.is_closed()).unwrap_or(false)
    }

    fn psubscribe(&self, id: u64, handle: SubscriptionHandle, glob: glob::Pattern) -> bool {
        match self.lock().get_mut(&id) {
            Some(connection) => {
                connection.patterns.insert(handle, glob);
                true
            }
            None => false,
        }
    }

    fn punsubscribe(&self, id: u64, handle: SubscriptionHandle) {
        if let Some(connection) = self.lock().get_mut(&id) {
            connection.patterns.remove(&handle);
        }
    }

    /// Publish to every connection with a matching pattern. Returns the
    /// number of connections the message was pushed to.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let connections = self.lock();
        let mut receivers = 0;
        for connection in connections.values() {
            let matched = connection
                .patterns
                .iter()
                .find(|(_, glob)| glob.matches(channel))
                .map(|(handle, _)| *handle);
            if let Some(handle) = matched {
                let delivery = Delivery {
                    handle,
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                };
                if connection.tx.send(delivery).is_ok() {
                    receivers += 1;
                }
            }
        }
        receivers
    }

    /// Patterns currently subscribed across all connections.
    pub fn pattern_count(&self) -> usize {
        self.lock().values().map(|c| c.patterns.len()).sum()
    }
}

struct Session {
    id: u64,
    task: JoinHandle<()>,
}

struct Route {
    glob: glob::Pattern,
    sink: Arc<dyn DeliverySink>,
}

type Sinks = Arc<Mutex<HashMap<SubscriptionHandle, Route>>>;

/// Sink for a queued delivery. Items queued under a subscription that was
/// dropped since go to any live subscription that still matches the channel.
fn sink_for(sinks: &Sinks, delivery: &Delivery) -> Option<Arc<dyn DeliverySink>> {
    let sinks = sinks.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(route) = sinks.get(&delivery.handle) {
        return Some(Arc::clone(&route.sink));
    }
    sinks
        .values()
        .find(|route| route.glob.matches(&delivery.channel))
        .map(|route| Arc::clone(&route.sink))
}

/// Adapter over a [`PubSubHub`].
pub struct PubSubAdapter {
    hub: Arc<PubSubHub>,
    session: Mutex<Option<Session>>,
    sinks: Sinks,
}

impl PubSubAdapter {
    /// Adapter with a private hub.
    pub fn new() -> Self {
        Self::with_hub(PubSubHub::new())
    }

    pub fn with_hub(hub: Arc<PubSubHub>) -> Self {
        Self {
            hub,
            session: Mutex::new(None),
            sinks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &Arc<PubSubHub> {
        &self.hub
    }

    fn connection_id(&self) -> Option<u64> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.id)
    }
}

impl Default for PubSubAdapter {
    fn default() -> Self {
        Self::new()
    }
}

async fn delivery_loop(mut rx: mpsc::UnboundedReceiver<Delivery>, sinks: Sinks) {
    while let Some(delivery) = rx.recv().await {
        let Some(sink) = sink_for(&sinks, &delivery) else {
            tracing::debug!(adapter = ADAPTER_NAME, channel = %delivery.channel, "No matching subscription left, dropping");
            continue;
        };

        match sink
            .deliver(ADAPTER_NAME, &delivery.channel, &delivery.payload)
            .await
        {
            Ok(DispatchOutcome::Delivered { agents }) => {
                tracing::trace!(channel = %delivery.channel, agents, "Delivery handled");
            }
            Ok(DispatchOutcome::Dropped(_)) => {}
            Err(e) => {
                tracing::error!(adapter = ADAPTER_NAME, channel = %delivery.channel, error = %e, "Delivery failed");
            }
        }
    }
    tracing::debug!(adapter = ADAPTER_NAME, "Delivery loop stopped");
}

#[async_trait]
impl BrokerAdapter for PubSubAdapter {
    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if session.is_some() {
            return Ok(());
        }
        let (id, rx) = self.hub.open();
        let task = tokio::spawn(delivery_loop(rx, Arc::clone(&self.sinks)));
        *session = Some(Session { id, task });
        tracing::info!(adapter = ADAPTER_NAME, connection = id, "Connected to pub/sub hub");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.connection_id().is_none() {
            return Err(Error::publish(ADAPTER_NAME, channel, "not connected"));
        }
        let receivers = self.hub.publish(channel, payload);
        tracing::debug!(adapter = ADAPTER_NAME, channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &Pattern,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<SubscriptionHandle> {
        let id = self
            .connection_id()
            .ok_or_else(|| Error::connection(ADAPTER_NAME, "not connected"))?;
        let glob_text = to_glob(pattern);
        let glob = glob::Pattern::new(&glob_text).map_err(|e| {
            Error::connection(ADAPTER_NAME, format!("bad glob '{}': {}", glob_text, e))
        })?;

        let handle = SubscriptionHandle::new();
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).insert(
            handle,
            Route {
                glob: glob.clone(),
                sink,
            },
        );
        if !self.hub.psubscribe(id, handle, glob) {
            self.sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle);
            return Err(Error::connection(ADAPTER_NAME, "connection dropped by hub"));
        }
        tracing::debug!(adapter = ADAPTER_NAME, pattern = %pattern, glob = %glob_text, %handle, "Subscribed");
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if let Some(id) = self.connection_id() {
            self.hub.punsubscribe(id, handle);
        }
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
        tracing::debug!(adapter = ADAPTER_NAME, %handle, "Unsubscribed");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match self.connection_id() {
            Some(id) => self.hub.is_open(id),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            self.hub.disconnect(session.id);
            session.task.abort();
            tracing::info!(adapter = ADAPTER_NAME, connection = session.id, "Closed pub/sub connection");
        }
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}
