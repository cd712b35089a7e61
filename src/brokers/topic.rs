//! In-process topic exchange with AMQP-style binding keys.
//!
//! Each adapter connection declares one exclusive queue on the exchange and
//! binds it once per subscription. The exchange routes a message to a queue at
//! most once, whatever the number of matching bindings, and the connection's
//! consumer acknowledges or rejects every item it takes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use ulid::Ulid;

use super::adapter::{BrokerAdapter, SubscriptionHandle};
use crate::core::{DeliverySink, DispatchOutcome};
use crate::error::{Error, Result};
use crate::protocol::{channel, Pattern, Segment};

pub const ADAPTER_NAME: &str = "topic";

const WORD_SEPARATOR: char = '.';
const SINGLE_WORD: &str = "*";
const MULTI_WORD: &str = "#";

/// Percent-escape the characters that carry meaning in routing keys.
pub fn escape_word(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for c in token.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            '*' => out.push_str("%2A"),
            '#' => out.push_str("%23"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_word`]. Unknown escapes are kept verbatim.
pub fn unescape_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut rest = word;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = match tail.get(..3) {
            Some("%25") => Some('%'),
            Some("%2E") | Some("%2e") => Some('.'),
            Some("%2A") | Some("%2a") => Some('*'),
            Some("%23") => Some('#'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Binding key for a subscription pattern. Wildcards become the single-word
/// `*`, so each binding still spans exactly three words.
pub fn to_binding_key(pattern: &Pattern) -> String {
    pattern
        .segments()
        .iter()
        .map(|segment| match segment {
            Segment::Any => SINGLE_WORD.to_string(),
            Segment::Exact(token) => escape_word(token),
        })
        .collect::<Vec<_>>()
        .join(&WORD_SEPARATOR.to_string())
}

/// Routing key for a concrete channel.
pub fn to_routing_key(channel_name: &str) -> Result<String> {
    let address = channel::decode(channel_name)?;
    Ok(address
        .tokens()
        .iter()
        .map(|t| escape_word(t))
        .collect::<Vec<_>>()
        .join(&WORD_SEPARATOR.to_string()))
}

/// Channel a routing key was built from.
pub fn routing_key_to_channel(routing_key: &str) -> Result<String> {
    let words: Vec<&str> = routing_key.split(WORD_SEPARATOR).collect();
    if words.len() != 3 {
        return Err(Error::invalid_channel(routing_key));
    }
    let tokens: Vec<String> = words.iter().map(|w| unescape_word(w)).collect();
    channel::encode(&tokens[0], &tokens[1], &tokens[2])
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
    let binding: Vec<&str> = binding_key.split(WORD_SEPARATOR).collect();
    let routing: Vec<&str> = routing_key.split(WORD_SEPARATOR).collect();
    match_words(&binding, &routing)
}

fn match_words(binding: &[&str], routing: &[&str]) -> bool {
    match binding.split_first() {
        None => routing.is_empty(),
        Some((&MULTI_WORD, rest)) => {
            (0..=routing.len()).any(|skip| match_words(rest, &routing[skip..]))
        }
        Some((&word, rest)) => match routing.split_first() {
            Some((&head, tail)) => {
                (word == SINGLE_WORD || word == head) && match_words(rest, tail)
            }
            None => false,
        },
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    binding: SubscriptionHandle,
    routing_key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Queue {
    bindings: BTreeMap<SubscriptionHandle, String>,
    pending: VecDeque<Delivery>,
    notify: Arc<Notify>,
}

/// Exchange counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeStats {
    pub published: u64,
    pub routed: u64,
    pub unroutable: u64,
}

/// Shared topic exchange. Several adapters may declare queues on it.
pub struct TopicExchange {
    name: String,
    queues: Mutex<HashMap<String, Queue>>,
    published: AtomicU64,
    routed: AtomicU64,
    unroutable: AtomicU64,
}

impl TopicExchange {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queues: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
            routed: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Queue>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn declare_queue(&self, queue: &str) -> Arc<Notify> {
        self.lock().entry(queue.to_string()).or_default().notify.clone()
    }

    fn delete_queue(&self, queue: &str) {
        if let Some(q) = self.lock().remove(queue) {
            q.notify.notify_one();
        }
    }

    fn has_queue(&self, queue: &str) -> bool {
        self.lock().contains_key(queue)
    }

    fn bind(&self, queue: &str, handle: SubscriptionHandle, binding_key: String) -> bool {
        match self.lock().get_mut(queue) {
            Some(q) => {
                q.bindings.insert(handle, binding_key);
                true
            }
            None => false,
        }
    }

    fn unbind(&self, queue: &str, handle: SubscriptionHandle) {
        if let Some(q) = self.lock().get_mut(queue) {
            q.bindings.remove(&handle);
        }
    }

    /// Route one message. Returns the number of queues it landed in.
    pub fn publish(&self, routing_key: &str, payload: &[u8]) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.lock();
        let mut routed = 0;
        for q in queues.values_mut() {
            let matched = q
                .bindings
                .iter()
                .find(|(_, key)| topic_matches(key, routing_key))
                .map(|(handle, _)| *handle);
            if let Some(binding) = matched {
                q.pending.push_back(Delivery {
                    binding,
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                });
                q.notify.notify_one();
                routed += 1;
            }
        }
        if routed == 0 {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
        } else {
            self.routed.fetch_add(1, Ordering::Relaxed);
        }
        routed
    }

    fn take(&self, queue: &str) -> Option<Option<Delivery>> {
        self.lock().get_mut(queue).map(|q| q.pending.pop_front())
    }

    /// Drop every undelivered item in a queue.
    pub fn purge(&self, queue: &str) -> usize {
        self.lock()
            .get_mut(queue)
            .map(|q| {
                let n = q.pending.len();
                q.pending.clear();
                n
            })
            .unwrap_or(0)
    }

    /// Total bindings across all queues.
    pub fn binding_count(&self) -> usize {
        self.lock().values().map(|q| q.bindings.len()).sum()
    }

    pub fn stats(&self) -> ExchangeStats {
        ExchangeStats {
            published: self.published.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }
}

/// Consumer counters for one adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub delivered: u64,
    pub acknowledged: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct ConsumerCounters {
    delivered: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
}

struct Session {
    queue: String,
    task: JoinHandle<()>,
}

struct Route {
    binding_key: String,
    sink: Arc<dyn DeliverySink>,
}

type Sinks = Arc<Mutex<HashMap<SubscriptionHandle, Route>>>;

/// Sink for a queued delivery. Items bound through a binding that was removed
/// since go to any live binding that still matches the routing key.
fn sink_for(sinks: &Sinks, delivery: &Delivery) -> Option<Arc<dyn DeliverySink>> {
    let sinks = sinks.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(route) = sinks.get(&delivery.binding) {
        return Some(Arc::clone(&route.sink));
    }
    sinks
        .values()
        .find(|route| topic_matches(&route.binding_key, &delivery.routing_key))
        .map(|route| Arc::clone(&route.sink))
}

/// Adapter over a [`TopicExchange`].
pub struct TopicAdapter {
    exchange: Arc<TopicExchange>,
    queue_prefix: String,
    session: Mutex<Option<Session>>,
    sinks: Sinks,
    counters: Arc<ConsumerCounters>,
}

impl TopicAdapter {
    /// Adapter with a private exchange.
    pub fn new(exchange: &str, queue_prefix: &str) -> Self {
        Self::with_exchange(TopicExchange::new(exchange), queue_prefix)
    }

    pub fn with_exchange(exchange: Arc<TopicExchange>, queue_prefix: &str) -> Self {
        Self {
            exchange,
            queue_prefix: queue_prefix.to_string(),
            session: Mutex::new(None),
            sinks: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    pub fn exchange(&self) -> &Arc<TopicExchange> {
        &self.exchange
    }

    /// Name of this connection's queue, if connected.
    pub fn queue_name(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.queue.clone())
    }

    /// Drop undelivered items waiting in this connection's queue.
    pub fn purge(&self) -> usize {
        match self.queue_name() {
            Some(queue) => {
                let purged = self.exchange.purge(&queue);
                tracing::info!(adapter = ADAPTER_NAME, queue = %queue, purged, "Purged queue");
                purged
            }
            None => 0,
        }
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

async fn consume(
    exchange: Arc<TopicExchange>,
    queue: String,
    notify: Arc<Notify>,
    sinks: Sinks,
    counters: Arc<ConsumerCounters>,
) {
    loop {
        let delivery = match exchange.take(&queue) {
            None => break,
            Some(None) => {
                notify.notified().await;
                continue;
            }
            Some(Some(delivery)) => delivery,
        };
        counters.delivered.fetch_add(1, Ordering::Relaxed);

        let Some(sink) = sink_for(&sinks, &delivery) else {
            tracing::debug!(adapter = ADAPTER_NAME, routing_key = %delivery.routing_key, "No matching binding left, rejecting");
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        // Undecodable keys are passed through raw; the sink drops them.
        let channel_name = routing_key_to_channel(&delivery.routing_key)
            .unwrap_or_else(|_| delivery.routing_key.clone());

        match sink.deliver(ADAPTER_NAME, &channel_name, &delivery.payload).await {
            Ok(outcome) => {
                counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                if let DispatchOutcome::Delivered { agents } = outcome {
                    tracing::trace!(adapter = ADAPTER_NAME, channel = %channel_name, agents, "Acknowledged");
                }
            }
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(adapter = ADAPTER_NAME, channel = %channel_name, error = %e, "Rejected delivery without requeue");
            }
        }
    }
    tracing::debug!(adapter = ADAPTER_NAME, queue = %queue, "Consumer stopped");
}

#[async_trait]
impl BrokerAdapter for TopicAdapter {
    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if session.is_some() {
            return Ok(());
        }
        let queue = format!("{}.{}", self.queue_prefix, Ulid::new().to_string().to_lowercase());
        let notify = self.exchange.declare_queue(&queue);
        let task = tokio::spawn(consume(
            Arc::clone(&self.exchange),
            queue.clone(),
            notify,
            Arc::clone(&self.sinks),
            Arc::clone(&self.counters),
        ));
        tracing::info!(adapter = ADAPTER_NAME, exchange = %self.exchange.name(), queue = %queue, "Declared exclusive queue");
        *session = Some(Session { queue, task });
        Ok(())
    }

    async fn publish(&self, channel_name: &str, payload: &[u8]) -> Result<()> {
        if self.queue_name().is_none() {
            return Err(Error::publish(ADAPTER_NAME, channel_name, "not connected"));
        }
        let routing_key = to_routing_key(channel_name)
            .map_err(|e| Error::publish(ADAPTER_NAME, channel_name, e.to_string()))?;
        let queues = self.exchange.publish(&routing_key, payload);
        tracing::debug!(adapter = ADAPTER_NAME, channel = channel_name, routing_key = %routing_key, queues, "Published");
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &Pattern,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<SubscriptionHandle> {
        let queue = self
            .queue_name()
            .ok_or_else(|| Error::connection(ADAPTER_NAME, "not connected"))?;
        let binding_key = to_binding_key(pattern);
        let handle = SubscriptionHandle::new();
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).insert(
            handle,
            Route {
                binding_key: binding_key.clone(),
                sink,
            },
        );
        if !self.exchange.bind(&queue, handle, binding_key.clone()) {
            self.sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle);
            return Err(Error::connection(
                ADAPTER_NAME,
                format!("queue '{}' no longer exists", queue),
            ));
        }
        tracing::debug!(adapter = ADAPTER_NAME, pattern = %pattern, binding_key = %binding_key, %handle, "Bound queue");
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if let Some(queue) = self.queue_name() {
            self.exchange.unbind(&queue, handle);
        }
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
        tracing::debug!(adapter = ADAPTER_NAME, %handle, "Unbound queue");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match self.queue_name() {
            Some(queue) => self.exchange.has_queue(&queue),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            self.exchange.delete_queue(&session.queue);
            session.task.abort();
            tracing::info!(adapter = ADAPTER_NAME, queue = %session.queue, "Deleted queue and closed connection");
        }
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}
