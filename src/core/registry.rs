//! Subscription bookkeeping.
//!
//! The registry tracks which agent listens on which pattern, and which
//! patterns actually need a broker-level subscription. A pattern that is
//! covered by an existing broker subscription rides on it instead of creating
//! a new one; adding a broader pattern absorbs the narrower broker
//! subscriptions it covers. Every mutation returns a [`BrokerPlan`] that the
//! router applies to its adapter.
//!
//! All state sits behind one mutex. It is never held across an await or a
//! handler call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{Error, Result};
use crate::protocol::{validate_declarations, Agent, ChannelAddress, MessageCatalog, Pattern};

/// Broker-level changes produced by one registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerPlan {
    /// Patterns that need a new broker subscription. Apply these first.
    pub subscribe: Vec<Pattern>,
    /// Broker subscriptions that are no longer needed.
    pub unsubscribe: Vec<Pattern>,
}

impl BrokerPlan {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    pub fn merge(&mut self, other: BrokerPlan) {
        self.subscribe.extend(other.subscribe);
        self.unsubscribe.extend(other.unsubscribe);
        self.normalize();
    }

    /// Cancel patterns that were subscribed and dropped within the same plan.
    fn normalize(&mut self) {
        let transient: BTreeSet<Pattern> = self
            .subscribe
            .iter()
            .filter(|p| self.unsubscribe.contains(p))
            .cloned()
            .collect();
        self.subscribe.retain(|p| !transient.contains(p));
        self.unsubscribe.retain(|p| !transient.contains(p));
    }
}

struct AgentEntry {
    agent: Weak<dyn Agent>,
    patterns: BTreeSet<Pattern>,
}

struct PatternEntry {
    agents: BTreeSet<String>,
    /// Broker subscription this pattern is delivered through.
    carrier: Pattern,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentEntry>,
    patterns: BTreeMap<Pattern, PatternEntry>,
    /// Broker subscription -> active patterns it carries (itself included).
    broker: BTreeMap<Pattern, BTreeSet<Pattern>>,
}

impl RegistryState {
    /// Attach a new pattern to a broker subscription, creating one if no
    /// existing subscription covers it.
    fn place(&mut self, pattern: &Pattern, plan: &mut BrokerPlan) {
        let carrier = self
            .broker
            .keys()
            .find(|existing| existing.covers(pattern))
            .cloned();

        if let Some(carrier) = carrier {
            if let Some(dependents) = self.broker.get_mut(&carrier) {
                dependents.insert(pattern.clone());
            }
            if let Some(entry) = self.patterns.get_mut(pattern) {
                entry.carrier = carrier;
            }
            return;
        }

        let absorbed: Vec<Pattern> = self
            .broker
            .keys()
            .filter(|existing| pattern.covers(existing))
            .cloned()
            .collect();

        let mut dependents = BTreeSet::from([pattern.clone()]);
        for old in absorbed {
            if let Some(moved) = self.broker.remove(&old) {
                dependents.extend(moved);
            }
            plan.unsubscribe.push(old);
        }
        for dependent in &dependents {
            if let Some(entry) = self.patterns.get_mut(dependent) {
                entry.carrier = pattern.clone();
            }
        }

        self.broker.insert(pattern.clone(), dependents);
        plan.subscribe.push(pattern.clone());
    }

    /// Drop one (agent, pattern) pair.
    fn detach(&mut self, agent_name: &str, pattern: &Pattern, plan: &mut BrokerPlan) -> bool {
        let Some(agent) = self.agents.get_mut(agent_name) else {
            return false;
        };
        if !agent.patterns.remove(pattern) {
            return false;
        }
        if agent.patterns.is_empty() {
            self.agents.remove(agent_name);
        }

        let Some(entry) = self.patterns.get_mut(pattern) else {
            return true;
        };
        entry.agents.remove(agent_name);
        if !entry.agents.is_empty() {
            return true;
        }

        let carrier = entry.carrier.clone();
        self.patterns.remove(pattern);

        if carrier != *pattern {
            if let Some(dependents) = self.broker.get_mut(&carrier) {
                dependents.remove(pattern);
            }
            return true;
        }

        // The pattern owned a broker subscription: re-home whatever it
        // carried before letting it go.
        let orphans = self.broker.remove(pattern).unwrap_or_default();
        for orphan in orphans.iter().filter(|p| *p != pattern) {
            self.place(orphan, plan);
        }
        plan.unsubscribe.push(pattern.clone());
        true
    }
}

fn same_agent(a: &Arc<dyn Agent>, b: &Arc<dyn Agent>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Thread-safe registry of (agent, pattern) subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `agent` to `pattern`. Re-adding the same pair is a no-op.
    pub fn add(&self, agent: &Arc<dyn Agent>, pattern: Pattern) -> Result<BrokerPlan> {
        let name = agent.name().to_string();
        let mut plan = BrokerPlan::default();
        let mut state = self.lock();

        match state.agents.get_mut(&name) {
            Some(entry) => {
                let same = entry
                    .agent
                    .upgrade()
                    .map(|existing| same_agent(&existing, agent))
                    .unwrap_or(false);
                if !same {
                    if entry.agent.strong_count() > 0 {
                        return Err(Error::invalid_agent(
                            name,
                            "another agent is already registered under this name",
                        ));
                    }
                    // Previous holder of the name was dropped without
                    // deregistering; the new agent takes over its patterns.
                    entry.agent = Arc::downgrade(agent);
                }
                if !entry.patterns.insert(pattern.clone()) {
                    tracing::debug!(agent = %name, pattern = %pattern, "Subscription already present");
                    return Ok(plan);
                }
            }
            None => {
                state.agents.insert(
                    name.clone(),
                    AgentEntry {
                        agent: Arc::downgrade(agent),
                        patterns: BTreeSet::from([pattern.clone()]),
                    },
                );
            }
        }

        if let Some(entry) = state.patterns.get_mut(&pattern) {
            entry.agents.insert(name.clone());
        } else {
            state.patterns.insert(
                pattern.clone(),
                PatternEntry {
                    agents: BTreeSet::from([name.clone()]),
                    carrier: pattern.clone(),
                },
            );
            state.place(&pattern, &mut plan);
        }

        tracing::info!(
            agent = %name,
            pattern = %pattern,
            broker_subscribe = plan.subscribe.len(),
            broker_unsubscribe = plan.unsubscribe.len(),
            "Agent subscribed"
        );
        Ok(plan)
    }

    /// Remove one (agent, pattern) pair. Unknown pairs are a no-op.
    pub fn remove(&self, agent_name: &str, pattern: &Pattern) -> BrokerPlan {
        let mut plan = BrokerPlan::default();
        let removed = self.lock().detach(agent_name, pattern, &mut plan);
        plan.normalize();
        if removed {
            tracing::info!(agent = %agent_name, pattern = %pattern, "Agent unsubscribed");
        }
        plan
    }

    /// Remove every subscription of an agent.
    pub fn remove_agent(&self, agent_name: &str) -> BrokerPlan {
        let mut plan = BrokerPlan::default();
        let mut state = self.lock();
        let patterns: Vec<Pattern> = state
            .agents
            .get(agent_name)
            .map(|entry| entry.patterns.iter().cloned().collect())
            .unwrap_or_default();
        for pattern in &patterns {
            state.detach(agent_name, pattern, &mut plan);
        }
        drop(state);

        plan.normalize();
        if !patterns.is_empty() {
            tracing::info!(agent = %agent_name, patterns = patterns.len(), "Agent unsubscribed from all patterns");
        }
        plan
    }

    /// Subscribe `agent` to `Type:*:*` for every inbound type.
    pub fn auto_subscribe(
        &self,
        agent: &Arc<dyn Agent>,
        catalog: &MessageCatalog,
    ) -> Result<BrokerPlan> {
        validate_declarations(agent.as_ref(), catalog)?;

        let mut plan = BrokerPlan::default();
        for type_name in agent.inbound().iter() {
            let pattern = Pattern::broadcast(type_name)?;
            plan.merge(self.add(agent, pattern)?);
        }
        Ok(plan)
    }

    /// Every live agent with at least one pattern matching `address`, each
    /// exactly once.
    pub fn resolve(&self, address: &ChannelAddress) -> Vec<Arc<dyn Agent>> {
        let state = self.lock();
        let names: BTreeSet<&String> = state
            .patterns
            .iter()
            .filter(|(pattern, _)| pattern.matches(address))
            .flat_map(|(_, entry)| entry.agents.iter())
            .collect();

        names
            .into_iter()
            .filter_map(|name| {
                let agent = state.agents.get(name).and_then(|e| e.agent.upgrade());
                if agent.is_none() {
                    tracing::debug!(agent = %name, "Skipping dropped agent");
                }
                agent
            })
            .collect()
    }

    pub fn is_registered(&self, agent_name: &str) -> bool {
        self.lock().agents.contains_key(agent_name)
    }

    /// Patterns held by one agent, sorted.
    pub fn patterns_of(&self, agent_name: &str) -> Vec<Pattern> {
        self.lock()
            .agents
            .get(agent_name)
            .map(|entry| entry.patterns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Patterns that currently own a broker subscription, sorted.
    pub fn broker_patterns(&self) -> Vec<Pattern> {
        self.lock().broker.keys().cloned().collect()
    }

    /// Number of distinct (agent, pattern) pairs.
    pub fn subscription_count(&self) -> usize {
        self.lock().agents.values().map(|e| e.patterns.len()).sum()
    }

    /// Drop everything, returning the broker subscriptions to release.
    pub fn clear(&self) -> Vec<Pattern> {
        let mut state = self.lock();
        let released = state.broker.keys().cloned().collect();
        *state = RegistryState::default();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, MessageContext, MessageSet, MessageType};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct PaymentRequestMessage {
        amount: f64,
    }
    impl MessageType for PaymentRequestMessage {
        const NAME: &'static str = "PaymentRequestMessage";
    }

    #[derive(Serialize, Deserialize)]
    struct Refund {
        amount: f64,
    }
    impl MessageType for Refund {
        const NAME: &'static str = "Refund";
    }

    struct Named {
        name: String,
        inbound: MessageSet,
    }

    #[async_trait]
    impl Agent for Named {
        fn name(&self) -> &str {
            &self.name
        }
        fn inbound(&self) -> MessageSet {
            self.inbound.clone()
        }
        fn outbound(&self) -> MessageSet {
            MessageSet::new()
        }
        async fn handle_message(&self, _: &Message, _: &MessageContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn agent(name: &str) -> Arc<dyn Agent> {
        Arc::new(Named {
            name: name.to_string(),
            inbound: MessageSet::new().with::<PaymentRequestMessage>(),
        })
    }

    fn p(s: &str) -> Pattern {
        Pattern::parse(s).unwrap()
    }

    fn addr(s: &str) -> ChannelAddress {
        crate::protocol::channel::decode(s).unwrap()
    }

    fn names(agents: Vec<Arc<dyn Agent>>) -> Vec<String> {
        agents.iter().map(|a| a.name().to_string()).collect()
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");

        let first = registry.add(&a, p("Pay:*:*")).unwrap();
        assert_eq!(first.subscribe, vec![p("Pay:*:*")]);

        let second = registry.add(&a, p("Pay:*:*")).unwrap();
        assert!(second.is_empty());
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.broker_patterns(), vec![p("Pay:*:*")]);
    }

    #[test]
    fn test_resolve_dedups_agents() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        registry.add(&a, p("Pay:*:*")).unwrap();
        registry.add(&a, p("Pay:request:*")).unwrap();
        registry.add(&a, p("*:*:s1")).unwrap();

        let resolved = registry.resolve(&addr("Pay:request:s1"));
        assert_eq!(names(resolved), vec!["a"]);
    }

    #[test]
    fn test_resolve_only_matching_agents() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        let b = agent("b");
        let c = agent("c");
        registry.add(&a, p("Pay:*:*")).unwrap();
        registry.add(&b, p("Pay:request:s1")).unwrap();
        registry.add(&c, p("Other:*:*")).unwrap();

        assert_eq!(names(registry.resolve(&addr("Pay:request:s1"))), vec!["a", "b"]);
        assert_eq!(names(registry.resolve(&addr("Pay:request:s2"))), vec!["a"]);
        assert!(registry.resolve(&addr("Nobody:x:y")).is_empty());
    }

    #[test]
    fn test_shared_pattern_single_broker_subscription() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        let b = agent("b");

        assert_eq!(registry.add(&a, p("Pay:*:*")).unwrap().subscribe.len(), 1);
        assert!(registry.add(&b, p("Pay:*:*")).unwrap().is_empty());

        // Removing one of two holders keeps the broker subscription.
        assert!(registry.remove("a", &p("Pay:*:*")).is_empty());
        let last = registry.remove("b", &p("Pay:*:*"));
        assert_eq!(last.unsubscribe, vec![p("Pay:*:*")]);
        assert!(registry.broker_patterns().is_empty());
    }

    #[test]
    fn test_covered_pattern_reuses_broker_subscription() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        let b = agent("b");

        registry.add(&a, p("Pay:*:*")).unwrap();
        let plan = registry.add(&b, p("Pay:request:*")).unwrap();
        assert!(plan.is_empty());
        assert_eq!(registry.broker_patterns(), vec![p("Pay:*:*")]);

        // The broad pattern leaves; the narrow one needs its own subscription.
        let plan = registry.remove("a", &p("Pay:*:*"));
        assert_eq!(plan.subscribe, vec![p("Pay:request:*")]);
        assert_eq!(plan.unsubscribe, vec![p("Pay:*:*")]);
        assert_eq!(registry.broker_patterns(), vec![p("Pay:request:*")]);
    }

    #[test]
    fn test_broader_pattern_absorbs_narrower() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        let b = agent("b");

        registry.add(&a, p("Pay:request:*")).unwrap();
        registry.add(&a, p("Pay:response:*")).unwrap();
        let plan = registry.add(&b, p("Pay:*:*")).unwrap();

        assert_eq!(plan.subscribe, vec![p("Pay:*:*")]);
        assert_eq!(plan.unsubscribe.len(), 2);
        assert_eq!(registry.broker_patterns(), vec![p("Pay:*:*")]);

        // Narrow patterns still route to their own agent.
        assert_eq!(names(registry.resolve(&addr("Pay:request:s1"))), vec!["a", "b"]);
    }

    #[test]
    fn test_overlapping_but_not_covering_patterns_each_subscribe() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        registry.add(&a, p("Pay:*:s1")).unwrap();
        let plan = registry.add(&a, p("Pay:request:*")).unwrap();
        assert_eq!(plan.subscribe, vec![p("Pay:request:*")]);
        assert_eq!(registry.broker_patterns().len(), 2);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        registry.add(&a, p("Pay:*:*")).unwrap();
        assert!(registry.remove("a", &p("Other:*:*")).is_empty());
        assert!(registry.remove("ghost", &p("Pay:*:*")).is_empty());
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_remove_agent_releases_everything() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        registry.add(&a, p("Pay:*:*")).unwrap();
        registry.add(&a, p("Pay:request:*")).unwrap();
        registry.add(&a, p("Refund:*:*")).unwrap();

        let mut plan = registry.remove_agent("a");
        plan.unsubscribe.sort();
        assert!(plan.subscribe.is_empty());
        assert_eq!(plan.unsubscribe, vec![p("Pay:*:*"), p("Refund:*:*")]);
        assert!(!registry.is_registered("a"));
        assert!(registry.broker_patterns().is_empty());
    }

    #[test]
    fn test_name_collision_rejected() {
        let registry = SubscriptionRegistry::new();
        let first = agent("dup");
        let second = agent("dup");
        registry.add(&first, p("Pay:*:*")).unwrap();
        assert!(matches!(
            registry.add(&second, p("Pay:*:*")),
            Err(Error::InvalidAgent { .. })
        ));
    }

    #[test]
    fn test_dropped_agent_is_not_resolved() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        registry.add(&a, p("Pay:*:*")).unwrap();
        drop(a);
        assert!(registry.resolve(&addr("Pay:request:s1")).is_empty());

        // The name is free again.
        let replacement = agent("a");
        assert!(registry.add(&replacement, p("Pay:*:*")).unwrap().is_empty());
        assert_eq!(names(registry.resolve(&addr("Pay:request:s1"))), vec!["a"]);
    }

    #[test]
    fn test_auto_subscribe() {
        let catalog = MessageCatalog::new();
        catalog.register::<PaymentRequestMessage>().unwrap();
        let registry = SubscriptionRegistry::new();
        let a = agent("payments");

        let plan = registry.auto_subscribe(&a, &catalog).unwrap();
        assert_eq!(plan.subscribe, vec![p("PaymentRequestMessage:*:*")]);
        assert_eq!(registry.patterns_of("payments"), vec![p("PaymentRequestMessage:*:*")]);
    }

    #[test]
    fn test_auto_subscribe_rejects_bad_declarations() {
        let catalog = MessageCatalog::new();
        let registry = SubscriptionRegistry::new();

        let unregistered = agent("payments");
        assert!(matches!(
            registry.auto_subscribe(&unregistered, &catalog),
            Err(Error::InvalidAgent { .. })
        ));

        let empty: Arc<dyn Agent> = Arc::new(Named {
            name: "empty".to_string(),
            inbound: MessageSet::new(),
        });
        assert!(matches!(
            registry.auto_subscribe(&empty, &catalog),
            Err(Error::InvalidAgent { .. })
        ));
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_auto_subscribe_multiple_types() {
        let catalog = MessageCatalog::new();
        catalog.register::<PaymentRequestMessage>().unwrap();
        catalog.register::<Refund>().unwrap();
        let registry = SubscriptionRegistry::new();
        let a: Arc<dyn Agent> = Arc::new(Named {
            name: "ledger".to_string(),
            inbound: MessageSet::new().with::<PaymentRequestMessage>().with::<Refund>(),
        });

        let plan = registry.auto_subscribe(&a, &catalog).unwrap();
        assert_eq!(plan.subscribe.len(), 2);
        assert_eq!(
            registry.patterns_of("ledger"),
            vec![p("PaymentRequestMessage:*:*"), p("Refund:*:*")]
        );
    }

    #[test]
    fn test_concurrent_add_and_resolve() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let a = agent(&format!("agent{}", i));
                    registry.add(&a, p("Pay:*:*")).unwrap();
                    registry.add(&a, p(&format!("Pay:request:s{}", i))).unwrap();
                    let seen = registry.resolve(&addr(&format!("Pay:request:s{}", i)));
                    assert!(seen.iter().any(|s| s.name() == a.name()));
                    registry.remove_agent(a.name());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.subscription_count(), 0);
        assert!(registry.broker_patterns().is_empty());
    }

    #[test]
    fn test_clear() {
        let registry = SubscriptionRegistry::new();
        let a = agent("a");
        registry.add(&a, p("Pay:*:*")).unwrap();
        assert_eq!(registry.clear(), vec![p("Pay:*:*")]);
        assert_eq!(registry.subscription_count(), 0);
    }
}
