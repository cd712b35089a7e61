//! Forwarding rules between channel patterns.
//!
//! A route maps a source pattern to the target patterns a matching channel
//! should fan out to. The table only answers lookups; acting on them is up to
//! the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use super::pattern::Pattern;

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<BTreeMap<Pattern, Vec<Pattern>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append targets to the rule for `source`, creating it if needed.
    pub fn add_route(&self, source: Pattern, targets: impl IntoIterator<Item = Pattern>) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let entry = routes.entry(source.clone()).or_default();
        let before = entry.len();
        entry.extend(targets);
        tracing::debug!(source = %source, added = entry.len() - before, "Added route");
    }

    /// Targets of every rule whose source matches `channel`, without
    /// duplicates. A malformed channel has no routes.
    pub fn get_routes(&self, channel: &str) -> Vec<Pattern> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let targets: BTreeSet<&Pattern> = routes
            .iter()
            .filter(|(source, _)| source.matches_channel(channel))
            .flat_map(|(_, targets)| targets.iter())
            .collect();
        targets.into_iter().cloned().collect()
    }

    pub fn clear_routes(&self) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of source patterns with a rule.
    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
