//! Live rule table.

use std::sync::Arc;

use dashmap::DashMap;

use crate::rule::Rule;

/// Concurrent map of rule id to the rule currently in force.
///
/// Entries are replaced wholesale; a reader holding an `Arc<Rule>` keeps
/// seeing the definition it fetched even if a reload swaps it out.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: DashMap<String, Arc<Rule>>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a rule, returning the previous definition.
    pub fn insert(&self, rule: Arc<Rule>) -> Option<Arc<Rule>> {
        self.rules.insert(rule.unique_id.clone(), rule)
    }

    /// Removes a rule.
    pub fn remove(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.remove(id).map(|(_, rule)| rule)
    }

    /// Fetches a rule.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns true if the id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true when no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
