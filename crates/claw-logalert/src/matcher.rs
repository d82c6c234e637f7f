//! Grouping matched documents into candidate incidents.
//!
//! A [`MatchStrategy`] turns a time-ordered document list into
//! [`MatchGroup`]s and picks the one that counts as a match. Strategies are
//! looked up by the rule's `query.type` through a [`MatchEngine`], so an
//! unknown name only fails when the rule is evaluated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::to_time_delta;
use crate::error::{LogAlertError, Result};
use crate::query::Document;
use crate::rule::Rule;

/// Name of the built-in frequency strategy.
pub const FREQUENCY: &str = "frequency";

/// Documents clustered into one candidate incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchGroup {
    /// Member document ids in time order.
    pub ids: Vec<String>,
    /// Timestamp of the first member.
    pub starts_at: DateTime<Utc>,
    /// `starts_at + timeframe`; later documents open a new group.
    pub ends_at: DateTime<Utc>,
    /// Number of members.
    pub count: u64,
}

impl MatchGroup {
    /// Opens a group at `doc`.
    #[must_use]
    pub fn open(doc: &Document, timeframe: chrono::TimeDelta) -> Self {
        Self {
            ids: vec![doc.id.clone()],
            starts_at: doc.timestamp,
            ends_at: doc.timestamp + timeframe,
            count: 1,
        }
    }

    /// Returns true if `doc` falls inside this group's timeframe.
    #[must_use]
    pub fn accepts(&self, doc: &Document) -> bool {
        doc.timestamp < self.ends_at
    }

    /// Adds `doc` to the group.
    pub fn push(&mut self, doc: &Document) {
        self.ids.push(doc.id.clone());
        self.count += 1;
    }
}

/// A pluggable grouping algorithm.
pub trait MatchStrategy: Send + Sync + fmt::Debug {
    /// Name rules use to select this strategy.
    fn name(&self) -> &str;

    /// Splits time-ordered `documents` into groups.
    fn group(&self, rule: &Rule, documents: &[Document]) -> Vec<MatchGroup>;

    /// Picks the match out of `groups`: the first one, in scan order, that
    /// reaches the rule's threshold.
    fn select(&self, rule: &Rule, groups: Vec<MatchGroup>) -> Option<MatchGroup> {
        let threshold = rule.threshold();
        groups.into_iter().find(|g| g.count >= threshold)
    }
}

/// Clusters documents into back-to-back windows of one timeframe each.
///
/// Each group starts at its first document and absorbs every following
/// document stamped before `start + timeframe`. The first document at or
/// past that boundary closes the group and opens the next one.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrequencyStrategy;

impl MatchStrategy for FrequencyStrategy {
    fn name(&self) -> &str {
        FREQUENCY
    }

    fn group(&self, rule: &Rule, documents: &[Document]) -> Vec<MatchGroup> {
        let timeframe = to_time_delta(rule.timeframe());
        let mut groups = Vec::new();
        let mut current: Option<MatchGroup> = None;

        for doc in documents {
            if let Some(group) = current.as_mut() {
                if group.accepts(doc) {
                    group.push(doc);
                    continue;
                }
            }
            if let Some(done) = current.replace(MatchGroup::open(doc, timeframe)) {
                groups.push(done);
            }
        }
        groups.extend(current);
        groups
    }
}

/// Named match strategies.
#[derive(Debug, Clone)]
pub struct MatchEngine {
    strategies: HashMap<String, Arc<dyn MatchStrategy>>,
}

impl Default for MatchEngine {
    fn default() -> Self {
        let mut engine = Self {
            strategies: HashMap::new(),
        };
        engine.register(Arc::new(FrequencyStrategy));
        engine
    }
}

impl MatchEngine {
    /// Creates an engine with the built-in strategies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn MatchStrategy>) {
        self.strategies
            .insert(strategy.name().to_ascii_lowercase(), strategy);
    }

    /// Looks up a strategy by name, case-insensitively.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn MatchStrategy>> {
        self.strategies
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| LogAlertError::UnknownStrategy {
                name: name.to_string(),
            })
    }

    /// Groups `documents` with the rule's strategy and returns the match.
    pub fn evaluate(&self, rule: &Rule, documents: &[Document]) -> Result<Option<MatchGroup>> {
        let strategy = self.resolve(&rule.query.strategy)?;
        if documents.is_empty() {
            return Ok(None);
        }
        let groups = strategy.group(rule, documents);
        Ok(strategy.select(rule, groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{base_time, docs_at, rule_with_id};
    use chrono::TimeDelta;
    use proptest::prelude::*;

    fn group_sizes(groups: &[MatchGroup]) -> Vec<u64> {
        groups.iter().map(|g| g.count).collect()
    }

    #[test]
    fn empty_input_yields_nothing() {
        let rule = rule_with_id("r");
        assert!(FrequencyStrategy.group(&rule, &[]).is_empty());
        assert_eq!(MatchEngine::new().evaluate(&rule, &[]).expect("ok"), None);
    }

    #[test]
    fn splits_on_timeframe_boundary() {
        // 5 minute timeframe: 300s lands exactly on the boundary.
        let rule = rule_with_id("r");
        let docs = docs_at(&[0, 10, 299, 300, 400, 900]);
        let groups = FrequencyStrategy.group(&rule, &docs);
        assert_eq!(group_sizes(&groups), vec![3, 2, 1]);
        assert_eq!(groups[1].ids, vec!["doc-3".to_string(), "doc-4".to_string()]);
        assert_eq!(groups[1].starts_at, base_time() + TimeDelta::seconds(300));
        assert_eq!(groups[1].ends_at, base_time() + TimeDelta::seconds(600));
    }

    #[test]
    fn first_qualifying_group_wins() {
        // Sizes [2, 4, 1] with threshold 3.
        let rule = rule_with_id("r");
        let docs = docs_at(&[0, 1, 400, 401, 402, 403, 1000]);
        let groups = FrequencyStrategy.group(&rule, &docs);
        assert_eq!(group_sizes(&groups), vec![2, 4, 1]);
        let chosen = FrequencyStrategy.select(&rule, groups).expect("match");
        assert_eq!(chosen.count, 4);
        assert_eq!(chosen.ids[0], "doc-2");
    }

    #[test]
    fn earlier_group_beats_larger_one() {
        let rule = rule_with_id("r");
        let docs = docs_at(&[0, 1, 2, 400, 401, 402, 403, 404]);
        let chosen = MatchEngine::new().evaluate(&rule, &docs).expect("ok").expect("match");
        assert_eq!(chosen.count, 3);
    }

    #[test]
    fn below_threshold_is_no_match() {
        let rule = rule_with_id("r");
        let docs = docs_at(&[0, 1, 400]);
        assert_eq!(MatchEngine::new().evaluate(&rule, &docs).expect("ok"), None);
    }

    #[test]
    fn unknown_strategy_fails_at_evaluation() {
        let mut rule = rule_with_id("r");
        rule.query.strategy = "spike".to_string();
        let err = MatchEngine::new().evaluate(&rule, &docs_at(&[0])).unwrap_err();
        assert!(matches!(err, LogAlertError::UnknownStrategy { .. }));
    }

    #[test]
    fn strategy_names_are_case_insensitive() {
        assert!(MatchEngine::new().resolve("Frequency").is_ok());
    }

    #[derive(Debug)]
    struct Everything;

    impl MatchStrategy for Everything {
        fn name(&self) -> &str {
            "everything"
        }

        fn group(&self, _rule: &Rule, documents: &[Document]) -> Vec<MatchGroup> {
            let mut group = MatchGroup::open(&documents[0], TimeDelta::zero());
            for doc in &documents[1..] {
                group.push(doc);
            }
            vec![group]
        }
    }

    #[test]
    fn custom_strategy_is_selectable() {
        let mut engine = MatchEngine::new();
        engine.register(Arc::new(Everything));
        let mut rule = rule_with_id("r");
        rule.query.strategy = "everything".to_string();
        let chosen = engine
            .evaluate(&rule, &docs_at(&[0, 1000, 5000]))
            .expect("ok")
            .expect("match");
        assert_eq!(chosen.count, 3);
    }

    proptest! {
        #[test]
        fn groups_are_contiguous_and_bounded(mut offsets in prop::collection::vec(0i64..3_600, 0..60)) {
            offsets.sort_unstable();
            let rule = rule_with_id("r");
            let docs = docs_at(&offsets);
            let groups = FrequencyStrategy.group(&rule, &docs);

            // Every document lands in exactly one group, in order.
            let flattened: Vec<String> = groups.iter().flat_map(|g| g.ids.clone()).collect();
            let expected: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
            prop_assert_eq!(flattened, expected);

            let mut cursor = 0usize;
            for (i, group) in groups.iter().enumerate() {
                let members = &docs[cursor..cursor + group.ids.len()];
                prop_assert_eq!(group.starts_at, members[0].timestamp);
                prop_assert_eq!(group.count as usize, members.len());
                for doc in members {
                    prop_assert!(doc.timestamp < group.ends_at);
                }
                cursor += members.len();
                // The next group starts exactly at the first document past the boundary.
                if let Some(next) = groups.get(i + 1) {
                    prop_assert!(next.starts_at >= group.ends_at);
                }
            }
        }
    }
}
