//! Per-rule alert state machine.
//!
//! At most one [`AlertRecord`] exists per rule id. It opens on the first
//! qualifying match, follows later matches without moving its start, and
//! resolves on the first tick without a match. A resolved record stays in
//! the table until the delivery pipeline has dispatched it.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::matcher::MatchGroup;
use crate::rule::Rule;

/// Minimum distance between an incident's start and its synthesized end.
pub const HYSTERESIS: TimeDelta = TimeDelta::seconds(30);

/// Lifecycle state of an alert record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// The incident is open.
    Pending,
    /// The incident ended and awaits dispatch.
    Resolved,
}

impl AlertState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The open (or just-resolved) incident of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRecord {
    /// Rule definition the last match was evaluated with.
    pub rule: Arc<Rule>,
    /// Latest qualifying match.
    pub current: MatchGroup,
    /// Detection time; fixed for the life of the incident.
    pub starts_at: DateTime<Utc>,
    /// Resolution time, set once resolved.
    pub ends_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: AlertState,
}

impl AlertRecord {
    /// Returns true if the record is resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state == AlertState::Resolved
    }
}

/// What one tick did to a rule's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A new incident was opened.
    Opened,
    /// An existing incident absorbed a new match.
    Continued,
    /// The incident resolved.
    Resolved,
    /// Nothing changed.
    Unchanged,
}

impl Transition {
    /// Returns true if the tick produced a match.
    #[must_use]
    pub const fn matched(&self) -> bool {
        matches!(self, Self::Opened | Self::Continued)
    }
}

/// Resolution time for an incident that started at `starts_at`.
#[must_use]
pub fn resolution_time(starts_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now - starts_at > HYSTERESIS {
        now
    } else {
        starts_at + HYSTERESIS
    }
}

/// Table of alert records keyed by rule id.
#[derive(Debug, Default)]
pub struct AlertLifecycle {
    records: DashMap<String, AlertRecord>,
}

impl AlertLifecycle {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one tick's result into the rule's state machine.
    pub fn apply(
        &self,
        rule: Arc<Rule>,
        matched: Option<MatchGroup>,
        now: DateTime<Utc>,
    ) -> Transition {
        let rule_id = rule.unique_id.clone();
        match (self.records.entry(rule_id), matched) {
            (Entry::Vacant(_), None) => Transition::Unchanged,
            (Entry::Vacant(slot), Some(group)) => {
                info!(rule_id = %rule.unique_id, starts_at = %group.starts_at, hits = group.count, "alert opened");
                slot.insert(AlertRecord {
                    rule,
                    starts_at: group.starts_at,
                    current: group,
                    ends_at: None,
                    state: AlertState::Pending,
                });
                Transition::Opened
            }
            (Entry::Occupied(mut slot), Some(group)) => {
                let record = slot.get_mut();
                if record.is_resolved() {
                    debug!(rule_id = %rule.unique_id, "undispatched resolution reopened");
                }
                record.rule = rule;
                record.current = group;
                record.ends_at = None;
                record.state = AlertState::Pending;
                Transition::Continued
            }
            (Entry::Occupied(mut slot), None) => {
                let record = slot.get_mut();
                if record.is_resolved() {
                    return Transition::Unchanged;
                }
                let ends_at = resolution_time(record.starts_at, now);
                info!(rule_id = %rule.unique_id, starts_at = %record.starts_at, %ends_at, "alert resolved");
                record.ends_at = Some(ends_at);
                record.state = AlertState::Resolved;
                Transition::Resolved
            }
        }
    }

    /// Copy of a rule's record.
    #[must_use]
    pub fn get(&self, rule_id: &str) -> Option<AlertRecord> {
        self.records.get(rule_id).map(|r| r.value().clone())
    }

    /// Copies of all records, sorted by rule id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AlertRecord> {
        let mut records: Vec<AlertRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.rule.unique_id.cmp(&b.rule.unique_id));
        records
    }

    /// Removes a record that is still resolved. Returns true if removed.
    pub fn remove_if_resolved(&self, rule_id: &str) -> bool {
        self.records
            .remove_if(rule_id, |_, record| record.is_resolved())
            .is_some()
    }

    /// Removes a record unconditionally.
    pub fn remove(&self, rule_id: &str) -> Option<AlertRecord> {
        self.records.remove(rule_id).map(|(_, record)| record)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
