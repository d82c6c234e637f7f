//! Per-rule metrics table and Prometheus exposition.
//!
//! Counters live in one bucket per rule id. A bucket is created when the
//! rule starts and dropped when it stops, so a stopped rule disappears from
//! the exposition instead of exporting stale series. Buckets carry the
//! generation of the job that owns them; writes from an older generation are
//! discarded.
//!
//! # Example
//!
//! ```rust
//! use claw_logalert::metrics::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.register_rule("r1", 1, "rules/r1.rule.yaml", "http://es:9200", "logs-*", true);
//! metrics.record_query("r1", 1, 200);
//! assert!(metrics.encode().contains("claw_logalert_query_total"));
//! ```

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for query-engine calls.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueryLabels {
    /// Rule id.
    pub rule_id: String,
    /// Rule source path.
    pub path: String,
    /// Store addresses, comma-joined.
    pub address: String,
    /// Queried index.
    pub index: String,
    /// Response status.
    pub status: String,
}

/// Labels for queue operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueOpLabels {
    /// Rule id.
    pub rule_id: String,
    /// Rule source path.
    pub path: String,
    /// Queue command.
    pub cmd: String,
    /// Key or list the command touched.
    pub key: String,
    /// 1 for success, 0 for failure.
    pub status: String,
}

/// Labels for webhook attempts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    /// Rule id.
    pub rule_id: String,
    /// Rule source path.
    pub path: String,
    /// Response status.
    pub status: String,
}

/// Labels for the rule-enabled gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleLabels {
    /// Rule id.
    pub rule_id: String,
    /// Rule source path.
    pub path: String,
}

/// Labels for the alert-hits gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AlertHitLabels {
    /// Rule id.
    pub rule_id: String,
    /// Rule source path.
    pub path: String,
    /// Queried index.
    pub index: String,
    /// Evidence fingerprint.
    pub key: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct InfoLabels {
    version: String,
}

#[derive(Debug, Default)]
struct RuleBucket {
    generation: u64,
    path: String,
    address: String,
    index: String,
    enabled: bool,
    queries: HashMap<u16, u64>,
    queue_ops: HashMap<(String, String, bool), u64>,
    webhooks: HashMap<u16, u64>,
    alert_hits: HashMap<String, u64>,
}

/// Metrics for the whole engine.
#[derive(Debug)]
pub struct EngineMetrics {
    rules: DashMap<String, RuleBucket>,
    unattributed_queue_ops: Mutex<HashMap<(String, String, bool), u64>>,
    queue_connected: RwLock<bool>,
    version: String,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            unattributed_queue_ops: Mutex::new(HashMap::new()),
            queue_connected: RwLock::new(false),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Creates (or resets) the bucket for a rule.
    pub fn register_rule(
        &self,
        rule_id: &str,
        generation: u64,
        path: &str,
        address: &str,
        index: &str,
        enabled: bool,
    ) {
        self.rules.insert(
            rule_id.to_string(),
            RuleBucket {
                generation,
                path: path.to_string(),
                address: address.to_string(),
                index: index.to_string(),
                enabled,
                ..RuleBucket::default()
            },
        );
    }

    /// Drops a rule's bucket.
    pub fn remove_rule(&self, rule_id: &str) {
        self.rules.remove(rule_id);
    }

    /// Returns true if the rule has a bucket.
    #[must_use]
    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    /// Counts one query-engine call.
    pub fn record_query(&self, rule_id: &str, generation: u64, status: u16) {
        if let Some(mut bucket) = self.rules.get_mut(rule_id) {
            if bucket.generation == generation {
                *bucket.queries.entry(status).or_default() += 1;
            }
        }
    }

    /// Counts one queue operation.
    pub fn record_queue_op(&self, rule_id: &str, cmd: &str, key: &str, ok: bool) {
        if let Some(mut bucket) = self.rules.get_mut(rule_id) {
            *bucket
                .queue_ops
                .entry((cmd.to_string(), key.to_string(), ok))
                .or_default() += 1;
        }
    }

    /// Counts a queue operation that cannot be tied to a rule, such as a pop
    /// of an unreadable message. Exported with empty rule labels.
    pub fn record_unattributed_queue_op(&self, cmd: &str, key: &str, ok: bool) {
        *self
            .unattributed_queue_ops
            .lock()
            .entry((cmd.to_string(), key.to_string(), ok))
            .or_default() += 1;
    }

    /// Unattributed queue operations recorded for a command.
    #[must_use]
    pub fn unattributed_queue_op_count(&self, cmd: &str, ok: bool) -> u64 {
        self.unattributed_queue_ops
            .lock()
            .iter()
            .filter(|((c, _, s), _)| c == cmd && *s == ok)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Counts one webhook attempt.
    pub fn record_webhook(&self, rule_id: &str, status: u16) {
        if let Some(mut bucket) = self.rules.get_mut(rule_id) {
            *bucket.webhooks.entry(status).or_default() += 1;
        }
    }

    /// Publishes the hit count of the incident stored under `key`. A rule has
    /// one incident at a time, so series for earlier keys are dropped.
    pub fn set_alert_hits(&self, rule_id: &str, key: &str, hits: u64) {
        if let Some(mut bucket) = self.rules.get_mut(rule_id) {
            bucket.alert_hits.retain(|k, _| k == key);
            bucket.alert_hits.insert(key.to_string(), hits);
        }
    }

    /// Drops the alert-hits series of a rule whose incident is gone.
    pub fn clear_alert_hits(&self, rule_id: &str) {
        if let Some(mut bucket) = self.rules.get_mut(rule_id) {
            bucket.alert_hits.clear();
        }
    }

    /// Number of alert-hits series a rule exports.
    #[must_use]
    pub fn alert_hit_series(&self, rule_id: &str) -> usize {
        self.rules.get(rule_id).map_or(0, |b| b.alert_hits.len())
    }

    /// Sets the queue connectivity gauge.
    pub fn set_queue_connected(&self, connected: bool) {
        *self.queue_connected.write() = connected;
    }

    /// Current queue connectivity.
    #[must_use]
    pub fn queue_connected(&self) -> bool {
        *self.queue_connected.read()
    }

    /// Query calls recorded for a rule with the given status.
    #[must_use]
    pub fn query_count(&self, rule_id: &str, status: u16) -> u64 {
        self.rules
            .get(rule_id)
            .and_then(|b| b.queries.get(&status).copied())
            .unwrap_or(0)
    }

    /// Webhook attempts recorded for a rule with the given status.
    #[must_use]
    pub fn webhook_count(&self, rule_id: &str, status: u16) -> u64 {
        self.rules
            .get(rule_id)
            .and_then(|b| b.webhooks.get(&status).copied())
            .unwrap_or(0)
    }

    /// Queue operations recorded for a rule and command.
    #[must_use]
    pub fn queue_op_count(&self, rule_id: &str, cmd: &str, ok: bool) -> u64 {
        self.rules
            .get(rule_id)
            .map(|b| {
                b.queue_ops
                    .iter()
                    .filter(|((c, _, s), _)| c == cmd && *s == ok)
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Whether the rule's enabled gauge is set.
    #[must_use]
    pub fn rule_enabled(&self, rule_id: &str) -> Option<bool> {
        self.rules.get(rule_id).map(|b| b.enabled)
    }

    /// Renders the table in Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut registry = Registry::default();

        let queries = Family::<QueryLabels, Counter>::default();
        let queue_ops = Family::<QueueOpLabels, Counter>::default();
        let webhooks = Family::<WebhookLabels, Counter>::default();
        let enabled = Family::<RuleLabels, Gauge>::default();
        let hits = Family::<AlertHitLabels, Gauge>::default();
        let connected = Gauge::<i64>::default();
        let info = Family::<InfoLabels, Gauge>::default();

        for entry in &self.rules {
            let rule_id = entry.key();
            let bucket = entry.value();
            for (status, n) in &bucket.queries {
                queries
                    .get_or_create(&QueryLabels {
                        rule_id: rule_id.clone(),
                        path: bucket.path.clone(),
                        address: bucket.address.clone(),
                        index: bucket.index.clone(),
                        status: status.to_string(),
                    })
                    .inc_by(*n);
            }
            for ((cmd, key, ok), n) in &bucket.queue_ops {
                queue_ops
                    .get_or_create(&QueueOpLabels {
                        rule_id: rule_id.clone(),
                        path: bucket.path.clone(),
                        cmd: cmd.clone(),
                        key: key.clone(),
                        status: if *ok { "1" } else { "0" }.to_string(),
                    })
                    .inc_by(*n);
            }
            for (status, n) in &bucket.webhooks {
                webhooks
                    .get_or_create(&WebhookLabels {
                        rule_id: rule_id.clone(),
                        path: bucket.path.clone(),
                        status: status.to_string(),
                    })
                    .inc_by(*n);
            }
            for (key, n) in &bucket.alert_hits {
                hits.get_or_create(&AlertHitLabels {
                    rule_id: rule_id.clone(),
                    path: bucket.path.clone(),
                    index: bucket.index.clone(),
                    key: key.clone(),
                })
                .set(*n as i64);
            }
            enabled
                .get_or_create(&RuleLabels {
                    rule_id: rule_id.clone(),
                    path: bucket.path.clone(),
                })
                .set(i64::from(bucket.enabled));
        }
        for ((cmd, key, ok), n) in self.unattributed_queue_ops.lock().iter() {
            queue_ops
                .get_or_create(&QueueOpLabels {
                    rule_id: String::new(),
                    path: String::new(),
                    cmd: cmd.clone(),
                    key: key.clone(),
                    status: if *ok { "1" } else { "0" }.to_string(),
                })
                .inc_by(*n);
        }
        connected.set(i64::from(self.queue_connected()));
        info.get_or_create(&InfoLabels {
            version: self.version.clone(),
        })
        .set(1);

        registry.register(
            "claw_logalert_query",
            "Query-engine calls by rule and status",
            queries,
        );
        registry.register(
            "claw_logalert_queue_op",
            "Queue operations by rule, command and outcome",
            queue_ops,
        );
        registry.register(
            "claw_logalert_webhook_notify",
            "Webhook delivery attempts by rule and status",
            webhooks,
        );
        registry.register(
            "claw_logalert_rule_enabled",
            "Whether a registered rule is enabled",
            enabled,
        );
        registry.register(
            "claw_logalert_alert_hits",
            "Documents in the incident last dispatched for a rule",
            hits,
        );
        registry.register(
            "claw_logalert_queue_connected",
            "Whether the queue backend answered the last operation",
            connected,
        );
        registry.register("claw_logalert_info", "Build information", info);

        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_err() {
            tracing::error!("failed to encode prometheus metrics");
            return String::new();
        }
        buffer
    }

    /// Content-Type of [`EngineMetrics::encode`] output.
    #[must_use]
    pub const fn content_type() -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with_rule() -> EngineMetrics {
        let metrics = EngineMetrics::new();
        metrics.register_rule("r1", 1, "rules/r1.rule.yaml", "http://es:9200", "logs-*", true);
        metrics
    }

    #[test]
    fn counts_by_status() {
        let metrics = metrics_with_rule();
        metrics.record_query("r1", 1, 200);
        metrics.record_query("r1", 1, 200);
        metrics.record_query("r1", 1, 499);
        assert_eq!(metrics.query_count("r1", 200), 2);
        assert_eq!(metrics.query_count("r1", 499), 1);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let metrics = metrics_with_rule();
        metrics.record_query("r1", 0, 200);
        assert_eq!(metrics.query_count("r1", 200), 0);
    }

    #[test]
    fn unknown_rule_is_ignored() {
        let metrics = EngineMetrics::new();
        metrics.record_webhook("ghost", 200);
        metrics.record_query("ghost", 1, 200);
        assert!(!metrics.has_rule("ghost"));
        assert!(!metrics.encode().contains("ghost"));
    }

    #[test]
    fn alert_hits_keep_only_current_key() {
        let metrics = metrics_with_rule();
        metrics.set_alert_hits("r1", "first", 3);
        metrics.set_alert_hits("r1", "second", 4);
        assert_eq!(metrics.alert_hit_series("r1"), 1);
        assert!(metrics.encode().contains("key=\"second\""));
        assert!(!metrics.encode().contains("key=\"first\""));

        metrics.clear_alert_hits("r1");
        assert_eq!(metrics.alert_hit_series("r1"), 0);
        assert!(metrics.has_rule("r1"));
    }

    #[test]
    fn exposition_contains_series() {
        let metrics = metrics_with_rule();
        metrics.record_query("r1", 1, 200);
        metrics.record_queue_op("r1", "lpush", "claw_logalert:alerts:list", true);
        metrics.record_webhook("r1", 499);
        metrics.set_alert_hits("r1", "abc", 5);
        metrics.set_queue_connected(true);

        let text = metrics.encode();
        assert!(text.contains("claw_logalert_query_total{"));
        assert!(text.contains("status=\"200\""));
        assert!(text.contains("claw_logalert_queue_op_total{"));
        assert!(text.contains("cmd=\"lpush\""));
        assert!(text.contains("claw_logalert_webhook_notify_total{"));
        assert!(text.contains("claw_logalert_alert_hits{"));
        assert!(text.contains("claw_logalert_rule_enabled{"));
        assert!(text.contains("claw_logalert_queue_connected 1"));
        assert!(text.contains("claw_logalert_info{"));
        assert_eq!(metrics.queue_op_count("r1", "lpush", true), 1);
    }
}
