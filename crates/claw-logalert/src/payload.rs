//! Wire formats produced by the delivery pipeline.
//!
//! Three shapes leave the engine: the Alertmanager alert array posted to the
//! webhook, the [`QueueMessage`] carrying it through the queue, and the
//! [`AlertSample`] stored next to it so the `generatorURL` can link back to
//! the matched documents.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::lifecycle::AlertRecord;
use crate::rule::{QuerySpec, Rule, StoreConfig};

/// Labels copied from the rule into the evidence sample.
pub const SAMPLE_LABELS: [&str; 5] = ["node", "workload", "pod", "namespace", "cluster"];

/// Template variable holding the incident's document count.
pub const VALUE_VARIABLE: &str = "value";

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok());

/// Replaces `{{ .name }}` placeholders with values from `vars`.
///
/// Unknown names render as an empty string.
#[must_use]
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    })
    .into_owned()
}

/// Stable key for the evidence of an incident: SHA-256 of its ids, hex.
#[must_use]
pub fn fingerprint(ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Renders a record into the Alertmanager array-of-alerts body.
#[must_use]
pub fn render_payload(record: &AlertRecord, generator_url: &str) -> Value {
    let labels = &record.rule.query.labels;
    let mut vars = labels.clone();
    vars.insert(VALUE_VARIABLE.to_string(), record.current.count.to_string());

    let annotations: BTreeMap<String, String> = record
        .rule
        .query
        .annotations
        .iter()
        .map(|(k, tpl)| (k.clone(), render_template(tpl, &vars)))
        .collect();

    let mut alert = Map::new();
    alert.insert("labels".to_string(), json!(labels));
    alert.insert("annotations".to_string(), json!(annotations));
    alert.insert("startsAt".to_string(), json!(timestamp(record.starts_at)));
    if let Some(ends_at) = record.ends_at {
        alert.insert("endsAt".to_string(), json!(timestamp(ends_at)));
    }
    alert.insert("generatorURL".to_string(), json!(generator_url));
    Value::Array(vec![Value::Object(alert)])
}

/// Builds the deep link for an evidence key.
#[must_use]
pub fn generator_url(base_url: &str, key: &str) -> String {
    format!("{base_url}?key={key}")
}

/// One notification travelling through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Rule id.
    pub id: String,
    /// Rule source path.
    pub path: String,
    /// Rendered webhook body.
    pub payload: Value,
    /// Incident detection time.
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Builds the message for a record.
    #[must_use]
    pub fn new(record: &AlertRecord, payload: Value) -> Self {
        Self {
            id: record.rule.unique_id.clone(),
            path: record.rule.path.clone(),
            payload,
            starts_at: record.starts_at,
        }
    }
}

/// Evidence stored under an incident's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSample {
    /// Rule that produced the incident.
    pub rule_id: String,
    /// Store addresses.
    pub addresses: Vec<String>,
    /// Queried index.
    pub index: String,
    /// Timestamp field of the index.
    pub timestamp_field: String,
    /// Matched document ids.
    pub ids: Vec<String>,
    /// Topology labels copied from the rule.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Query string, if the rule uses one.
    #[serde(default)]
    pub query_string: Option<String>,
    /// Boolean query, if the rule uses one.
    #[serde(default)]
    pub boolean_query: Option<String>,
}

impl AlertSample {
    /// Captures the evidence of a record.
    #[must_use]
    pub fn from_record(record: &AlertRecord) -> Self {
        let rule = &record.rule;
        let labels = SAMPLE_LABELS
            .iter()
            .filter_map(|name| {
                rule.query
                    .labels
                    .get(*name)
                    .map(|v| ((*name).to_string(), v.clone()))
            })
            .collect();
        Self {
            rule_id: rule.unique_id.clone(),
            addresses: rule.es.addresses.clone(),
            index: rule.index.clone(),
            timestamp_field: rule.timestamp_field.clone(),
            ids: record.current.ids.clone(),
            labels,
            query_string: rule.query.query_string.clone(),
            boolean_query: rule.query.boolean_query.clone(),
        }
    }

    /// Evidence key.
    #[must_use]
    pub fn key(&self) -> String {
        fingerprint(&self.ids)
    }

    /// A rule able to re-fetch the sampled documents. Credentials come from
    /// `live` when the rule is still registered.
    #[must_use]
    pub fn lookup_rule(&self, live: Option<&Rule>) -> Rule {
        let es = live.map_or_else(
            || StoreConfig {
                addresses: self.addresses.clone(),
                ..StoreConfig::default()
            },
            |rule| rule.es.clone(),
        );
        Rule {
            unique_id: self.rule_id.clone(),
            enabled: true,
            es,
            index: self.index.clone(),
            run_every: crate::duration::TimeLimit::default(),
            timestamp_field: self.timestamp_field.clone(),
            query: QuerySpec::default(),
            path: live.map(|r| r.path.clone()).unwrap_or_default(),
        }
    }
}
