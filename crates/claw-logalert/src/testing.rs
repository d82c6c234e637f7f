//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::query::Document;
use crate::rule::Rule;

/// A valid frequency rule: 5 minute timeframe, threshold 3.
pub const RULE_YAML: &str = r#"
unique_id: app-errors
es:
  addresses: ["http://127.0.0.1:9200"]
index: app-*
run_every:
  seconds: 1
query:
  type: frequency
  config:
    timeframe:
      minutes: 5
    num_events: 3
  query_string: 'level: error'
  labels:
    alertname: AppErrors
    severity: warning
  annotations:
    summary: "{{ .value }} errors in {{ .alertname }}"
"#;

pub fn rule_with_id(id: &str) -> Rule {
    let mut rule = Rule::from_yaml(RULE_YAML, format!("rules/{id}.rule.yaml")).expect("fixture");
    rule.unique_id = id.to_string();
    rule
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("fixture time")
}

/// Documents at the given second offsets from [`base_time`].
pub fn docs_at(offsets: &[i64]) -> Vec<Document> {
    offsets
        .iter()
        .enumerate()
        .map(|(i, secs)| Document {
            id: format!("doc-{i}"),
            timestamp: base_time() + TimeDelta::seconds(*secs),
            source: serde_json::json!({ "message": format!("event {i}") }),
        })
        .collect()
}
