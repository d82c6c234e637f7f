//! Rule definitions and the query documents derived from them.
//!
//! A [`Rule`] is parsed from a `*.rule.yaml` document, validated once at load
//! time and then shared immutably (`Arc<Rule>`) for as long as it stays
//! registered. Reloads replace rules wholesale.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::duration::TimeLimit;
use crate::error::{LogAlertError, Result};

/// File suffix that marks a rule document.
pub const RULE_FILE_SUFFIX: &str = ".rule.yaml";

/// Label every rule must define.
pub const ALERTNAME_LABEL: &str = "alertname";

fn default_true() -> bool {
    true
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

fn default_conn_timeout() -> u64 {
    10
}

fn default_store_version() -> String {
    "v7".to_string()
}

/// Connection settings for the search store a rule queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URLs, tried in order.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Basic-auth user; empty disables auth.
    #[serde(default)]
    pub username: String,
    /// Basic-auth password.
    #[serde(default)]
    pub password: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout: u64,
    /// Store API version.
    #[serde(default = "default_store_version")]
    pub version: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            username: String::new(),
            password: String::new(),
            conn_timeout: default_conn_timeout(),
            version: default_store_version(),
        }
    }
}

impl StoreConfig {
    /// Addresses joined the way they appear in metric labels.
    #[must_use]
    pub fn address_label(&self) -> String {
        self.addresses.join(",")
    }

    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout)
    }
}

/// Grouping parameters for a rule's match strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Length of one incident group.
    pub timeframe: TimeLimit,
    /// Minimum documents a group needs to qualify.
    pub num_events: u64,
}

/// What to search for and how to label the resulting alert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    /// Name of the match strategy (for example `frequency`).
    #[serde(rename = "type")]
    pub strategy: String,
    /// Strategy parameters.
    pub config: QueryConfig,
    /// Lucene-style query string.
    pub query_string: Option<String>,
    /// Structured boolean query, as JSON text.
    pub boolean_query: Option<String>,
    /// Alert labels.
    pub labels: BTreeMap<String, String>,
    /// Annotation templates.
    pub annotations: BTreeMap<String, String>,
}

/// A user-authored alerting rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier.
    pub unique_id: String,
    /// Disabled rules are registered but never evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Search store connection.
    #[serde(default)]
    pub es: StoreConfig,
    /// Index (or pattern) to query.
    #[serde(default)]
    pub index: String,
    /// Evaluation interval.
    #[serde(default)]
    pub run_every: TimeLimit,
    /// Document field holding the event time.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Query and grouping definition.
    #[serde(default)]
    pub query: QuerySpec,
    /// Where the rule was loaded from.
    #[serde(skip)]
    pub path: String,
}

impl Rule {
    /// Parses and validates a rule document.
    pub fn from_yaml(content: &str, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let mut rule: Self = serde_yaml::from_str(content)
            .map_err(|e| LogAlertError::invalid_rule(&path, e.to_string()))?;
        rule.path = path;
        rule.validate()?;
        Ok(rule)
    }

    /// Checks the load-time invariants. The strategy name is not checked here.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(LogAlertError::invalid_rule(&self.path, reason));

        if self.unique_id.trim().is_empty() {
            return fail("unique_id is empty");
        }
        if self.index.trim().is_empty() {
            return fail("index is empty");
        }
        if self.es.addresses.is_empty() {
            return fail("es.addresses needs at least one address");
        }
        if self.run_every.is_zero() {
            return fail("run_every must be non-zero");
        }
        match (&self.query.query_string, &self.query.boolean_query) {
            (Some(_), Some(_)) => {
                return fail("query_string and boolean_query are mutually exclusive");
            }
            (None, None) => return fail("one of query_string or boolean_query is required"),
            (None, Some(raw)) => {
                let parsed: Value = serde_json::from_str(raw).map_err(|e| {
                    LogAlertError::invalid_rule(&self.path, format!("boolean_query: {e}"))
                })?;
                if !parsed.is_object() {
                    return fail("boolean_query must be a JSON object");
                }
            }
            (Some(_), None) => {}
        }
        if !self.query.labels.contains_key(ALERTNAME_LABEL) {
            return fail("labels.alertname is required");
        }
        Ok(())
    }

    /// Rule id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.unique_id
    }

    /// Grouping timeframe; zero when unset.
    #[must_use]
    pub const fn timeframe(&self) -> Duration {
        self.query.config.timeframe.as_duration()
    }

    /// Evaluation interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.run_every.as_duration()
    }

    /// Minimum group size for a match.
    #[must_use]
    pub const fn threshold(&self) -> u64 {
        self.query.config.num_events
    }

    /// Builds the count request body for `[start, end)`.
    pub fn count_query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Value> {
        Ok(json!({ "query": self.filter_query(start, end)? }))
    }

    /// Builds one page of the search request body for `[start, end)`.
    pub fn search_query(
        &self,
        from: u64,
        size: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Value> {
        Ok(json!({
            "query": self.filter_query(start, end)?,
            "sort": [{ self.timestamp_field.as_str(): { "order": "asc" } }],
            "from": from,
            "size": size,
        }))
    }

    /// Builds a request fetching the given document ids in time order.
    #[must_use]
    pub fn ids_query(&self, ids: &[String]) -> Value {
        json!({
            "query": { "ids": { "values": ids } },
            "sort": [{ self.timestamp_field.as_str(): { "order": "asc" } }],
            "size": ids.len(),
        })
    }

    fn time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
        json!({
            "range": {
                self.timestamp_field.as_str(): {
                    "format": "strict_date_optional_time",
                    "gte": start.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "lt": end.to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            }
        })
    }

    fn filter_query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Value> {
        let range = self.time_range(start, end);
        if let Some(raw) = &self.query.boolean_query {
            let mut query: Value = serde_json::from_str(raw)?;
            inject_time_range(&mut query, &self.timestamp_field, range);
            return Ok(query);
        }
        let query_string = self.query.query_string.as_deref().unwrap_or_default();
        Ok(json!({
            "bool": {
                "must": [
                    { "query_string": { "query": query_string } },
                    range,
                ]
            }
        }))
    }
}

/// Adds `range` to `bool.filter`, replacing any range on the same field.
///
/// Queries without a top-level `bool` are left untouched.
fn inject_time_range(query: &mut Value, field: &str, range: Value) {
    let Some(bool_clause) = query.get_mut("bool").and_then(Value::as_object_mut) else {
        return;
    };
    let filter = bool_clause
        .entry("filter")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Object(single) = filter {
        let single = Value::Object(std::mem::take(single));
        *filter = Value::Array(vec![single]);
    }
    if let Value::Array(clauses) = filter {
        clauses.retain(|clause| !is_range_on(clause, field));
        clauses.push(range);
    }
}

fn is_range_on(clause: &Value, field: &str) -> bool {
    clause
        .get("range")
        .and_then(Value::as_object)
        .is_some_and(|r: &Map<String, Value>| r.contains_key(field))
}
