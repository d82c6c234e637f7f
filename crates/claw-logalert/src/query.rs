//! Query-engine seam and its Elasticsearch adapter.
//!
//! The engine never talks HTTP itself: it hands a rule and a request body to
//! a [`QueryEngine`] and gets back counts or decoded [`Document`]s together
//! with the status code the backend answered with. Every failure carries a
//! status too, so callers can label metrics uniformly.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{LogAlertError, Result, TRANSPORT_ERROR_STATUS};
use crate::rule::Rule;

/// Boxed future returned by [`QueryEngine`] methods.
pub type QueryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One matched log document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Store-assigned document id.
    pub id: String,
    /// Event time taken from the rule's timestamp field.
    pub timestamp: DateTime<Utc>,
    /// Raw document body.
    pub source: Value,
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// Decoded documents in response order.
    pub documents: Vec<Document>,
    /// Total hits the backend reported for the query.
    pub total: u64,
    /// Status code of the response.
    pub status: u16,
}

/// Executes count and search requests against a rule's store.
pub trait QueryEngine: Send + Sync + fmt::Debug {
    /// Counts documents matching `body`. Returns the count and status code.
    fn count<'a>(&'a self, rule: &'a Rule, body: Value) -> QueryFuture<'a, (u64, u16)>;

    /// Fetches documents matching `body`, projecting `_source` onto `fields`
    /// when it is non-empty.
    fn search<'a>(
        &'a self,
        rule: &'a Rule,
        body: Value,
        fields: &'a [String],
    ) -> QueryFuture<'a, SearchPage>;
}

/// [`QueryEngine`] over the Elasticsearch REST API.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
}

impl ElasticsearchClient {
    /// Creates a client with its own connection pool.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LogAlertError::config(format!("cannot build http client: {e}")))?;
        Ok(Self { http })
    }

    /// Creates a client sharing an existing pool.
    #[must_use]
    pub const fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// POSTs `body` to `{address}/{index}/{endpoint}`, trying each address
    /// in order until one answers.
    async fn post(&self, rule: &Rule, endpoint: &str, body: &Value) -> Result<(Value, u16)> {
        let mut last_error = String::from("no addresses configured");
        for address in &rule.es.addresses {
            let url = format!(
                "{}/{}/{endpoint}",
                address.trim_end_matches('/'),
                rule.index
            );
            let mut request = self.http.post(&url).timeout(rule.es.timeout()).json(body);
            if !rule.es.username.is_empty() {
                request = request.basic_auth(&rule.es.username, Some(&rule.es.password));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!(rule_id = %rule.unique_id, %url, error = %e, "store address unreachable");
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                let reason = response.text().await.unwrap_or_default();
                return Err(LogAlertError::Query {
                    status,
                    reason: truncate(&reason, 512),
                });
            }
            let value = response.json::<Value>().await.map_err(|e| LogAlertError::Query {
                status,
                reason: format!("malformed response body: {e}"),
            })?;
            return Ok((value, status));
        }
        Err(LogAlertError::Query {
            status: TRANSPORT_ERROR_STATUS,
            reason: last_error,
        })
    }
}

impl QueryEngine for ElasticsearchClient {
    fn count<'a>(&'a self, rule: &'a Rule, body: Value) -> QueryFuture<'a, (u64, u16)> {
        Box::pin(async move {
            let (value, status) = self.post(rule, "_count", &body).await?;
            let count = value
                .get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| LogAlertError::Query {
                    status,
                    reason: "count response has no count field".to_string(),
                })?;
            Ok((count, status))
        })
    }

    fn search<'a>(
        &'a self,
        rule: &'a Rule,
        mut body: Value,
        fields: &'a [String],
    ) -> QueryFuture<'a, SearchPage> {
        Box::pin(async move {
            if !fields.is_empty() {
                if let Some(object) = body.as_object_mut() {
                    object.insert("_source".to_string(), Value::from(fields.to_vec()));
                }
            }
            let (value, status) = self.post(rule, "_search", &body).await?;
            let mut page = decode_hits(&value, &rule.timestamp_field);
            page.status = status;
            Ok(page)
        })
    }
}

/// Decodes a `_search` response. Hits without a usable timestamp are dropped.
#[must_use]
pub fn decode_hits(response: &Value, timestamp_field: &str) -> SearchPage {
    let hits = response.get("hits");
    let total = hits
        .and_then(|h| h.get("total"))
        .and_then(|t| t.get("value").and_then(Value::as_u64).or_else(|| t.as_u64()))
        .unwrap_or_default();

    let documents = hits
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter_map(|hit| decode_hit(hit, timestamp_field))
                .collect()
        })
        .unwrap_or_default();

    SearchPage {
        documents,
        total,
        status: 200,
    }
}

fn decode_hit(hit: &Value, timestamp_field: &str) -> Option<Document> {
    let id = hit.get("_id").and_then(Value::as_str)?.to_string();
    let source = hit.get("_source").cloned().unwrap_or(Value::Null);
    let timestamp = source
        .get(timestamp_field)
        .and_then(parse_timestamp)
        .or_else(|| hit.get("sort").and_then(|s| s.get(0)).and_then(parse_timestamp));
    let Some(timestamp) = timestamp else {
        debug!(%id, field = timestamp_field, "dropping hit without timestamp");
        return None;
    };
    Some(Document {
        id,
        timestamp,
        source,
    })
}

/// Accepts RFC 3339 strings and epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// In-memory [`QueryEngine`] serving a fixed document set.
///
/// Searches page through the documents by `from`/`size`, or filter by id
/// when the body is an ids query. Failures can be injected per call kind.
#[derive(Debug, Clone, Default)]
pub struct StaticQueryEngine {
    inner: Arc<Mutex<StaticState>>,
}

#[derive(Debug, Default)]
struct StaticState {
    documents: Vec<Document>,
    count_failure: Option<u16>,
    search_failure: Option<u16>,
    count_calls: usize,
    search_calls: usize,
}

impl StaticQueryEngine {
    /// Creates an engine serving `documents`.
    #[must_use]
    pub fn new(documents: Vec<Document>) -> Self {
        let engine = Self::default();
        engine.set_documents(documents);
        engine
    }

    /// Replaces the served documents.
    pub fn set_documents(&self, documents: Vec<Document>) {
        self.inner.lock().documents = documents;
    }

    /// Makes count calls fail with `status` (or succeed again with `None`).
    pub fn fail_counts(&self, status: Option<u16>) {
        self.inner.lock().count_failure = status;
    }

    /// Makes search calls fail with `status` (or succeed again with `None`).
    pub fn fail_searches(&self, status: Option<u16>) {
        self.inner.lock().search_failure = status;
    }

    /// Number of count calls served.
    #[must_use]
    pub fn count_calls(&self) -> usize {
        self.inner.lock().count_calls
    }

    /// Number of search calls served.
    #[must_use]
    pub fn search_calls(&self) -> usize {
        self.inner.lock().search_calls
    }
}

impl QueryEngine for StaticQueryEngine {
    fn count<'a>(&'a self, _rule: &'a Rule, _body: Value) -> QueryFuture<'a, (u64, u16)> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            state.count_calls += 1;
            if let Some(status) = state.count_failure {
                return Err(LogAlertError::Query {
                    status,
                    reason: "injected count failure".to_string(),
                });
            }
            Ok((state.documents.len() as u64, 200))
        })
    }

    fn search<'a>(
        &'a self,
        _rule: &'a Rule,
        body: Value,
        _fields: &'a [String],
    ) -> QueryFuture<'a, SearchPage> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            state.search_calls += 1;
            if let Some(status) = state.search_failure {
                warn!(status, "injected search failure");
                return Err(LogAlertError::Query {
                    status,
                    reason: "injected search failure".to_string(),
                });
            }
            let total = state.documents.len() as u64;
            let documents = if let Some(ids) = body.pointer("/query/ids/values").and_then(Value::as_array) {
                state
                    .documents
                    .iter()
                    .filter(|d| ids.iter().any(|id| id.as_str() == Some(d.id.as_str())))
                    .cloned()
                    .collect()
            } else {
                let from = body.get("from").and_then(Value::as_u64).unwrap_or(0) as usize;
                let size = body.get("size").and_then(Value::as_u64).unwrap_or(total) as usize;
                state.documents.iter().skip(from).take(size).cloned().collect()
            };
            Ok(SearchPage {
                documents,
                total,
                status: 200,
            })
        })
    }
}
