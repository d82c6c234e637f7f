//! Evaluation windows and the paginated fetch behind each tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AppConfig, DEFAULT_BUFFER};
use crate::duration::to_time_delta;
use crate::metrics::EngineMetrics;
use crate::query::{Document, QueryEngine};
use crate::rule::Rule;

/// Lookback for one rule: its own timeframe, else the process default,
/// else one minute.
#[must_use]
pub fn buffer_duration(rule: &Rule, config: &AppConfig) -> Duration {
    if !rule.query.config.timeframe.is_zero() {
        return rule.timeframe();
    }
    config.buffer_time().unwrap_or(DEFAULT_BUFFER)
}

/// Half-open time range `[start, end)` queried by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
}

impl EvaluationWindow {
    /// Trailing window of `lookback` ending at `now`.
    #[must_use]
    pub fn trailing(now: DateTime<Utc>, lookback: TimeDelta) -> Self {
        Self {
            start: now - lookback,
            end: now,
        }
    }

    /// Window length.
    #[must_use]
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Number of pages needed for `count` documents, after the optional cap.
#[must_use]
pub fn page_count(count: u64, page_size: u64, limit: Option<u64>) -> u64 {
    if page_size == 0 {
        return 0;
    }
    let pages = count.div_ceil(page_size);
    limit.map_or(pages, |cap| pages.min(cap))
}

/// Runs the count query and the page fetches for one tick.
#[derive(Debug, Clone)]
pub struct WindowedQueryEvaluator {
    engine: Arc<dyn QueryEngine>,
    metrics: Arc<EngineMetrics>,
}

impl WindowedQueryEvaluator {
    /// Creates an evaluator over `engine`, reporting into `metrics`.
    #[must_use]
    pub fn new(engine: Arc<dyn QueryEngine>, metrics: Arc<EngineMetrics>) -> Self {
        Self { engine, metrics }
    }

    /// The underlying query engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn QueryEngine> {
        &self.engine
    }

    /// Fetches every document of `window`, ordered by timestamp.
    ///
    /// Query failures are logged and count as zero documents; a failed page
    /// does not affect the others.
    pub async fn fetch(
        &self,
        rule: &Rule,
        generation: u64,
        window: EvaluationWindow,
        config: &AppConfig,
    ) -> Vec<Document> {
        let count = match self.count(rule, generation, window).await {
            Some(count) => count,
            None => return Vec::new(),
        };
        let pages = page_count(count, config.page_size, config.page_limit());
        debug!(rule_id = %rule.unique_id, index = %rule.index, count, pages, "counted window");
        if pages == 0 {
            return Vec::new();
        }

        let merged = Mutex::new(Vec::with_capacity(count.min(config.page_size * pages) as usize));
        let fetches = (0..pages).map(|page| {
            let merged = &merged;
            async move {
                let documents = self
                    .page(rule, generation, window, page * config.page_size, config.page_size)
                    .await;
                merged.lock().extend(documents);
            }
        });
        join_all(fetches).await;

        let mut documents = merged.into_inner();
        documents.sort_by_key(|d| d.timestamp);
        documents
    }

    async fn count(&self, rule: &Rule, generation: u64, window: EvaluationWindow) -> Option<u64> {
        let body = match rule.count_query(window.start, window.end) {
            Ok(body) => body,
            Err(e) => {
                warn!(rule_id = %rule.unique_id, error = %e, "cannot build count query");
                return None;
            }
        };
        match self.engine.count(rule, body).await {
            Ok((count, status)) => {
                self.metrics.record_query(&rule.unique_id, generation, status);
                Some(count)
            }
            Err(e) => {
                let status = e.status().unwrap_or_default();
                self.metrics.record_query(&rule.unique_id, generation, status);
                warn!(rule_id = %rule.unique_id, index = %rule.index, status, error = %e, "count query failed");
                None
            }
        }
    }

    async fn page(
        &self,
        rule: &Rule,
        generation: u64,
        window: EvaluationWindow,
        from: u64,
        size: u64,
    ) -> Vec<Document> {
        let body = match rule.search_query(from, size, window.start, window.end) {
            Ok(body) => body,
            Err(e) => {
                warn!(rule_id = %rule.unique_id, error = %e, "cannot build search query");
                return Vec::new();
            }
        };
        match self.engine.search(rule, body, &[]).await {
            Ok(page) => {
                self.metrics.record_query(&rule.unique_id, generation, page.status);
                page.documents
            }
            Err(e) => {
                let status = e.status().unwrap_or_default();
                self.metrics.record_query(&rule.unique_id, generation, status);
                warn!(rule_id = %rule.unique_id, index = %rule.index, from, status, error = %e, "page fetch failed");
                Vec::new()
            }
        }
    }
}

/// Converts a lookback to a chrono delta.
#[must_use]
pub fn lookback(rule: &Rule, config: &AppConfig) -> TimeDelta {
    to_time_delta(buffer_duration(rule, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::TimeLimit;
    use crate::error::LogAlertError;
    use crate::query::{QueryFuture, SearchPage, StaticQueryEngine};
    use serde_json::Value;
    use crate::testing::{base_time, docs_at, rule_with_id};
    use test_case::test_case;

    #[test_case(TimeLimit::seconds(5), TimeLimit::minutes(5), 5 ; "rule timeframe wins")]
    #[test_case(TimeLimit::default(), TimeLimit::minutes(5), 300 ; "process buffer when rule empty")]
    #[test_case(TimeLimit::default(), TimeLimit::default(), 60 ; "one minute when both empty")]
    #[test_case(TimeLimit::seconds(5), TimeLimit::default(), 5 ; "rule timeframe without process buffer")]
    fn buffer_precedence(timeframe: TimeLimit, buffer: TimeLimit, expected_secs: u64) {
        let mut rule = rule_with_id("r");
        rule.query.config.timeframe = timeframe;
        let config = AppConfig {
            buffer_time: buffer,
            ..AppConfig::default()
        };
        assert_eq!(buffer_duration(&rule, &config), Duration::from_secs(expected_secs));
    }

    #[test_case(0, 10, None, 0 ; "nothing to fetch")]
    #[test_case(1, 10, None, 1 ; "partial page")]
    #[test_case(20, 10, None, 2 ; "exact pages")]
    #[test_case(95, 10, Some(5), 5 ; "clamped")]
    #[test_case(95, 10, None, 10 ; "unlimited")]
    fn pages(count: u64, size: u64, limit: Option<u64>, expected: u64) {
        assert_eq!(page_count(count, size, limit), expected);
    }

    fn small_pages() -> AppConfig {
        AppConfig {
            page_size: 2,
            max_scrolling_count: 0,
            ..AppConfig::default()
        }
    }

    fn evaluator(engine: &StaticQueryEngine) -> (WindowedQueryEvaluator, Arc<EngineMetrics>) {
        let metrics = Arc::new(EngineMetrics::new());
        metrics.register_rule("r", 1, "p", "a", "i", true);
        (
            WindowedQueryEvaluator::new(Arc::new(engine.clone()), Arc::clone(&metrics)),
            metrics,
        )
    }

    fn window() -> EvaluationWindow {
        EvaluationWindow::trailing(base_time() + TimeDelta::minutes(10), TimeDelta::minutes(10))
    }

    #[tokio::test]
    async fn merges_pages_in_time_order() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1, 2, 3, 4]));
        let (evaluator, metrics) = evaluator(&engine);
        let rule = rule_with_id("r");

        let docs = evaluator.fetch(&rule, 1, window(), &small_pages()).await;
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2", "doc-3", "doc-4"]);
        assert_eq!(engine.search_calls(), 3);
        // One count plus three pages.
        assert_eq!(metrics.query_count("r", 200), 4);
    }

    #[tokio::test]
    async fn page_cap_limits_fetches() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1, 2, 3, 4]));
        let (evaluator, _) = evaluator(&engine);
        let config = AppConfig {
            max_scrolling_count: 1,
            ..small_pages()
        };
        let docs = evaluator.fetch(&rule_with_id("r"), 1, window(), &config).await;
        assert_eq!(docs.len(), 2);
        assert_eq!(engine.search_calls(), 1);
    }

    #[tokio::test]
    async fn failed_count_yields_nothing() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1]));
        engine.fail_counts(Some(503));
        let (evaluator, metrics) = evaluator(&engine);
        let docs = evaluator.fetch(&rule_with_id("r"), 1, window(), &small_pages()).await;
        assert!(docs.is_empty());
        assert_eq!(engine.search_calls(), 0);
        assert_eq!(metrics.query_count("r", 503), 1);
    }

    /// Fails the page starting at `failing_from` and serves the rest.
    #[derive(Debug)]
    struct OnePageFails {
        inner: StaticQueryEngine,
        failing_from: u64,
    }

    impl QueryEngine for OnePageFails {
        fn count<'a>(&'a self, rule: &'a Rule, body: Value) -> QueryFuture<'a, (u64, u16)> {
            self.inner.count(rule, body)
        }

        fn search<'a>(
            &'a self,
            rule: &'a Rule,
            body: Value,
            fields: &'a [String],
        ) -> QueryFuture<'a, SearchPage> {
            let from = body.get("from").and_then(Value::as_u64).unwrap_or(0);
            if from == self.failing_from {
                return Box::pin(async {
                    Err(LogAlertError::Query {
                        status: 502,
                        reason: "shard unavailable".to_string(),
                    })
                });
            }
            self.inner.search(rule, body, fields)
        }
    }

    #[test_case(0, &["doc-2", "doc-3", "doc-4"] ; "first page")]
    #[test_case(1, &["doc-0", "doc-1", "doc-4"] ; "middle page")]
    #[test_case(2, &["doc-0", "doc-1", "doc-2", "doc-3"] ; "last page")]
    #[tokio::test]
    async fn one_failed_page_keeps_the_others(failing_page: u64, expected: &[&str]) {
        let config = small_pages();
        let engine = OnePageFails {
            inner: StaticQueryEngine::new(docs_at(&[0, 1, 2, 3, 4])),
            failing_from: failing_page * config.page_size,
        };
        let metrics = Arc::new(EngineMetrics::new());
        metrics.register_rule("r", 1, "p", "a", "i", true);
        let evaluator = WindowedQueryEvaluator::new(Arc::new(engine), Arc::clone(&metrics));

        let docs = evaluator.fetch(&rule_with_id("r"), 1, window(), &config).await;
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, expected);
        assert!(docs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(metrics.query_count("r", 502), 1);
        // The count plus the two pages that answered.
        assert_eq!(metrics.query_count("r", 200), 3);
    }

    #[tokio::test]
    async fn failed_pages_count_as_empty() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1, 2]));
        engine.fail_searches(Some(500));
        let (evaluator, metrics) = evaluator(&engine);
        let docs = evaluator.fetch(&rule_with_id("r"), 1, window(), &small_pages()).await;
        assert!(docs.is_empty());
        assert_eq!(metrics.query_count("r", 500), 2);
    }
}
