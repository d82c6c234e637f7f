//! Shared engine state and the body of one evaluation tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error};

use crate::config::{AppConfig, ConfigHandle};
use crate::delivery::DeliveryPipeline;
use crate::job::Job;
use crate::lifecycle::{AlertLifecycle, Transition};
use crate::matcher::MatchEngine;
use crate::metrics::EngineMetrics;
use crate::query::QueryEngine;
use crate::queue::{InMemoryQueue, QueueBackend};
use crate::registry::RuleRegistry;
use crate::window::{EvaluationWindow, WindowedQueryEvaluator, lookback};
use crate::webhook::WebhookTransport;

/// Result of one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The rule or job was gone before the tick started.
    Skipped,
    /// The rule's match strategy is unknown; nothing was queried.
    Aborted,
    /// The job was stopped or replaced while the tick ran; results dropped.
    Stale,
    /// Results were applied to the alert table.
    Applied {
        /// Window that was queried.
        window: EvaluationWindow,
        /// Effect on the rule's alert record.
        transition: Transition,
    },
}

/// Everything the per-rule and global tasks share.
#[derive(Debug)]
pub struct EngineState {
    pub(crate) config: ConfigHandle,
    pub(crate) registry: Arc<RuleRegistry>,
    pub(crate) jobs: DashMap<String, Arc<Job>>,
    pub(crate) lifecycle: Arc<AlertLifecycle>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) evaluator: WindowedQueryEvaluator,
    pub(crate) matcher: MatchEngine,
    pub(crate) pipeline: DeliveryPipeline,
}

impl EngineState {
    /// Returns true while `job` is the registered job for its rule.
    #[must_use]
    pub fn is_live(&self, job: &Job) -> bool {
        self.jobs
            .get(job.rule_id())
            .is_some_and(|live| live.generation() == job.generation())
    }

    /// Runs one tick for `job` at the current time.
    pub async fn evaluate(&self, job: &Job) -> TickOutcome {
        self.evaluate_at(job, Utc::now()).await
    }

    /// Runs one tick for `job` as if the clock read `now`.
    pub async fn evaluate_at(&self, job: &Job, now: DateTime<Utc>) -> TickOutcome {
        let rule_id = job.rule_id();
        let Some(rule) = self.registry.get(rule_id) else {
            return TickOutcome::Skipped;
        };
        if !self.is_live(job) {
            return TickOutcome::Skipped;
        }
        let config: Arc<AppConfig> = self.config.load();

        let strategy = match self.matcher.resolve(&rule.query.strategy) {
            Ok(strategy) => strategy,
            Err(e) => {
                error!(rule_id, path = %rule.path, error = %e, "evaluation aborted");
                return TickOutcome::Aborted;
            }
        };

        let window = job.next_window(now, lookback(&rule, &config));
        let documents = self
            .evaluator
            .fetch(&rule, job.generation(), window, &config)
            .await;
        let matched = if documents.is_empty() {
            None
        } else {
            strategy.select(&rule, strategy.group(&rule, &documents))
        };
        debug!(
            rule_id,
            start = %window.start,
            end = %window.end,
            documents = documents.len(),
            matched = matched.is_some(),
            "tick evaluated"
        );

        // The job guard is held while committing so a concurrent stop cannot
        // interleave between the liveness check and the write.
        let Some(live) = self.jobs.get(rule_id) else {
            debug!(rule_id, "rule stopped during tick, results dropped");
            return TickOutcome::Stale;
        };
        if live.generation() != job.generation() {
            debug!(rule_id, "rule restarted during tick, results dropped");
            return TickOutcome::Stale;
        }
        let transition = self.lifecycle.apply(rule, matched, now);
        if transition.matched() {
            job.advance(window.end);
        }
        drop(live);

        TickOutcome::Applied { window, transition }
    }
}

/// Assembles an engine from its collaborators.
#[derive(Debug)]
pub struct EngineBuilder {
    config: AppConfig,
    query: Arc<dyn QueryEngine>,
    queue: Option<Arc<dyn QueueBackend>>,
    webhook: Option<Arc<dyn WebhookTransport>>,
    matcher: MatchEngine,
}

impl EngineBuilder {
    /// Starts a builder with the mandatory pieces.
    #[must_use]
    pub fn new(config: AppConfig, query: Arc<dyn QueryEngine>) -> Self {
        Self {
            config,
            query,
            queue: None,
            webhook: None,
            matcher: MatchEngine::new(),
        }
    }

    /// Uses `queue` instead of a fresh [`InMemoryQueue`].
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets the webhook used by the consumer.
    #[must_use]
    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookTransport>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Replaces the strategy table.
    #[must_use]
    pub fn with_match_engine(mut self, matcher: MatchEngine) -> Self {
        self.matcher = matcher;
        self
    }

    /// Builds the shared state.
    #[must_use]
    pub fn build_state(self) -> EngineState {
        let metrics = Arc::new(EngineMetrics::new());
        let lifecycle = Arc::new(AlertLifecycle::new());
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new()));
        EngineState {
            config: ConfigHandle::new(self.config),
            registry: Arc::new(RuleRegistry::new()),
            jobs: DashMap::new(),
            lifecycle: Arc::clone(&lifecycle),
            metrics: Arc::clone(&metrics),
            evaluator: WindowedQueryEvaluator::new(self.query, Arc::clone(&metrics)),
            matcher: self.matcher,
            pipeline: DeliveryPipeline::new(lifecycle, queue, self.webhook, metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AlertState;
    use crate::query::StaticQueryEngine;
    use crate::testing::{base_time, docs_at, rule_with_id};
    use chrono::TimeDelta;

    fn state(engine: &StaticQueryEngine) -> EngineState {
        EngineBuilder::new(AppConfig::default(), Arc::new(engine.clone())).build_state()
    }

    fn register(state: &EngineState, id: &str, generation: u64) -> Arc<Job> {
        let rule = Arc::new(rule_with_id(id));
        state.registry.insert(Arc::clone(&rule));
        state
            .metrics
            .register_rule(id, generation, &rule.path, &rule.es.address_label(), &rule.index, true);
        let job = Job::new(id, generation);
        state.jobs.insert(id.to_string(), Arc::clone(&job));
        job
    }

    #[tokio::test]
    async fn tick_opens_then_resolves() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 10, 20, 30, 40]));
        let state = state(&engine);
        let job = register(&state, "r", 1);
        let now = base_time() + TimeDelta::minutes(1);

        let outcome = state.evaluate_at(&job, now).await;
        let TickOutcome::Applied { transition, .. } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(transition, Transition::Opened);
        let record = state.lifecycle.get("r").expect("record");
        assert_eq!(record.state, AlertState::Pending);
        assert_eq!(record.current.count, 5);
        assert_eq!(record.starts_at, base_time());

        engine.set_documents(Vec::new());
        let later = now + TimeDelta::minutes(10);
        let outcome = state.evaluate_at(&job, later).await;
        assert!(matches!(
            outcome,
            TickOutcome::Applied { transition: Transition::Resolved, .. }
        ));
        assert_eq!(state.lifecycle.get("r").and_then(|r| r.ends_at), Some(later));
    }

    #[tokio::test]
    async fn continuation_advances_next_window() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 10, 20]));
        let state = state(&engine);
        let job = register(&state, "r", 1);
        let now = base_time() + TimeDelta::minutes(1);

        let first = state.evaluate_at(&job, now).await;
        let TickOutcome::Applied { window: first_window, .. } = first else {
            panic!("expected applied");
        };
        assert_eq!(job.window_state().pending_resume(), Some(first_window.end));

        let next = now + TimeDelta::seconds(30);
        let second = state.evaluate_at(&job, next).await;
        let TickOutcome::Applied { window, transition } = second else {
            panic!("expected applied");
        };
        assert_eq!(window.start, first_window.end);
        assert_eq!(transition, Transition::Continued);
    }

    #[tokio::test]
    async fn unknown_strategy_aborts_without_querying() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1, 2]));
        let state = state(&engine);
        let job = register(&state, "r", 1);
        let mut rule = rule_with_id("r");
        rule.query.strategy = "spike".to_string();
        state.registry.insert(Arc::new(rule));

        assert_eq!(state.evaluate(&job).await, TickOutcome::Aborted);
        assert_eq!(engine.count_calls(), 0);
        assert!(state.lifecycle.is_empty());
    }

    #[tokio::test]
    async fn replaced_job_cannot_commit() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1, 2]));
        let state = state(&engine);
        let old = register(&state, "r", 1);
        // A restart swaps in a newer generation.
        register(&state, "r", 2);

        assert_eq!(state.evaluate(&old).await, TickOutcome::Skipped);
        assert!(state.lifecycle.is_empty());
    }

    #[tokio::test]
    async fn removed_rule_is_skipped() {
        let engine = StaticQueryEngine::new(docs_at(&[0, 1, 2]));
        let state = state(&engine);
        let job = register(&state, "r", 1);
        state.registry.remove("r");
        assert_eq!(state.evaluate(&job).await, TickOutcome::Skipped);
    }
}
