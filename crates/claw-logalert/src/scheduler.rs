//! Lifecycle of the per-rule evaluation tasks and the two global tasks.
//!
//! Every rule gets one tokio task driving [`EngineState::evaluate`] on its
//! interval. Ticks within a task run one after another, and a tick that
//! would start while the previous one is still running is skipped. Start,
//! stop and restart for the same id are serialized through a per-id lock;
//! each start mints a new generation so a tick from a replaced job can never
//! commit into the alert table or the metrics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigHandle};
use crate::delivery::DeliveryPipeline;
use crate::engine::{EngineState, TickOutcome};
use crate::job::Job;
use crate::lifecycle::AlertLifecycle;
use crate::metrics::EngineMetrics;
use crate::query::QueryEngine;
use crate::registry::RuleRegistry;
use crate::rule::Rule;

/// Owns the rule tasks and the dispatch and consumer loops.
#[derive(Debug)]
pub struct SchedulerManager {
    state: Arc<EngineState>,
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    global: Mutex<Vec<JoinHandle<()>>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerManager {
    /// Wraps already assembled engine state.
    #[must_use]
    pub fn new(state: EngineState) -> Self {
        Self {
            state: Arc::new(state),
            op_locks: DashMap::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            global: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.op_locks.entry(id.to_string()).or_default().value())
    }

    /// Schedules `rule`, replacing any job already registered for its id.
    ///
    /// A disabled rule is registered without a task so its metrics still
    /// report it.
    pub async fn start(&self, rule: Rule) {
        let lock = self.op_lock(rule.id());
        let _guard = lock.lock().await;
        self.stop_locked(rule.id());
        self.start_locked(rule);
    }

    /// Stops the job for `id` and forgets its rule, alert and metrics.
    ///
    /// Returns without waiting for an in-flight tick; its results are
    /// discarded and [`SchedulerManager::stop_all`] still joins its task.
    pub async fn stop(&self, id: &str) -> bool {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;
        let stopped = self.stop_locked(id);
        // Only this call and the map hold the lock when nobody is queued on it.
        self.op_locks.remove_if(id, |_, l| Arc::strong_count(l) == 2);
        stopped
    }

    /// Stops then starts `rule` under one lock hold.
    pub async fn restart(&self, rule: Rule) {
        self.start(rule).await;
    }

    fn start_locked(&self, rule: Rule) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let rule = Arc::new(rule);
        let id = rule.unique_id.clone();

        self.state.registry.insert(Arc::clone(&rule));
        self.state.metrics.register_rule(
            &id,
            generation,
            &rule.path,
            &rule.es.address_label(),
            &rule.index,
            rule.enabled,
        );

        let job = Job::new(id.clone(), generation);
        if rule.enabled {
            let interval = rule.interval();
            let handle = tokio::spawn(run_rule(
                Arc::clone(&self.state),
                Arc::clone(&job),
                interval,
            ));
            job.attach(handle);
            info!(rule_id = %id, path = %rule.path, generation, ?interval, "rule scheduled");
        } else {
            warn!(rule_id = %id, path = %rule.path, "rule is disabled, not scheduled");
        }
        self.state.jobs.insert(id, job);
    }

    fn stop_locked(&self, id: &str) -> bool {
        let removed = self.state.jobs.remove(id);
        self.state.registry.remove(id);
        self.state.lifecycle.remove(id);
        self.state.metrics.remove_rule(id);
        match removed {
            Some((_, job)) => {
                job.cancel();
                if let Some(handle) = job.take_handle() {
                    let mut retired = self.retired.lock();
                    retired.retain(|h| !h.is_finished());
                    retired.push(handle);
                }
                info!(rule_id = %id, generation = job.generation(), "rule stopped");
                true
            }
            None => false,
        }
    }

    /// Makes the scheduled set equal to `rules`: new ids start, known ids
    /// restart and ids not present stop.
    pub async fn reconcile(&self, rules: BTreeMap<String, Arc<Rule>>) {
        let stale: Vec<String> = self
            .rule_ids()
            .into_iter()
            .filter(|id| !rules.contains_key(id))
            .collect();
        for id in stale {
            self.stop(&id).await;
        }
        for rule in rules.into_values() {
            self.start(Rule::clone(&rule)).await;
        }
    }

    /// Starts the dispatch loop. Each tick pushes every alert record to the
    /// queue.
    pub fn start_global_dispatch(&self, interval: Duration) {
        let state = Arc::clone(&self.state);
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            let period = interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let config = state.config.load();
                let report = state.pipeline.dispatch_once(&config).await;
                debug!(
                    records = report.records,
                    pushed = report.pushed,
                    removed = report.removed,
                    "dispatch tick"
                );
            }
            debug!("dispatch loop stopped");
        });
        self.global.lock().push(handle);
        info!(?interval, "global dispatch started");
    }

    /// Starts the queue consumer.
    pub fn start_consumer(&self) {
        let state = Arc::clone(&self.state);
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            state
                .pipeline
                .run_consumer(state.config.clone(), cancel)
                .await;
        });
        self.global.lock().push(handle);
        info!("queue consumer started");
    }

    /// Cancels every task and waits for all of them to finish.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let jobs: Vec<Arc<Job>> = self
            .state
            .jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut handles = Vec::new();
        for job in &jobs {
            job.cancel();
            if let Some(handle) = job.take_handle() {
                handles.push(handle);
            }
        }
        handles.append(&mut self.retired.lock());
        handles.append(&mut self.global.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "task ended abnormally");
            }
        }
        info!(rules = jobs.len(), "scheduler stopped");
    }

    /// Installs a new configuration snapshot. Running jobs keep their
    /// interval; later ticks read the new buffer and paging settings.
    ///
    /// The webhook and the consumer are built once at startup, so the
    /// `alert.alertmanager` section keeps its running value. Returns false
    /// when a change to that section was discarded.
    pub fn set_config(&self, mut config: AppConfig) -> bool {
        let running = self.state.config.load();
        let kept = config.alert.alertmanager == running.alert.alertmanager;
        if !kept {
            warn!("alert.alertmanager changes take effect after a restart, keeping the running settings");
            config.alert.alertmanager = running.alert.alertmanager.clone();
        }
        self.state.config.store(config);
        info!("configuration replaced");
        kept
    }

    /// Runs one tick for `id` immediately, outside its task.
    pub async fn evaluate_now(&self, id: &str) -> Option<TickOutcome> {
        let job = self.job(id)?;
        Some(self.state.evaluate(&job).await)
    }

    /// Job registered for `id`.
    #[must_use]
    pub fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.state.jobs.get(id).map(|j| Arc::clone(j.value()))
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.state.jobs.len()
    }

    /// Ids with a registered job, sorted.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Shared configuration handle.
    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.state.config
    }

    /// Rule registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.state.registry
    }

    /// Alert table.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<AlertLifecycle> {
        &self.state.lifecycle
    }

    /// Engine metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.state.metrics
    }

    /// Delivery pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &DeliveryPipeline {
        &self.state.pipeline
    }

    /// Query engine used by every rule.
    #[must_use]
    pub fn query_engine(&self) -> &Arc<dyn QueryEngine> {
        self.state.evaluator.engine()
    }

    /// Shared engine state.
    #[must_use]
    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }
}

async fn run_rule(state: Arc<EngineState>, job: Arc<Job>, interval: Duration) {
    let cancel = job.cancel_token();
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let outcome = state.evaluate(&job).await;
        if outcome == TickOutcome::Skipped {
            break;
        }
    }
    debug!(rule_id = job.rule_id(), generation = job.generation(), "rule task exited");
}
