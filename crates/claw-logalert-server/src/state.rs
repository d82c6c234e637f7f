//! Shared state for the control surface.

use std::sync::Arc;
use std::time::Instant;

use claw_logalert::payload::AlertSample;
use claw_logalert::{Document, RuleSource, SchedulerManager};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ServerError, ServerResult};

/// Evidence behind one delivered alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvidence {
    /// Stored sample.
    pub sample: AlertSample,
    /// Sampled documents as currently held by the store.
    pub documents: Vec<Document>,
}

/// Shared state for the HTTP handlers.
#[derive(Debug)]
pub struct ServerState {
    /// Scheduler running the rules.
    scheduler: Arc<SchedulerManager>,
    /// Source re-read by the reload endpoint.
    source: Arc<RuleSource>,
    /// Server start time.
    start_time: Instant,
}

impl ServerState {
    /// Create a new server state.
    pub fn new(scheduler: Arc<SchedulerManager>, source: Arc<RuleSource>) -> Self {
        Self {
            scheduler,
            source,
            start_time: Instant::now(),
        }
    }

    /// Get the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<SchedulerManager> {
        &self.scheduler
    }

    /// Get the uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Re-reads the rule source and reconciles the scheduler.
    pub async fn reload(&self) -> ServerResult<usize> {
        let count = self.source.reload(&self.scheduler).await?;
        info!(rules = count, "reload requested over http");
        Ok(count)
    }

    /// Looks up the sample stored under `key` and re-fetches its documents.
    pub async fn alert_evidence(&self, key: &str) -> ServerResult<AlertEvidence> {
        let not_found = || ServerError::NotFound("alert sample".to_string(), key.to_string());
        if key.is_empty() {
            return Err(not_found());
        }
        let raw = self
            .scheduler
            .pipeline()
            .queue()
            .get(key)
            .await?
            .ok_or_else(not_found)?;
        let sample: AlertSample = serde_json::from_str(&raw)
            .map_err(|e| ServerError::Internal(format!("stored sample is malformed: {e}")))?;

        let live = self.scheduler.registry().get(&sample.rule_id);
        let rule = sample.lookup_rule(live.as_deref());
        let page = self
            .scheduler
            .query_engine()
            .search(&rule, rule.ids_query(&sample.ids), &[])
            .await?;
        debug!(key, rule_id = %sample.rule_id, documents = page.documents.len(), "evidence fetched");

        Ok(AlertEvidence {
            sample,
            documents: page.documents,
        })
    }
}
