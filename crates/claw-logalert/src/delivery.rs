//! Dispatching alert records and delivering queued notifications.
//!
//! Delivery is split in two loops. The dispatch side walks the alert table on
//! its own timer, stores evidence and pushes one [`QueueMessage`] per record.
//! The consumer side pops messages, checks their freshness and posts them to
//! the webhook with a bounded number of attempts. The queue between the two
//! is the only hand-off.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConfigHandle};
use crate::duration::to_time_delta;
use crate::lifecycle::{AlertLifecycle, AlertRecord};
use crate::metrics::EngineMetrics;
use crate::payload::{AlertSample, QueueMessage, generator_url, render_payload};
use crate::queue::QueueBackend;
use crate::webhook::WebhookTransport;

/// Queue command names used in metrics.
pub mod cmd {
    /// Evidence write.
    pub const SET: &str = "set";
    /// Message push.
    pub const LPUSH: &str = "lpush";
    /// Message pop.
    pub const BRPOP: &str = "brpop";
}

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Records visited.
    pub records: usize,
    /// Messages pushed onto the queue.
    pub pushed: usize,
    /// Resolved records removed from the table.
    pub removed: usize,
}

/// What happened to one popped message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The pop timed out.
    Empty,
    /// The queue backend could not be reached.
    Disconnected,
    /// The message did not parse and was dropped.
    Malformed,
    /// The message was stamped in the future and was dropped.
    FromFuture,
    /// The message was older than the freshness window and was dropped.
    Stale,
    /// The webhook accepted the message.
    Delivered {
        /// Attempts used, starting at 1.
        attempts: u32,
    },
    /// Every attempt failed; the message was dropped.
    Failed {
        /// Attempts used.
        attempts: u32,
    },
}

/// Moves alert records to the queue and from the queue to the webhook.
#[derive(Debug, Clone)]
pub struct DeliveryPipeline {
    lifecycle: Arc<AlertLifecycle>,
    queue: Arc<dyn QueueBackend>,
    webhook: Option<Arc<dyn WebhookTransport>>,
    metrics: Arc<EngineMetrics>,
}

impl DeliveryPipeline {
    /// Creates a pipeline. Without a webhook the consumer side is inert.
    #[must_use]
    pub fn new(
        lifecycle: Arc<AlertLifecycle>,
        queue: Arc<dyn QueueBackend>,
        webhook: Option<Arc<dyn WebhookTransport>>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            lifecycle,
            queue,
            webhook,
            metrics,
        }
    }

    /// The queue backend.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Visits every alert record once.
    ///
    /// Resolved records are removed after their push was attempted, whether
    /// or not it succeeded.
    pub async fn dispatch_once(&self, config: &AppConfig) -> DispatchReport {
        let records = self.lifecycle.snapshot();
        let mut report = DispatchReport {
            records: records.len(),
            ..DispatchReport::default()
        };

        for record in records {
            let rule_id = record.rule.unique_id.clone();
            let sample = AlertSample::from_record(&record);
            let key = sample.key();

            if config.alert.alertmanager.enabled && self.push(config, &record, &sample, &key).await {
                report.pushed += 1;
            }
            self.metrics.set_alert_hits(&rule_id, &key, record.current.count);

            if record.is_resolved() && self.lifecycle.remove_if_resolved(&rule_id) {
                self.metrics.clear_alert_hits(&rule_id);
                debug!(rule_id = %rule_id, "resolved alert dispatched and removed");
                report.removed += 1;
            }
        }
        report
    }

    async fn push(
        &self,
        config: &AppConfig,
        record: &AlertRecord,
        sample: &AlertSample,
        key: &str,
    ) -> bool {
        let rule_id = record.rule.unique_id.as_str();

        match serde_json::to_string(sample) {
            Ok(text) => {
                let ttl = config.alert.generator.expire.as_duration();
                let stored = self.queue.set_with_expiry(key, text, ttl).await;
                self.observe_queue(rule_id, cmd::SET, key, stored.is_ok());
                if let Err(e) = stored {
                    error!(rule_id, key, error = %e, "cannot store alert sample");
                }
            }
            Err(e) => error!(rule_id, error = %e, "cannot encode alert sample"),
        }

        let url = generator_url(&config.alert.generator.base_url, key);
        let message = QueueMessage::new(record, render_payload(record, &url));
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(rule_id, error = %e, "cannot encode queue message, dropped");
                return false;
            }
        };

        let list = config.queue.list_key.as_str();
        let pushed = self.queue.list_push(list, text).await;
        self.observe_queue(rule_id, cmd::LPUSH, list, pushed.is_ok());
        match pushed {
            Ok(()) => {
                debug!(rule_id, state = %record.state, "alert queued");
                true
            }
            Err(e) => {
                error!(rule_id, error = %e, "cannot push alert onto queue");
                false
            }
        }
    }

    fn observe_queue(&self, rule_id: &str, cmd: &str, key: &str, ok: bool) {
        self.metrics.record_queue_op(rule_id, cmd, key, ok);
        self.metrics.set_queue_connected(ok);
    }

    /// Pops and handles at most one message.
    pub async fn consume_once(&self, config: &AppConfig) -> ConsumeOutcome {
        let list = config.queue.list_key.as_str();
        let popped = self
            .queue
            .list_blocking_pop(list, config.queue.pop_timeout.as_duration())
            .await;
        let text = match popped {
            Ok(Some(text)) => {
                self.metrics.set_queue_connected(true);
                text
            }
            Ok(None) => {
                self.metrics.set_queue_connected(true);
                return ConsumeOutcome::Empty;
            }
            Err(e) => {
                self.metrics.set_queue_connected(false);
                info!(list, error = %e, "queue pop failed");
                return ConsumeOutcome::Disconnected;
            }
        };

        let message: QueueMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_unattributed_queue_op(cmd::BRPOP, list, false);
                error!(list, error = %e, "malformed queue message dropped");
                return ConsumeOutcome::Malformed;
            }
        };
        self.metrics.record_queue_op(&message.id, cmd::BRPOP, list, true);

        let now = Utc::now();
        if message.starts_at > now {
            warn!(rule_id = %message.id, starts_at = %message.starts_at, "alert stamped in the future, not sent");
            return ConsumeOutcome::FromFuture;
        }
        let oldest = now - to_time_delta(config.alert_time_limit.as_duration());
        if message.starts_at < oldest {
            warn!(rule_id = %message.id, starts_at = %message.starts_at, %oldest, "alert too old, not sent");
            return ConsumeOutcome::Stale;
        }

        self.deliver(config, &message).await
    }

    async fn deliver(&self, config: &AppConfig, message: &QueueMessage) -> ConsumeOutcome {
        let Some(webhook) = &self.webhook else {
            warn!(rule_id = %message.id, "no webhook configured, alert dropped");
            return ConsumeOutcome::Failed { attempts: 0 };
        };
        let max_attempts = config.delivery.max_attempts;
        let pause = config.delivery.retry_pause.as_duration();

        for attempt in 1..=max_attempts {
            let receipt = webhook.post(&message.payload).await;
            self.metrics.record_webhook(&message.id, receipt.status);
            match receipt.into_result() {
                Ok(status) => {
                    info!(rule_id = %message.id, attempt, status, "alert delivered");
                    return ConsumeOutcome::Delivered { attempts: attempt };
                }
                Err(e) => error!(rule_id = %message.id, attempt, error = %e, "alert delivery failed"),
            }
            if attempt < max_attempts && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        ConsumeOutcome::Failed {
            attempts: max_attempts,
        }
    }

    /// Consumes until `cancel` fires, reading the live config each round.
    pub async fn run_consumer(&self, config: ConfigHandle, cancel: CancellationToken) {
        info!("alert consumer started");
        loop {
            let current = config.load();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                outcome = self.consume_once(&current) => outcome,
            };
            let pause = match outcome {
                ConsumeOutcome::Disconnected => current.queue.connectivity_pause.as_duration(),
                _ => current.delivery.poll_pause.as_duration(),
            };
            if pause_or_cancel(pause, &cancel).await {
                break;
            }
        }
        info!("alert consumer stopped");
    }
}

/// Sleeps for `pause`; returns true if cancelled first.
async fn pause_or_cancel(pause: Duration, cancel: &CancellationToken) -> bool {
    if pause.is_zero() {
        return cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(pause) => false,
    }
}
