//! Webhook transport seam and the Alertmanager adapter.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::config::AlertmanagerConfig;
use crate::error::{LogAlertError, Result, TRANSPORT_ERROR_STATUS};

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Whether the receiver accepted the payload.
    pub delivered: bool,
    /// Response status, or 499 if the receiver was unreachable.
    pub status: u16,
}

impl DeliveryReceipt {
    /// Receipt for a response with `status`.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        Self {
            delivered: (200..300).contains(&status),
            status,
        }
    }

    /// Receipt for an unreachable receiver.
    #[must_use]
    pub const fn unreachable() -> Self {
        Self {
            delivered: false,
            status: TRANSPORT_ERROR_STATUS,
        }
    }

    /// The accepted status, or the delivery error this receipt reports.
    pub fn into_result(self) -> Result<u16> {
        if self.delivered {
            return Ok(self.status);
        }
        let reason = if self.status == TRANSPORT_ERROR_STATUS {
            "receiver unreachable"
        } else {
            "receiver rejected the payload"
        };
        Err(LogAlertError::Delivery {
            status: self.status,
            reason: reason.to_string(),
        })
    }
}

/// Boxed future returned by [`WebhookTransport::post`].
pub type WebhookFuture<'a> = Pin<Box<dyn Future<Output = DeliveryReceipt> + Send + 'a>>;

/// Posts rendered alert payloads.
pub trait WebhookTransport: Send + Sync + fmt::Debug {
    /// Sends `payload`. Never fails; the receipt carries the outcome.
    fn post<'a>(&'a self, payload: &'a Value) -> WebhookFuture<'a>;
}

/// [`WebhookTransport`] posting to an Alertmanager `alerts` endpoint.
#[derive(Debug, Clone)]
pub struct AlertmanagerWebhook {
    http: reqwest::Client,
    url: String,
    credentials: Option<(String, String)>,
    timeout: Duration,
}

impl AlertmanagerWebhook {
    /// Builds a transport from config.
    pub fn new(config: &AlertmanagerConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(LogAlertError::config("alertmanager url is empty"));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LogAlertError::config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            url: config.url.clone(),
            credentials: config
                .basic_auth
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
            timeout: config.timeout.as_duration(),
        })
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl WebhookTransport for AlertmanagerWebhook {
    fn post<'a>(&'a self, payload: &'a Value) -> WebhookFuture<'a> {
        Box::pin(async move {
            let mut request = self.http.post(&self.url).timeout(self.timeout).json(payload);
            if let Some((user, password)) = &self.credentials {
                request = request.basic_auth(user, Some(password));
            }
            match request.send().await {
                Ok(response) => DeliveryReceipt::from_status(response.status().as_u16()),
                Err(e) => {
                    debug!(url = %self.url, error = %e, "webhook unreachable");
                    DeliveryReceipt::unreachable()
                }
            }
        })
    }
}

/// In-memory [`WebhookTransport`] that records payloads and answers with a
/// scripted sequence of statuses (the last one repeats).
#[derive(Debug, Clone)]
pub struct RecordingWebhook {
    inner: Arc<Mutex<RecordingState>>,
}

#[derive(Debug)]
struct RecordingState {
    statuses: Vec<u16>,
    received: Vec<Value>,
}

impl Default for RecordingWebhook {
    fn default() -> Self {
        Self::with_statuses(vec![200])
    }
}

impl RecordingWebhook {
    /// A receiver that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A receiver answering with `statuses` in order.
    #[must_use]
    pub fn with_statuses(statuses: Vec<u16>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RecordingState {
                statuses,
                received: Vec::new(),
            })),
        }
    }

    /// Payloads received so far.
    #[must_use]
    pub fn received(&self) -> Vec<Value> {
        self.inner.lock().received.clone()
    }

    /// Number of attempts so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.inner.lock().received.len()
    }
}

impl WebhookTransport for RecordingWebhook {
    fn post<'a>(&'a self, payload: &'a Value) -> WebhookFuture<'a> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            let attempt = state.received.len();
            state.received.push(payload.clone());
            let status = state
                .statuses
                .get(attempt)
                .or_else(|| state.statuses.last())
                .copied()
                .unwrap_or(200);
            if status == TRANSPORT_ERROR_STATUS {
                return DeliveryReceipt::unreachable();
            }
            DeliveryReceipt::from_status(status)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::TimeLimit;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(200, true ; "ok")]
    #[test_case(202, true ; "accepted")]
    #[test_case(400, false ; "bad request")]
    #[test_case(503, false ; "unavailable")]
    fn receipt_from_status(status: u16, delivered: bool) {
        assert_eq!(DeliveryReceipt::from_status(status).delivered, delivered);
    }

    #[test]
    fn failed_receipts_become_delivery_errors() {
        assert_eq!(DeliveryReceipt::from_status(202).into_result().ok(), Some(202));

        let rejected = DeliveryReceipt::from_status(503).into_result().expect_err("rejected");
        assert!(matches!(rejected, LogAlertError::Delivery { status: 503, .. }));
        assert_eq!(
            rejected.to_string(),
            "delivery failed with status 503: receiver rejected the payload"
        );

        let unreachable = DeliveryReceipt::unreachable().into_result().expect_err("unreachable");
        assert_eq!(unreachable.status(), Some(TRANSPORT_ERROR_STATUS));
        assert!(unreachable.to_string().contains("receiver unreachable"));
    }

    #[test]
    fn requires_url() {
        assert!(AlertmanagerWebhook::new(&AlertmanagerConfig::default()).is_err());
    }

    #[tokio::test]
    async fn unreachable_receiver_reports_499() {
        let config = AlertmanagerConfig {
            enabled: true,
            url: "http://127.0.0.1:1/api/v2/alerts".to_string(),
            timeout: TimeLimit::seconds(1),
            ..AlertmanagerConfig::default()
        };
        let webhook = AlertmanagerWebhook::new(&config).expect("webhook");
        let receipt = webhook.post(&json!([])).await;
        assert_eq!(receipt, DeliveryReceipt::unreachable());
    }

    #[tokio::test]
    async fn recording_webhook_follows_script() {
        let webhook = RecordingWebhook::with_statuses(vec![500, 200]);
        assert!(!webhook.post(&json!([1])).await.delivered);
        assert!(webhook.post(&json!([2])).await.delivered);
        assert!(webhook.post(&json!([3])).await.delivered);
        assert_eq!(webhook.attempts(), 3);
        assert_eq!(webhook.received()[0], json!([1]));
    }
}
