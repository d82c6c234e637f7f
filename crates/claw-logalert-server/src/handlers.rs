//! HTTP request handlers for the control surface.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use claw_logalert::EngineMetrics;
use serde::{Deserialize, Serialize};

use crate::error::ServerResult;
use crate::state::{AlertEvidence, ServerState};

/// Query parameters for the evidence endpoint.
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Evidence key from the alert's `generatorURL`.
    #[serde(default)]
    pub key: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Number of scheduled rules.
    pub rules: usize,
    /// Open alert records.
    pub alerts: usize,
}

/// Reload response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    /// Rules scheduled after the reload.
    pub rules: usize,
}

/// Handle GET /health - health check endpoint.
pub async fn health_check(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let scheduler = state.scheduler();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_secs(),
        rules: scheduler.job_count(),
        alerts: scheduler.lifecycle().len(),
    })
}

/// Handle GET /metrics - Prometheus text exposition.
pub async fn get_metrics(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, EngineMetrics::content_type())],
        state.scheduler().metrics().encode(),
    )
}

/// Handle POST /-/reload - re-read the rule source.
pub async fn reload_rules(
    State(state): State<Arc<ServerState>>,
) -> ServerResult<Json<ReloadResponse>> {
    let rules = state.reload().await?;
    Ok(Json(ReloadResponse { rules }))
}

/// Handle GET /alert/message?key=K - evidence behind an alert.
pub async fn alert_message(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MessageQuery>,
) -> ServerResult<Json<AlertEvidence>> {
    let evidence = state.alert_evidence(query.key.trim()).await?;
    Ok(Json(evidence))
}
