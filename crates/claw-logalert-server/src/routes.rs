//! Route configuration for the control surface.

use std::sync::Arc;

use axum::routing::{Router, get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::{alert_message, get_metrics, health_check, reload_rules};
use crate::state::ServerState;

/// Create the control-surface router.
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/-/reload", post(reload_rules))
        .route("/alert/message", get(alert_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use claw_logalert::payload::AlertSample;
    use claw_logalert::{
        AppConfig, Document, EngineBuilder, FileSource, Rule, RuleSource, SchedulerManager,
        StaticQueryEngine,
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const RULE: &str = r#"
unique_id: checkout-errors
es:
  addresses: ["http://127.0.0.1:9200"]
index: checkout-*
run_every:
  minutes: 1
query:
  type: frequency
  config:
    timeframe:
      minutes: 5
    num_events: 2
  query_string: 'status: 500'
  labels:
    alertname: CheckoutErrors
"#;

    struct Fixture {
        dir: TempDir,
        scheduler: Arc<SchedulerManager>,
        app: Router,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let at = Utc
            .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .single()
            .expect("time");
        let documents = ["a", "b", "c"]
            .iter()
            .map(|id| Document {
                id: (*id).to_string(),
                timestamp: at,
                source: serde_json::json!({ "status": 500 }),
            })
            .collect();
        let engine = StaticQueryEngine::new(documents);
        let scheduler = Arc::new(SchedulerManager::new(
            EngineBuilder::new(AppConfig::default(), Arc::new(engine)).build_state(),
        ));
        let source = Arc::new(RuleSource::File(FileSource::new(dir.path(), true)));
        let app = create_router(Arc::new(ServerState::new(Arc::clone(&scheduler), source)));
        Fixture {
            dir,
            scheduler,
            app,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, bytes.to_vec())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let f = fixture();
        let (status, body) = send(f.app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["rules"], 0);
    }

    #[tokio::test]
    async fn metrics_are_text_exposition() {
        let f = fixture();
        let response = f
            .app
            .oneshot(get_request("/metrics"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"));
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("claw_logalert_info"));
    }

    #[tokio::test]
    async fn reload_schedules_rules_from_source() {
        let f = fixture();
        std::fs::write(f.dir.path().join("checkout.rule.yaml"), RULE).expect("write");
        let request = Request::builder()
            .method("POST")
            .uri("/-/reload")
            .body(Body::empty())
            .expect("request");

        let (status, body) = send(f.app, request).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["rules"], 1);
        assert_eq!(f.scheduler.rule_ids(), vec!["checkout-errors".to_string()]);
        f.scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn reload_failure_is_upstream_error() {
        let f = fixture();
        let missing = f.dir.path().join("missing");
        let state = ServerState::new(
            Arc::clone(&f.scheduler),
            Arc::new(RuleSource::File(FileSource::new(missing, true))),
        );
        let app = create_router(Arc::new(state));
        let request = Request::builder()
            .method("POST")
            .uri("/-/reload")
            .body(Body::empty())
            .expect("request");

        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn alert_message_returns_sample_and_documents() {
        let f = fixture();
        let rule = Rule::from_yaml(RULE, "rules/checkout.rule.yaml").expect("rule");
        let sample = AlertSample {
            rule_id: rule.unique_id.clone(),
            addresses: rule.es.addresses.clone(),
            index: rule.index.clone(),
            timestamp_field: rule.timestamp_field.clone(),
            ids: vec!["a".to_string(), "c".to_string()],
            labels: Default::default(),
            query_string: rule.query.query_string.clone(),
            boolean_query: None,
        };
        let key = sample.key();
        f.scheduler
            .pipeline()
            .queue()
            .set_with_expiry(
                &key,
                serde_json::to_string(&sample).expect("encode"),
                Duration::from_secs(60),
            )
            .await
            .expect("store");

        let (status, body) = send(f.app, get_request(&format!("/alert/message?key={key}"))).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["sample"]["rule_id"], "checkout-errors");
        let ids: Vec<&str> = json["documents"]
            .as_array()
            .expect("documents")
            .iter()
            .filter_map(|d| d["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn alert_message_unknown_or_empty_key_is_404() {
        let f = fixture();
        let (status, _) = send(f.app.clone(), get_request("/alert/message?key=nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(f.app, get_request("/alert/message")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["error"], "not_found");
    }
}
