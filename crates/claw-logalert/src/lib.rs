//! Log-query alerting engine for Clawbernetes.
//!
//! `claw-logalert` runs user-defined rules against a search engine on a
//! schedule, clusters matching documents into incidents, tracks each
//! incident from detection to resolution and delivers it to an
//! Alertmanager-compatible webhook through a queue.
//!
//! # Components
//!
//! - **[`RuleRegistry`]**: live rule definitions keyed by id
//! - **[`WindowedQueryEvaluator`]**: count then paged, concurrent fetch of
//!   the documents in a tick's window
//! - **[`MatchEngine`]**: named grouping strategies (`frequency` built in)
//! - **[`AlertLifecycle`]**: one `Pending`/`Resolved` record per rule, with a
//!   30 second resolution hysteresis
//! - **[`SchedulerManager`]**: per-rule tasks plus the global dispatch and
//!   consumer loops
//! - **[`DeliveryPipeline`]**: queue push, bounded-retry webhook delivery
//! - **[`EngineMetrics`]**: Prometheus text exposition
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use claw_logalert::{
//!     AppConfig, Document, EngineBuilder, Rule, SchedulerManager, StaticQueryEngine,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let rule = Rule::from_yaml(r#"
//! unique_id: app-errors
//! es: { addresses: ["http://127.0.0.1:9200"] }
//! index: app-*
//! run_every: { minutes: 1 }
//! query:
//!   type: frequency
//!   config: { timeframe: { minutes: 5 }, num_events: 2 }
//!   query_string: 'level: error'
//!   labels: { alertname: AppErrors }
//! "#, "rules/app.rule.yaml").unwrap();
//!
//! let now = Utc::now();
//! let documents = (0..3)
//!     .map(|i| Document {
//!         id: format!("doc-{i}"),
//!         timestamp: now,
//!         source: serde_json::json!({}),
//!     })
//!     .collect();
//! let engine = StaticQueryEngine::new(documents);
//!
//! let scheduler = SchedulerManager::new(
//!     EngineBuilder::new(AppConfig::default(), Arc::new(engine)).build_state(),
//! );
//! scheduler.start(rule).await;
//! scheduler.evaluate_now("app-errors").await;
//!
//! let record = scheduler.lifecycle().get("app-errors").unwrap();
//! assert_eq!(record.current.count, 3);
//! scheduler.stop_all().await;
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod delivery;
pub mod duration;
pub mod engine;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod matcher;
pub mod metrics;
pub mod payload;
pub mod query;
pub mod queue;
pub mod registry;
pub mod rule;
pub mod scheduler;
pub mod source;
pub mod webhook;
pub mod window;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use config::{AlertmanagerConfig, AppConfig, ConfigHandle, LoaderConfig};
pub use delivery::{ConsumeOutcome, DeliveryPipeline, DispatchReport};
pub use duration::TimeLimit;
pub use engine::{EngineBuilder, EngineState, TickOutcome};
pub use error::{LogAlertError, Result};
pub use job::{Job, JobWindow};
pub use lifecycle::{AlertLifecycle, AlertRecord, AlertState, Transition};
pub use matcher::{FrequencyStrategy, MatchEngine, MatchGroup, MatchStrategy};
pub use metrics::EngineMetrics;
pub use payload::{AlertSample, QueueMessage};
pub use query::{Document, ElasticsearchClient, QueryEngine, SearchPage, StaticQueryEngine};
pub use queue::{InMemoryQueue, QueueBackend};
pub use registry::RuleRegistry;
pub use rule::Rule;
pub use scheduler::SchedulerManager;
pub use source::{ConfigMapSource, FileSource, RuleSource, RuleSet};
pub use webhook::{AlertmanagerWebhook, DeliveryReceipt, RecordingWebhook, WebhookTransport};
pub use window::{EvaluationWindow, WindowedQueryEvaluator};
