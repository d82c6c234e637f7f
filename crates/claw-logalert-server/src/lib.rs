//! # claw-logalert-server
//!
//! Process entry point for the log-query alerting engine: command-line
//! parsing, logging setup, signal handling and a small HTTP control surface
//! built on axum.
//!
//! ## Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness plus rule and alert counts |
//! | `/metrics` | GET | Prometheus text exposition |
//! | `/-/reload` | POST | Re-read the rule source |
//! | `/alert/message?key=K` | GET | Evidence behind an alert's `generatorURL` |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod cli;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

// Re-export main types
pub use cli::{Cli, LogFormat, LogLevel};
pub use error::{ServerError, ServerResult};
pub use server::LogAlertServer;
pub use state::{AlertEvidence, ServerState};
