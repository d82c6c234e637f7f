//! claw-logalert - log-query alerting service.
//!
//! Loads rules, evaluates them on their intervals and delivers incidents to
//! Alertmanager. Exits 0 on SIGINT/SIGTERM, 2 on configuration errors and 1
//! on any other startup failure.

use std::process::ExitCode;

use clap::Parser;
use claw_logalert_server::app::{self, EXIT_CONFIG};
use claw_logalert_server::cli::Cli;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = cli.init_logging() {
        eprintln!("{e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "claw-logalert failed");
            ExitCode::from(app::exit_status(&e))
        }
    }
}
