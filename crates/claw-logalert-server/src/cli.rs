//! Command-line interface and logging setup.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Log verbosity accepted by `--verbose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    /// Everything, including per-tick detail.
    Debug,
    /// Lifecycle events.
    #[default]
    Info,
    /// Problems that do not stop the engine.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Filter directive for this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Log-query alerting service.
#[derive(Debug, Parser)]
#[command(name = "claw-logalert")]
#[command(about = "Evaluates log-query rules and delivers alerts to Alertmanager")]
#[command(version)]
pub struct Cli {
    /// Path to the application config file
    #[arg(short, long, default_value = "config.yaml", env = "CLAW_LOGALERT_CONFIG")]
    pub config: PathBuf,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub verbose: LogLevel,

    /// Shorthand for --verbose debug
    #[arg(long)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Run exactly this rule file instead of the configured loader
    #[arg(long)]
    pub rule: Option<PathBuf>,
}

impl Cli {
    /// Effective log level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else {
            self.verbose
        }
    }

    /// Filter from `RUST_LOG`, falling back to the effective level.
    #[must_use]
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level().as_str()))
    }

    /// Installs the global subscriber.
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let builder = tracing_subscriber::fmt().with_env_filter(self.filter());
        let installed = match self.log_format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        installed.map_err(|e| anyhow::anyhow!("cannot install log subscriber: {e}"))
    }
}
