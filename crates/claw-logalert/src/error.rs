//! Error types for the claw-logalert crate.

use thiserror::Error;

/// Status code reported when a collaborator could not be reached at all.
pub const TRANSPORT_ERROR_STATUS: u16 = 499;

/// Errors that can occur in the alerting engine.
#[derive(Debug, Error)]
pub enum LogAlertError {
    /// Malformed application configuration.
    #[error("configuration error: {reason}")]
    Configuration {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A rule definition failed validation.
    #[error("invalid rule {path}: {reason}")]
    InvalidRule {
        /// Where the rule came from.
        path: String,
        /// The reason the rule is invalid.
        reason: String,
    },

    /// A query-engine call failed or returned a malformed body.
    #[error("query failed with status {status}: {reason}")]
    Query {
        /// Status code reported by the engine (499 when unreachable).
        status: u16,
        /// The reason the query failed.
        reason: String,
    },

    /// The rule names a grouping strategy nobody registered.
    #[error("unknown match strategy: {name}")]
    UnknownStrategy {
        /// The strategy name from the rule.
        name: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The webhook receiver was unreachable or rejected a payload.
    #[error("delivery failed with status {status}: {reason}")]
    Delivery {
        /// Status code returned by the receiver (499 when unreachable).
        status: u16,
        /// The reason the delivery failed.
        reason: String,
    },

    /// The queue backend is unreachable or rejected the operation.
    #[error("queue error: {0}")]
    Queue(String),

    /// A rule source could not be read.
    #[error("rule source error: {0}")]
    Source(String),
}

impl LogAlertError {
    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-rule error.
    pub fn invalid_rule(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns the status code carried by query and delivery errors.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Query { status, .. } | Self::Delivery { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for errors that must stop the process at startup.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<serde_json::Error> for LogAlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for LogAlertError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            reason: err.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, LogAlertError>;
