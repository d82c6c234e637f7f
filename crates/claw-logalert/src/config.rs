//! Application configuration.
//!
//! Loaded once from YAML at startup and swapped wholesale on SIGHUP. Every
//! field has a default so a minimal file (or an empty one) is valid.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::duration::TimeLimit;
use crate::error::{LogAlertError, Result};

/// Default lookback when neither the rule nor the process configures one.
pub const DEFAULT_BUFFER: Duration = Duration::from_secs(60);

/// Metrics exporter and control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Serve the HTTP surface.
    pub enabled: bool,
    /// Socket address to bind.
    pub listen_addr: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9003".to_string(),
        }
    }
}

/// Settings shared by the directory-based rule sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoaderConfig {
    /// Rule directory, or a single rule file.
    pub rules_folder: PathBuf,
    /// Descend into subdirectories.
    pub rules_folder_recursion: bool,
}

impl Default for FileLoaderConfig {
    fn default() -> Self {
        Self {
            rules_folder: PathBuf::from("rules"),
            rules_folder_recursion: true,
        }
    }
}

/// Settings for reading rules out of a Kubernetes `ConfigMap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigMapLoaderConfig {
    /// API server base URL.
    pub api_server: String,
    /// Namespace holding the `ConfigMap`.
    pub namespace: String,
    /// `ConfigMap` name.
    pub configmap_name: String,
    /// Service-account token file.
    pub token_path: PathBuf,
    /// Cluster CA bundle; empty uses the system roots.
    pub ca_path: Option<PathBuf>,
    /// How often the `ConfigMap` is re-read.
    pub poll_interval: TimeLimit,
}

impl Default for ConfigMapLoaderConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            configmap_name: String::new(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            poll_interval: TimeLimit::seconds(30),
        }
    }
}

/// Which rule source feeds the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoaderConfig {
    /// One-shot directory scan.
    File(FileLoaderConfig),
    /// Directory scan plus change notifications.
    WatchedFile(FileLoaderConfig),
    /// Polled Kubernetes `ConfigMap`.
    ConfigMap(ConfigMapLoaderConfig),
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::File(FileLoaderConfig::default())
    }
}

/// Basic-auth credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAuth {
    /// User name; empty disables auth.
    pub username: String,
    /// Password.
    pub password: String,
}

impl BasicAuth {
    /// Returns the credentials if a user name is set.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        (!self.username.is_empty()).then_some((self.username.as_str(), self.password.as_str()))
    }
}

/// Alertmanager webhook target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertmanagerConfig {
    /// Push alerts and run the consumer.
    pub enabled: bool,
    /// Full URL of the alerts endpoint.
    pub url: String,
    /// Optional credentials.
    pub basic_auth: BasicAuth,
    /// Per-request timeout.
    pub timeout: TimeLimit,
}

impl Default for AlertmanagerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            basic_auth: BasicAuth::default(),
            timeout: TimeLimit::seconds(10),
        }
    }
}

/// Evidence deep-link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Base of the `generatorURL`; `?key=<fingerprint>` is appended.
    pub base_url: String,
    /// Lifetime of stored evidence samples.
    pub expire: TimeLimit,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9003/alert/message".to_string(),
            expire: TimeLimit::days(1),
        }
    }
}

/// Alert output settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Webhook target.
    pub alertmanager: AlertmanagerConfig,
    /// Evidence links.
    pub generator: GeneratorConfig,
}

/// Durable queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// List that carries queue messages.
    pub list_key: String,
    /// Blocking-pop timeout.
    pub pop_timeout: TimeLimit,
    /// Pause after a connectivity failure.
    pub connectivity_pause: TimeLimit,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            list_key: "claw_logalert:alerts:list".to_string(),
            pop_timeout: TimeLimit::seconds(5),
            connectivity_pause: TimeLimit::seconds(1),
        }
    }
}

/// Consumer retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per message before it is dropped.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_pause: TimeLimit,
    /// Pause after each consumed message.
    pub poll_pause: TimeLimit,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_pause: TimeLimit::seconds(1),
            poll_pause: TimeLimit::seconds(1),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP surface.
    pub exporter: ExporterConfig,
    /// Rule source.
    pub loader: LoaderConfig,
    /// Alert output.
    pub alert: AlertConfig,
    /// Durable queue.
    pub queue: QueueConfig,
    /// Consumer retries.
    pub delivery: DeliveryConfig,
    /// Global dispatch interval.
    pub run_every: TimeLimit,
    /// Default lookback for rules without a timeframe.
    pub buffer_time: TimeLimit,
    /// Messages older than this are not delivered.
    pub alert_time_limit: TimeLimit,
    /// Page cap per evaluation; 0 means unlimited.
    pub max_scrolling_count: u64,
    /// Documents per page.
    pub page_size: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            exporter: ExporterConfig::default(),
            loader: LoaderConfig::default(),
            alert: AlertConfig::default(),
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            run_every: TimeLimit::seconds(30),
            buffer_time: TimeLimit::default(),
            alert_time_limit: TimeLimit::minutes(60),
            max_scrolling_count: 5,
            page_size: 10_000,
        }
    }
}

impl AppConfig {
    /// Parses and validates YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LogAlertError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.run_every.is_zero() {
            return Err(LogAlertError::config("run_every must be non-zero"));
        }
        if self.page_size == 0 {
            return Err(LogAlertError::config("page_size must be non-zero"));
        }
        if self.delivery.max_attempts == 0 {
            return Err(LogAlertError::config("delivery.max_attempts must be non-zero"));
        }
        if self.queue.list_key.is_empty() {
            return Err(LogAlertError::config("queue.list_key is empty"));
        }
        if self.alert.alertmanager.enabled && self.alert.alertmanager.url.is_empty() {
            return Err(LogAlertError::config(
                "alert.alertmanager.url is required when alertmanager is enabled",
            ));
        }
        if self.exporter.enabled && self.exporter.listen_addr.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(LogAlertError::config(format!(
                "exporter.listen_addr {:?} is not a socket address",
                self.exporter.listen_addr
            )));
        }
        if let LoaderConfig::ConfigMap(cm) = &self.loader {
            if cm.configmap_name.is_empty() {
                return Err(LogAlertError::config("loader.configmap_name is empty"));
            }
            if cm.poll_interval.is_zero() {
                return Err(LogAlertError::config("loader.poll_interval must be non-zero"));
            }
        }
        Ok(())
    }

    /// Process-wide default lookback, if configured.
    #[must_use]
    pub const fn buffer_time(&self) -> Option<Duration> {
        if self.buffer_time.is_zero() {
            None
        } else {
            Some(self.buffer_time.as_duration())
        }
    }

    /// Page cap; `None` when unlimited.
    #[must_use]
    pub const fn page_limit(&self) -> Option<u64> {
        if self.max_scrolling_count == 0 {
            None
        } else {
            Some(self.max_scrolling_count)
        }
    }
}

/// Live configuration shared by every task.
///
/// Readers take a cheap snapshot per tick; [`ConfigHandle::store`] swaps the
/// whole value at once.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigHandle {
    /// Wraps an initial configuration.
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn load(&self) -> Arc<AppConfig> {
        Arc::clone(&self.inner.read())
    }

    /// Replaces the configuration.
    pub fn store(&self, config: AppConfig) {
        *self.inner.write() = Arc::new(config);
    }
}
