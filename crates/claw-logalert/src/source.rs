//! Rule sources: where rule definitions come from and how changes reach
//! the scheduler.
//!
//! A reload makes the scheduled set equal to what the source currently
//! holds: rules whose id already has a job are restarted, new ids are
//! started and ids that disappeared are stopped. A source that cannot be
//! read at all leaves the scheduled set untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigMapLoaderConfig, FileLoaderConfig, LoaderConfig};
use crate::error::{LogAlertError, Result};
use crate::rule::{RULE_FILE_SUFFIX, Rule};
use crate::scheduler::SchedulerManager;

/// Rules keyed by id.
pub type RuleSet = BTreeMap<String, Arc<Rule>>;

/// Quiet period after a file event before the reload runs.
const SETTLE: Duration = Duration::from_millis(200);

/// Returns true for file names ending in `.rule.yaml`.
#[must_use]
pub fn is_rule_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(RULE_FILE_SUFFIX))
}

/// Parses `(path, content)` pairs into a rule set.
///
/// Invalid rules are logged and skipped. When two sources define the same
/// id the later one wins.
pub fn parse_rules<I>(entries: I) -> RuleSet
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut rules = RuleSet::new();
    for (path, content) in entries {
        match Rule::from_yaml(&content, path.clone()) {
            Ok(rule) => {
                if let Some(previous) = rules.insert(rule.unique_id.clone(), Arc::new(rule)) {
                    warn!(rule_id = %previous.unique_id, previous = %previous.path, %path, "duplicate rule id, keeping the later one");
                }
            }
            Err(e) => error!(%path, error = %e, "rule skipped"),
        }
    }
    rules
}

/// Rules stored as files under a directory, or one rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    root: PathBuf,
    recursive: bool,
}

impl FileSource {
    /// Creates a source rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            root: root.into(),
            recursive,
        }
    }

    /// Root directory or file.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads every rule file.
    pub fn load_all(&self) -> Result<RuleSet> {
        let files = self.rule_files()?;
        let entries = files.into_iter().filter_map(|path| {
            let shown = path.display().to_string();
            match std::fs::read_to_string(&path) {
                Ok(content) => Some((shown, content)),
                Err(e) => {
                    error!(path = %shown, error = %e, "rule file unreadable");
                    None
                }
            }
        });
        Ok(parse_rules(entries))
    }

    fn rule_files(&self) -> Result<Vec<PathBuf>> {
        let meta = std::fs::metadata(&self.root).map_err(|e| {
            LogAlertError::Source(format!("{}: {e}", self.root.display()))
        })?;
        if meta.is_file() {
            return Ok(vec![self.root.clone()]);
        }
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| LogAlertError::Source(format!("{}: {e}", dir.display())))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if self.recursive {
                        pending.push(path);
                    }
                } else if is_rule_file(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn watch(
        &self,
        scheduler: Arc<SchedulerManager>,
        source: Arc<RuleSource>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(EventKind, PathBuf)>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                let Ok(event) = result else {
                    return;
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    if is_rule_file(&path) || matches!(event.kind, EventKind::Remove(_)) {
                        let _ = tx.send((event.kind, path));
                    }
                }
            })
            .map_err(|e| LogAlertError::Source(format!("cannot create watcher: {e}")))?;
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&self.root, mode)
            .map_err(|e| LogAlertError::Source(format!("{}: {e}", self.root.display())))?;
        info!(root = %self.root.display(), recursive = self.recursive, "watching rule files");

        Ok(tokio::spawn(async move {
            // Dropping the watcher ends the event stream.
            let _watcher = watcher;
            loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                let Some((kind, path)) = event else {
                    break;
                };
                debug!(?kind, path = %path.display(), "rule file event");
                tokio::time::sleep(SETTLE).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = source.reload(&scheduler).await {
                    error!(error = %e, "rule reload failed");
                }
            }
            debug!("rule file watch stopped");
        }))
    }
}

impl From<&FileLoaderConfig> for FileSource {
    fn from(config: &FileLoaderConfig) -> Self {
        Self::new(config.rules_folder.clone(), config.rules_folder_recursion)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigMapObject {
    #[serde(default)]
    metadata: ConfigMapMetadata,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigMapMetadata {
    #[serde(default, rename = "resourceVersion")]
    resource_version: Option<String>,
}

impl ConfigMapObject {
    /// The `resourceVersion`, or a digest of the data when the server sent
    /// none.
    fn revision(&self) -> String {
        if let Some(version) = &self.metadata.resource_version {
            return version.clone();
        }
        let mut hasher = Sha256::new();
        for (key, value) in &self.data {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

/// Rules stored as `*.rule.yaml` keys of a Kubernetes `ConfigMap`.
#[derive(Debug, Clone)]
pub struct ConfigMapSource {
    config: ConfigMapLoaderConfig,
    http: reqwest::Client,
    revision: Arc<Mutex<Option<String>>>,
}

impl ConfigMapSource {
    /// Builds a client trusting the configured cluster CA.
    pub fn new(config: ConfigMapLoaderConfig) -> Result<Self> {
        if config.configmap_name.is_empty() {
            return Err(LogAlertError::config("loader.configmap_name is empty"));
        }
        let mut builder = reqwest::Client::builder();
        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                LogAlertError::config(format!("{}: {e}", ca_path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| LogAlertError::config(format!("{}: {e}", ca_path.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| LogAlertError::config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            config,
            http,
            revision: Arc::new(Mutex::new(None)),
        })
    }

    /// REST URL of the `ConfigMap`.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/configmaps/{}",
            self.config.api_server.trim_end_matches('/'),
            self.config.namespace,
            self.config.configmap_name
        )
    }

    fn rule_path(&self, key: &str) -> String {
        format!(
            "configmap/{}/{}/{key}",
            self.config.namespace, self.config.configmap_name
        )
    }

    async fn fetch(&self) -> Result<ConfigMapObject> {
        let token = tokio::fs::read_to_string(&self.config.token_path)
            .await
            .map_err(|e| {
                LogAlertError::Source(format!("{}: {e}", self.config.token_path.display()))
            })?;
        let response = self
            .http
            .get(self.url())
            .bearer_auth(token.trim())
            .send()
            .await
            .map_err(|e| LogAlertError::Source(format!("{}: {e}", self.url())))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LogAlertError::Source(format!(
                "{} returned {}",
                self.url(),
                status.as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| LogAlertError::Source(format!("{}: {e}", self.url())))
    }

    fn rules_of(&self, object: ConfigMapObject) -> RuleSet {
        parse_rules(
            object
                .data
                .into_iter()
                .filter(|(key, _)| key.ends_with(RULE_FILE_SUFFIX))
                .map(|(key, content)| (self.rule_path(&key), content)),
        )
    }

    /// Reads every rule key and records the revision they came from.
    pub async fn load_all(&self) -> Result<RuleSet> {
        let object = self.fetch().await?;
        *self.revision.lock() = Some(object.revision());
        Ok(self.rules_of(object))
    }

    /// Rules of `object` if its revision differs from the last one loaded.
    fn rules_if_changed(&self, object: ConfigMapObject) -> Option<RuleSet> {
        let revision = object.revision();
        {
            let mut last = self.revision.lock();
            if last.as_deref() == Some(revision.as_str()) {
                return None;
            }
            *last = Some(revision);
        }
        Some(self.rules_of(object))
    }

    fn watch(
        &self,
        scheduler: Arc<SchedulerManager>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let period = self
            .config
            .poll_interval
            .as_duration()
            .max(Duration::from_secs(1));
        info!(url = %self.url(), ?period, "polling rule configmap");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let object = match this.fetch().await {
                    Ok(object) => object,
                    Err(e) => {
                        warn!(error = %e, "configmap poll failed");
                        continue;
                    }
                };
                let Some(rules) = this.rules_if_changed(object) else {
                    continue;
                };
                info!(rules = rules.len(), "configmap changed, reloading rules");
                scheduler.reconcile(rules).await;
            }
            debug!("configmap poll stopped");
        })
    }
}

/// The rule source selected by configuration.
#[derive(Debug, Clone)]
pub enum RuleSource {
    /// One-shot directory scan.
    File(FileSource),
    /// Directory scan that reloads on file changes.
    WatchedFile(FileSource),
    /// Polled Kubernetes `ConfigMap`.
    ConfigMap(ConfigMapSource),
}

impl RuleSource {
    /// Builds the source named by `config`.
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        Ok(match config {
            LoaderConfig::File(files) => Self::File(files.into()),
            LoaderConfig::WatchedFile(files) => Self::WatchedFile(files.into()),
            LoaderConfig::ConfigMap(map) => Self::ConfigMap(ConfigMapSource::new(map.clone())?),
        })
    }

    /// A source holding exactly one rule file.
    #[must_use]
    pub fn single_file(path: impl Into<PathBuf>) -> Self {
        Self::File(FileSource::new(path, false))
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::WatchedFile(_) => "watched_file",
            Self::ConfigMap(_) => "config_map",
        }
    }

    /// Reads every rule the source currently holds.
    pub async fn load_all(&self) -> Result<RuleSet> {
        match self {
            Self::File(files) | Self::WatchedFile(files) => {
                let files = files.clone();
                tokio::task::spawn_blocking(move || files.load_all())
                    .await
                    .map_err(|e| LogAlertError::Source(format!("rule scan aborted: {e}")))?
            }
            Self::ConfigMap(map) => map.load_all().await,
        }
    }

    /// Loads the rules and reconciles the scheduler with them. Returns the
    /// number of rules now scheduled.
    pub async fn reload(&self, scheduler: &SchedulerManager) -> Result<usize> {
        let rules = self.load_all().await?;
        let count = rules.len();
        scheduler.reconcile(rules).await;
        info!(source = self.kind(), rules = count, "rules reloaded");
        Ok(count)
    }

    /// Starts the change listener, if this source has one.
    pub fn watch(
        self: &Arc<Self>,
        scheduler: Arc<SchedulerManager>,
        cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>> {
        match self.as_ref() {
            Self::File(_) => Ok(None),
            Self::WatchedFile(files) => files
                .watch(scheduler, Arc::clone(self), cancel)
                .map(Some),
            Self::ConfigMap(map) => Ok(Some(map.watch(scheduler, cancel))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::EngineBuilder;
    use crate::query::StaticQueryEngine;
    use crate::testing::RULE_YAML;
    use tempfile::TempDir;

    fn write_rule(dir: &Path, name: &str, id: &str) -> PathBuf {
        let path = dir.join(name);
        let content = RULE_YAML.replace("unique_id: app-errors", &format!("unique_id: {id}"));
        std::fs::write(&path, content).expect("write rule");
        path
    }

    fn scheduler() -> SchedulerManager {
        SchedulerManager::new(
            EngineBuilder::new(AppConfig::default(), Arc::new(StaticQueryEngine::default()))
                .build_state(),
        )
    }

    #[test]
    fn recognizes_rule_files() {
        assert!(is_rule_file(Path::new("/a/b/x.rule.yaml")));
        assert!(!is_rule_file(Path::new("/a/b/x.yaml")));
        assert!(!is_rule_file(Path::new("/a/b/")));
    }

    #[test]
    fn scans_directory_with_recursion() {
        let dir = TempDir::new().expect("tempdir");
        write_rule(dir.path(), "a.rule.yaml", "a");
        std::fs::write(dir.path().join("notes.yaml"), "ignored: true").expect("write");
        let nested = dir.path().join("team");
        std::fs::create_dir(&nested).expect("mkdir");
        write_rule(&nested, "b.rule.yaml", "b");

        let all = FileSource::new(dir.path(), true).load_all().expect("load");
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);

        let flat = FileSource::new(dir.path(), false).load_all().expect("load");
        assert_eq!(flat.keys().cloned().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        write_rule(dir.path(), "good.rule.yaml", "good");
        std::fs::write(dir.path().join("bad.rule.yaml"), "unique_id: bad\n").expect("write");

        let rules = FileSource::new(dir.path(), true).load_all().expect("load");
        assert_eq!(rules.len(), 1);
        assert!(rules.contains_key("good"));
    }

    #[test]
    fn unreadable_rule_file_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        write_rule(dir.path(), "good.rule.yaml", "good");
        std::fs::write(dir.path().join("binary.rule.yaml"), [0xff, 0xfe, 0x00]).expect("write");

        let rules = FileSource::new(dir.path(), false).load_all().expect("load");
        assert_eq!(rules.keys().cloned().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    fn single_file_root() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_rule(dir.path(), "only.rule.yaml", "only");
        let rules = FileSource::new(&path, true).load_all().expect("load");
        assert_eq!(rules["only"].path, path.display().to_string());
    }

    #[test]
    fn missing_root_is_a_source_error() {
        let err = FileSource::new("/definitely/not/here", true)
            .load_all()
            .expect_err("missing");
        assert!(matches!(err, LogAlertError::Source(_)));
    }

    #[test]
    fn configmap_requires_name() {
        let err = ConfigMapSource::new(ConfigMapLoaderConfig::default()).expect_err("no name");
        assert!(err.is_configuration());
    }

    #[test]
    fn configmap_keys_become_rules() {
        let source = ConfigMapSource::new(ConfigMapLoaderConfig {
            configmap_name: "rules".to_string(),
            ca_path: None,
            ..ConfigMapLoaderConfig::default()
        })
        .expect("source");
        assert_eq!(
            source.url(),
            "https://kubernetes.default.svc/api/v1/namespaces/default/configmaps/rules"
        );
        let object = ConfigMapObject {
            metadata: ConfigMapMetadata::default(),
            data: BTreeMap::from([
                ("errors.rule.yaml".to_string(), RULE_YAML.to_string()),
                ("README".to_string(), "not a rule".to_string()),
            ]),
        };
        let rules = source.rules_of(object);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules["app-errors"].path,
            "configmap/default/rules/errors.rule.yaml"
        );
    }

    fn configmap_object(version: Option<&str>, content: &str) -> ConfigMapObject {
        ConfigMapObject {
            metadata: ConfigMapMetadata {
                resource_version: version.map(str::to_string),
            },
            data: BTreeMap::from([("errors.rule.yaml".to_string(), content.to_string())]),
        }
    }

    fn configmap_source() -> ConfigMapSource {
        ConfigMapSource::new(ConfigMapLoaderConfig {
            configmap_name: "rules".to_string(),
            ca_path: None,
            ..ConfigMapLoaderConfig::default()
        })
        .expect("source")
    }

    #[test]
    fn configmap_poll_compares_against_loaded_revision() {
        let source = configmap_source();
        // What the initial load saw.
        *source.revision.lock() = Some("41".to_string());

        assert!(source.rules_if_changed(configmap_object(Some("41"), RULE_YAML)).is_none());
        let changed = source
            .rules_if_changed(configmap_object(Some("42"), RULE_YAML))
            .expect("changed");
        assert!(changed.contains_key("app-errors"));
        assert!(source.rules_if_changed(configmap_object(Some("42"), RULE_YAML)).is_none());
    }

    #[test]
    fn configmap_change_before_first_poll_is_picked_up() {
        let source = configmap_source();
        *source.revision.lock() = Some("41".to_string());
        let watcher_view = source.clone();
        let edited = RULE_YAML.replace("app-errors", "app-errors-v2");
        let rules = watcher_view
            .rules_if_changed(configmap_object(Some("43"), &edited))
            .expect("changed");
        assert!(rules.contains_key("app-errors-v2"));
    }

    #[test]
    fn configmap_without_version_uses_content_digest() {
        let source = configmap_source();
        assert!(source.rules_if_changed(configmap_object(None, RULE_YAML)).is_some());
        assert!(source.rules_if_changed(configmap_object(None, RULE_YAML)).is_none());
        let edited = RULE_YAML.replace("num_events: 3", "num_events: 4");
        assert!(source.rules_if_changed(configmap_object(None, &edited)).is_some());
    }

    #[tokio::test]
    async fn reload_reconciles_scheduler() {
        let dir = TempDir::new().expect("tempdir");
        write_rule(dir.path(), "a.rule.yaml", "a");
        let b = write_rule(dir.path(), "b.rule.yaml", "b");
        let source = RuleSource::File(FileSource::new(dir.path(), true));
        let scheduler = scheduler();

        assert_eq!(source.reload(&scheduler).await.expect("reload"), 2);
        assert_eq!(scheduler.rule_ids(), vec!["a", "b"]);

        std::fs::remove_file(b).expect("remove");
        write_rule(dir.path(), "c.rule.yaml", "c");
        source.reload(&scheduler).await.expect("reload");
        assert_eq!(scheduler.rule_ids(), vec!["a", "c"]);
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn failed_reload_keeps_rules() {
        let dir = TempDir::new().expect("tempdir");
        write_rule(dir.path(), "a.rule.yaml", "a");
        let scheduler = scheduler();
        RuleSource::File(FileSource::new(dir.path(), true))
            .reload(&scheduler)
            .await
            .expect("reload");

        let missing = RuleSource::File(FileSource::new(dir.path().join("gone"), true));
        assert!(missing.reload(&scheduler).await.is_err());
        assert_eq!(scheduler.job_count(), 1);
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn file_source_has_no_watcher() {
        let source = Arc::new(RuleSource::single_file("x.rule.yaml"));
        let handle = source
            .watch(Arc::new(scheduler()), CancellationToken::new())
            .expect("watch");
        assert!(handle.is_none());
    }
}
