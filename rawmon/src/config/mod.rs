//! Monitor configuration.
//!
//! Loaded from a TOML file. Every section and field has a default, so a minimal file
//! only names the watched paths and the service URLs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "rawmon.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Queue environment suffix (`prod`, `test`, ...).
    pub environment: String,
    /// Test mode: short stability interval and the `test` queue environment.
    pub test: bool,
    pub monitor: MonitorConfig,
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub stability: StabilityConfig,
    pub tracker: ServiceConfig,
    pub metadata: ServiceConfig,
    pub storage: StorageConfig,
    pub logging: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            test: false,
            monitor: MonitorConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            stability: StabilityConfig::default(),
            tracker: ServiceConfig::default(),
            metadata: ServiceConfig::default(),
            storage: StorageConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

fn default_environment() -> String {
    "prod".to_string()
}

/// How the watcher learns about new files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native filesystem notifications.
    #[default]
    Local,
    /// Periodic directory scans, for network shares that do not deliver notifications.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub paths: Vec<PathBuf>,
    /// Recognized raw extensions, including the leading dot.
    pub extensions: Vec<String>,
    /// Regexes for bundle companions that must never be queued.
    pub sidecar_patterns: Vec<String>,
    /// Regexes for paths the conversion stage acknowledges without touching.
    pub skip: Vec<String>,
    /// Root folder for converted output.
    pub storage: PathBuf,
    /// Path to the msconvert executable.
    pub msconvert: PathBuf,
    /// Skip samples the tracker does not know.
    pub exists: bool,
    /// Feed uploaded samples to the scheduler.
    pub schedule: bool,
    pub watch_mode: WatchMode,
    pub watch_poll_secs: u64,
    pub dedupe_window_secs: u64,
    /// Skip reconversion when storage already holds a copy younger than this.
    pub freshness_window_hours: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            extensions: default_extensions(),
            sidecar_patterns: crate::watch::DEFAULT_SIDECAR_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip: vec![r"[\\/]DNU[\\/]".to_string()],
            storage: PathBuf::from("converted"),
            msconvert: PathBuf::from("msconvert"),
            exists: false,
            schedule: false,
            watch_mode: WatchMode::Local,
            watch_poll_secs: 10,
            dedupe_window_secs: 5,
            freshness_window_hours: None,
        }
    }
}

fn default_extensions() -> Vec<String> {
    [".d", ".raw", ".wiff"].iter().map(|s| s.to_string()).collect()
}

/// Queue backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub base_name: String,
    pub database_url: String,
    pub lease_timeout_secs: u64,
    pub poll_wait_ms: u64,
    pub idle_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            base_name: "datamonitor".to_string(),
            database_url: "sqlite:rawmon-queue.db?mode=rwc".to_string(),
            lease_timeout_secs: 4 * 60 * 60,
            poll_wait_ms: 500,
            idle_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub conversion: usize,
    pub upload: usize,
    pub schedule: usize,
    pub join_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            conversion: 1,
            upload: 1,
            schedule: 1,
            join_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub interval_secs: u64,
    pub test_interval_secs: u64,
    pub confirmations: u32,
    /// Give up on a path that is still growing after this long. Unset waits forever.
    pub max_wait_secs: Option<u64>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            test_interval_secs: 3,
            confirmations: 1,
            max_wait_secs: None,
        }
    }
}

/// Connection settings for an HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key_env: None,
            timeout_secs: 30,
            retries: 3,
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key read from the configured environment variable, if any.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Rclone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Archive directory for the local backend.
    pub root: PathBuf,
    /// rclone target such as `s3:bucket/raw`.
    pub remote: String,
    pub rclone_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("archive"),
            remote: String::new(),
            rclone_path: PathBuf::from("rclone"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            filter: None,
        }
    }
}

impl AppConfig {
    /// Parse configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid configuration: {e}")))
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::utils::fs::io_error("reading config", path, e))?;
        Self::from_toml_str(&text)
    }

    /// Switch to test mode.
    pub fn enable_test_mode(&mut self) {
        self.test = true;
        self.environment = "test".to_string();
    }

    /// Poll interval of the stability probe for the current mode.
    pub fn stability_interval(&self) -> Duration {
        if self.test {
            Duration::from_secs(self.stability.test_interval_secs)
        } else {
            Duration::from_secs(self.stability.interval_secs)
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.paths.is_empty() {
            return Err(Error::config("monitor.paths must name at least one directory"));
        }
        if self.environment.trim().is_empty() {
            return Err(Error::config("environment must not be empty"));
        }
        if self.queue.base_name.trim().is_empty() {
            return Err(Error::config("queue.base_name must not be empty"));
        }
        if self.queue.lease_timeout_secs == 0 {
            return Err(Error::config("queue.lease_timeout_secs must be positive"));
        }
        for (stage, size) in [
            ("conversion", self.workers.conversion),
            ("upload", self.workers.upload),
            ("schedule", self.workers.schedule),
        ] {
            if size == 0 {
                return Err(Error::config(format!(
                    "workers.{stage} must be at least 1"
                )));
            }
        }
        if self.stability.confirmations == 0 {
            return Err(Error::config("stability.confirmations must be at least 1"));
        }
        if self.tracker.url.trim().is_empty() {
            return Err(Error::config("tracker.url must be set"));
        }
        if self.monitor.schedule && self.metadata.url.trim().is_empty() {
            return Err(Error::config(
                "metadata.url must be set when monitor.schedule is enabled",
            ));
        }
        if self.storage.backend == StorageBackend::Rclone && self.storage.remote.trim().is_empty()
        {
            return Err(Error::config("storage.remote must be set for the rclone backend"));
        }
        for pattern in self.monitor.skip.iter().chain(&self.monitor.sidecar_patterns) {
            regex::Regex::new(pattern)
                .map_err(|e| Error::config(format!("invalid pattern '{pattern}': {e}")))?;
        }
        Ok(())
    }
}
