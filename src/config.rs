//! Engine configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STEWARD_NOT_READY_RETRIES, STEWARD_TRIGGER_QUEUE_NAME)
//! 2. Config file (.steward/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches the current directory and its parents for .steward/config.yaml
//! - Falls back to $STEWARD_HOME/config.yaml, then ~/.steward/config.yaml

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub reconcile: Option<ReconcileConfig>,
    #[serde(default)]
    pub trigger_queue: Option<TriggerQueueConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconcileConfig {
    pub not_ready_retries: Option<u32>,
    pub not_ready_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerQueueConfig {
    pub document_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub max_events: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    pub debounce_ms: Option<u64>,
}

/// Bounded, fixed-delay retry for the "store not ready" error class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Should another attempt be made after `retries_so_far` retries?
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Resolved engine configuration
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub not_ready_retry: RetryPolicy,

    /// Name of the published trigger-queue document
    pub trigger_queue_name: String,

    /// Log events kept in engine state
    pub max_log_events: usize,

    pub watch_debounce: Duration,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

pub const DEFAULT_TRIGGER_QUEUE_NAME: &str = "trigger-queue";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            not_ready_retry: RetryPolicy::default(),
            trigger_queue_name: DEFAULT_TRIGGER_QUEUE_NAME.to_string(),
            max_log_events: 10_000,
            watch_debounce: Duration::from_millis(200),
            config_file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`EngineConfig::load`], with `explicit` replacing file discovery
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let config_file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file().or_else(home_config_file),
        };
        let mut config = match config_file {
            Some(ref path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load from an explicit file, without environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = load_config_file(path)?;
        let mut config = Self::from_raw(raw);
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Resolve a parsed config file against the defaults
    pub fn from_raw(raw: ConfigFile) -> Self {
        let defaults = Self::default();
        let reconcile = raw.reconcile.unwrap_or_default();

        Self {
            not_ready_retry: RetryPolicy {
                max_retries: reconcile
                    .not_ready_retries
                    .unwrap_or(defaults.not_ready_retry.max_retries),
                delay: reconcile
                    .not_ready_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.not_ready_retry.delay),
            },
            trigger_queue_name: raw
                .trigger_queue
                .and_then(|t| t.document_name)
                .unwrap_or(defaults.trigger_queue_name),
            max_log_events: raw
                .log
                .and_then(|l| l.max_events)
                .unwrap_or(defaults.max_log_events),
            watch_debounce: raw
                .watch
                .and_then(|w| w.debounce_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.watch_debounce),
            config_file: None,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(retries) = std::env::var("STEWARD_NOT_READY_RETRIES") {
            self.not_ready_retry.max_retries = retries
                .parse()
                .with_context(|| format!("Invalid STEWARD_NOT_READY_RETRIES: {}", retries))?;
        }
        if let Ok(name) = std::env::var("STEWARD_TRIGGER_QUEUE_NAME") {
            if !name.is_empty() {
                self.trigger_queue_name = name;
            }
        }
        Ok(())
    }
}

/// Get the steward home directory ($STEWARD_HOME or ~/.steward)
pub fn steward_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("STEWARD_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".steward"))
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".steward").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

fn home_config_file() -> Option<PathBuf> {
    let path = steward_home().ok()?.join("config.yaml");
    path.exists().then_some(path)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
