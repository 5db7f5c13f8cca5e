//! Pre-evaluated configuration for one resource.
//!
//! Manifests arrive already evaluated (the configuration language lives
//! outside this crate); the engine only reads them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cmd::Probe;
use super::trigger::{RestartOnSpec, StartOnSpec};

/// An image built for a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTarget {
    /// Image reference, e.g. `gcr.io/project/frontend`
    pub image_ref: String,

    #[serde(default)]
    pub match_in_env_vars: bool,

    /// Build context, watched for changes
    #[serde(default)]
    pub context: Option<PathBuf>,
}

/// A command served locally for the lifetime of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeCmd {
    pub argv: Vec<String>,

    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default)]
    pub env: Vec<String>,
}

impl ServeCmd {
    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }
}

/// A locally run target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTarget {
    #[serde(default)]
    pub serve_cmd: ServeCmd,

    #[serde(default)]
    pub readiness_probe: Option<Probe>,
}

/// Desired configuration for one named resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,

    #[serde(default)]
    pub image_targets: Vec<ImageTarget>,

    /// Kubernetes YAML to apply
    #[serde(default)]
    pub k8s_yaml: Option<String>,

    #[serde(default)]
    pub local: Option<LocalTarget>,

    /// Files and directories this manifest depends on
    #[serde(default)]
    pub deps: Vec<PathBuf>,

    /// Glob patterns excluded from `deps`
    #[serde(default)]
    pub ignores: Vec<String>,

    #[serde(default)]
    pub restart_on: Option<RestartOnSpec>,

    #[serde(default)]
    pub start_on: Option<StartOnSpec>,
}

impl Manifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_k8s(&self) -> bool {
        self.k8s_yaml.is_some()
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    /// Name of the FileWatch generated for this manifest's deps
    pub fn file_watch_name(&self) -> String {
        format!("{}:update", self.name)
    }

    /// Effective restart dependencies: the explicit ones plus the
    /// manifest's own FileWatch when it has deps
    pub fn effective_restart_on(&self) -> Option<RestartOnSpec> {
        let mut spec = self.restart_on.clone();
        if !self.deps.is_empty() {
            let fw = self.file_watch_name();
            let s = spec.get_or_insert_with(RestartOnSpec::default);
            if !s.file_watches.contains(&fw) {
                s.file_watches.push(fw);
            }
        }
        spec
    }
}

/// Mutable per-manifest build bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestState {
    #[serde(default)]
    pub last_build_start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_build_finish_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_build_error: Option<String>,

    /// Zero until the first successful build; servers only start after it
    #[serde(default)]
    pub last_successful_deploy_time: Option<DateTime<Utc>>,

    /// Files reported by the most recent trigger
    #[serde(default)]
    pub pending_file_changes: Vec<String>,
}
