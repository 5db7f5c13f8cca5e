//! Process descriptors and the servers that own them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::objects::{ObjectMeta, OwnerReference};

/// Owner-reference kind linking a Cmd to its server
pub const OWNER_KIND_CMD_SERVER: &str = "CmdServer";

/// Annotation recording the trigger time a Cmd was created for (RFC 3339)
pub const ANNOTATION_TRIGGER_TIME: &str = "steward.dev/trigger-time";

/// Annotation recording the per-controller serve counter a Cmd was created with
pub const ANNOTATION_SERVE_INDEX: &str = "steward.dev/serve-index";

/// How a readiness probe checks the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeHandler {
    Exec { command: Vec<String> },
    HttpGet {
        #[serde(default = "default_probe_host")]
        host: String,
        port: u16,
        #[serde(default)]
        path: String,
    },
    TcpSocket {
        #[serde(default = "default_probe_host")]
        host: String,
        port: u16,
    },
}

fn default_probe_host() -> String {
    "localhost".to_string()
}

/// Readiness probe attached to a served command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub handler: ProbeHandler,

    #[serde(default)]
    pub initial_delay_seconds: u32,

    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u32,

    #[serde(default = "default_probe_period")]
    pub period_seconds: u32,

    #[serde(default = "default_probe_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_probe_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_timeout() -> u32 {
    1
}
fn default_probe_period() -> u32 {
    10
}
fn default_probe_threshold() -> u32 {
    1
}
fn default_probe_failure_threshold() -> u32 {
    3
}

/// What to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdSpec {
    pub args: Vec<String>,

    #[serde(default)]
    pub dir: Option<String>,

    /// `KEY=VALUE` pairs added to the inherited environment
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub readiness_probe: Option<Probe>,
}

/// Observed lifecycle of a Cmd
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CmdStatus {
    /// Requested but no process exists yet
    #[default]
    Waiting,
    Running {
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    },
    Terminated {
        exit_code: i32,
        finished_at: DateTime<Utc>,
    },
    Errored {
        reason: String,
    },
}

impl CmdStatus {
    /// Terminated and Errored are both final for replacement purposes
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::Errored { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// A concrete process instance with an observable lifecycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    pub meta: ObjectMeta,
    pub spec: CmdSpec,
    #[serde(default)]
    pub status: CmdStatus,

    /// Set once a delete request has been dispatched for this Cmd
    #[serde(default)]
    pub deletion_requested: bool,
}

impl Cmd {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Name of the CmdServer owning this Cmd
    pub fn server_name(&self) -> Option<&str> {
        self.meta
            .owner(OWNER_KIND_CMD_SERVER)
            .map(|r| r.name.as_str())
    }

    /// Manifest the Cmd's output and failures are attributed to
    pub fn manifest_name(&self) -> Option<&str> {
        self.meta
            .labels
            .get(super::objects::LABEL_MANIFEST)
            .map(String::as_str)
    }

    pub fn trigger_time(&self) -> Option<DateTime<Utc>> {
        self.meta
            .annotations
            .get(ANNOTATION_TRIGGER_TIME)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn serve_index(&self) -> Option<u64> {
        self.meta
            .annotations
            .get(ANNOTATION_SERVE_INDEX)
            .and_then(|s| s.parse().ok())
    }
}

/// Desired state of a long-running server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdServerSpec {
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub env: Vec<String>,
    pub readiness_probe: Option<Probe>,

    /// Bumped to force a restart even when nothing else changed
    pub trigger_time: Option<DateTime<Utc>>,
}

impl CmdServerSpec {
    pub fn cmd_spec(&self) -> CmdSpec {
        CmdSpec {
            args: self.args.clone(),
            dir: self.dir.clone(),
            env: self.env.clone(),
            readiness_probe: self.readiness_probe.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdServerStatus {
    /// Name of the Cmd currently bound to this server, empty if none appeared
    pub cmd_name: String,
    pub cmd_status: CmdStatus,
}

/// Binding between a desired process spec and its current Cmd.
///
/// Recomputed from engine state on every pass; it has no identity beyond
/// its name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdServer {
    pub name: String,
    pub spec: CmdServerSpec,
    pub status: CmdServerStatus,
}

/// Build the Cmd record for a new server instance
pub fn new_server_cmd(
    server: &str,
    index: u64,
    spec: CmdSpec,
    trigger_time: Option<DateTime<Utc>>,
) -> Cmd {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        super::objects::ANNOTATION_SPAN_ID.to_string(),
        format!("cmd:{}:serve:{}", server, index),
    );
    annotations.insert(ANNOTATION_SERVE_INDEX.to_string(), index.to_string());
    if let Some(t) = trigger_time {
        annotations.insert(ANNOTATION_TRIGGER_TIME.to_string(), t.to_rfc3339());
    }

    let mut labels = BTreeMap::new();
    labels.insert(super::objects::LABEL_MANIFEST.to_string(), server.to_string());

    Cmd {
        meta: ObjectMeta {
            name: format!("{}-serve-{}", server, index),
            labels,
            annotations,
            owner_references: vec![OwnerReference {
                kind: OWNER_KIND_CMD_SERVER.to_string(),
                name: server.to_string(),
            }],
            ..Default::default()
        },
        spec,
        status: CmdStatus::Waiting,
        deletion_requested: false,
    }
}
