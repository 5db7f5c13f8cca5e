//! Actions: the only way engine state changes.

use chrono::{DateTime, Utc};

use super::cmd::{Cmd, CmdStatus};
use super::manifest::Manifest;
use super::objects::ObjectKind;
use super::state::{LogEvent, LogLevel};
use super::trigger::BuildReason;

/// A state change request, applied asynchronously by the store
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A freshly evaluated configuration replaces the manifest set
    ConfigLoaded { manifests: Vec<Manifest> },

    AppendToTriggerQueue {
        name: String,
        reason: BuildReason,
        files: Vec<String>,
    },

    RemoveFromTriggerQueue { name: String },

    BuildStarted { name: String, at: DateTime<Utc> },

    BuildCompleted {
        name: String,
        at: DateTime<Utc>,
        error: Option<String>,
    },

    CmdCreate { cmd: Cmd },

    CmdDelete { name: String },

    CmdStarted { name: String, pid: Option<u32>, at: DateTime<Utc> },

    CmdStatusChanged { name: String, status: CmdStatus },

    SetDisabled { name: String, disabled: bool },

    /// A collaborator changed an object in the object store
    ObjectChanged { kind: ObjectKind, name: String },

    Log(LogEvent),
}

impl Action {
    /// Log action stamped with the current time
    pub fn log(
        manifest: impl Into<String>,
        span_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self::Log(LogEvent {
            timestamp: Utc::now(),
            manifest: manifest.into(),
            span_id: span_id.into(),
            level,
            message: message.into(),
        })
    }

    pub fn is_log(&self) -> bool {
        matches!(self, Self::Log(_))
    }
}
