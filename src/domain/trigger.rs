//! Trigger dependencies and the build trigger queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dependencies that restart a target when they fire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartOnSpec {
    #[serde(default)]
    pub file_watches: Vec<String>,

    #[serde(default)]
    pub ui_buttons: Vec<String>,
}

/// Dependencies that start a target; clicks before `start_after` are ignored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOnSpec {
    #[serde(default)]
    pub ui_buttons: Vec<String>,

    #[serde(default)]
    pub start_after: Option<DateTime<Utc>>,
}

/// Why a build was requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildReason {
    #[default]
    None,
    ChangedFiles,
    ConfigChanged,
    Init,
    TriggerWeb,
    TriggerCli,
}

impl BuildReason {
    /// Numeric code used in the published trigger queue
    pub fn code(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::ChangedFiles => 1,
            Self::ConfigChanged => 2,
            Self::Init => 4,
            Self::TriggerWeb => 8,
            Self::TriggerCli => 16,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        [
            Self::None,
            Self::ChangedFiles,
            Self::ConfigChanged,
            Self::Init,
            Self::TriggerWeb,
            Self::TriggerCli,
        ]
        .into_iter()
        .find(|r| r.code() == code)
    }
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::ChangedFiles => "changed files",
            Self::ConfigChanged => "config changed",
            Self::Init => "initial build",
            Self::TriggerWeb => "web trigger",
            Self::TriggerCli => "cli trigger",
        })
    }
}

/// A manifest waiting for an explicit build trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerQueueEntry {
    pub manifest_name: String,
    pub reason: BuildReason,
}

impl TriggerQueueEntry {
    pub fn new(manifest_name: impl Into<String>, reason: BuildReason) -> Self {
        Self {
            manifest_name: manifest_name.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_round_trip() {
        for reason in [
            BuildReason::None,
            BuildReason::ChangedFiles,
            BuildReason::TriggerWeb,
            BuildReason::TriggerCli,
        ] {
            assert_eq!(BuildReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(BuildReason::from_code(3), None);
    }

    #[test]
    fn test_restart_on_from_yaml() {
        let spec: RestartOnSpec = serde_yaml::from_str("file_watches: [fe-deps]\n").unwrap();
        assert_eq!(spec.file_watches, vec!["fe-deps".to_string()]);
        assert!(spec.ui_buttons.is_empty());
    }
}
