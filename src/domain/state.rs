//! The centrally held engine state.
//!
//! Controllers read it through [`crate::core::Store::read`] and change it
//! only by dispatching [`super::Action`]s.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cmd::Cmd;
use super::manifest::{Manifest, ManifestState};
use super::trigger::TriggerQueueEntry;

/// A manifest and its build bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestTarget {
    pub manifest: Manifest,
    pub state: ManifestState,
}

impl ManifestTarget {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            state: ManifestState::default(),
        }
    }
}

/// UI-side status of a resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiResource {
    /// Number of disable sources currently in effect
    pub disabled_count: u32,
}

impl UiResource {
    pub fn is_disabled(&self) -> bool {
        self.disabled_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A user-facing log line attributed to a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,

    /// Empty for engine-wide messages
    pub manifest: String,

    pub span_id: String,
    pub level: LogLevel,
    pub message: String,
}

/// Snapshot of everything the controllers reconcile from
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    /// Manifest names in configuration order
    pub manifest_order: Vec<String>,

    pub manifest_targets: HashMap<String, ManifestTarget>,

    /// Ordered, unique by manifest name
    pub trigger_queue: Vec<TriggerQueueEntry>,

    pub ui_resources: HashMap<String, UiResource>,

    /// Process descriptors by Cmd name
    pub cmds: BTreeMap<String, Cmd>,

    pub logs: VecDeque<LogEvent>,

    /// Incremented on every configuration load
    pub config_generation: u64,

    /// Incremented whenever a collaborator reports an object change
    pub object_generation: u64,
}

impl EngineState {
    /// Manifest targets in configuration order
    pub fn targets(&self) -> impl Iterator<Item = &ManifestTarget> {
        self.manifest_order
            .iter()
            .filter_map(|name| self.manifest_targets.get(name))
    }

    pub fn manifests(&self) -> Vec<Manifest> {
        self.targets().map(|mt| mt.manifest.clone()).collect()
    }

    pub fn manifest_state(&self, name: &str) -> Option<&ManifestState> {
        self.manifest_targets.get(name).map(|mt| &mt.state)
    }

    pub fn upsert_manifest_target(&mut self, target: ManifestTarget) {
        let name = target.manifest.name.clone();
        if !self.manifest_targets.contains_key(&name) {
            self.manifest_order.push(name.clone());
        }
        self.manifest_targets.insert(name, target);
    }

    pub fn is_queued(&self, name: &str) -> bool {
        self.trigger_queue.iter().any(|e| e.manifest_name == name)
    }

    /// Append unless the manifest is already queued; returns whether it was added
    pub fn append_to_trigger_queue(&mut self, entry: TriggerQueueEntry) -> bool {
        if self.is_queued(&entry.manifest_name) {
            return false;
        }
        self.trigger_queue.push(entry);
        true
    }

    pub fn remove_from_trigger_queue(&mut self, name: &str) -> bool {
        let before = self.trigger_queue.len();
        self.trigger_queue.retain(|e| e.manifest_name != name);
        before != self.trigger_queue.len()
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.ui_resources
            .get(name)
            .map(UiResource::is_disabled)
            .unwrap_or(false)
    }

    /// Cmds owned by each CmdServer, keyed by server name.
    ///
    /// Ownership comes from owner references only. When several Cmds point
    /// at the same server the one with the highest serve index wins.
    pub fn cmds_by_server(&self) -> HashMap<String, &Cmd> {
        let mut owned: HashMap<String, &Cmd> = HashMap::new();
        for cmd in self.cmds.values() {
            let Some(server) = cmd.server_name() else {
                continue;
            };
            let newer = match owned.get(server) {
                Some(existing) => cmd.serve_index() > existing.serve_index(),
                None => true,
            };
            if newer {
                owned.insert(server.to_string(), cmd);
            }
        }
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cmd::{new_server_cmd, CmdSpec};
    use crate::domain::trigger::BuildReason;

    #[test]
    fn test_trigger_queue_is_unique() {
        let mut state = EngineState::default();
        assert!(state.append_to_trigger_queue(TriggerQueueEntry::new("a", BuildReason::TriggerCli)));
        assert!(state.append_to_trigger_queue(TriggerQueueEntry::new("b", BuildReason::TriggerWeb)));
        assert!(!state.append_to_trigger_queue(TriggerQueueEntry::new("a", BuildReason::TriggerWeb)));

        assert_eq!(state.trigger_queue.len(), 2);
        assert_eq!(state.trigger_queue[0].reason, BuildReason::TriggerCli);

        assert!(state.remove_from_trigger_queue("a"));
        assert!(!state.remove_from_trigger_queue("a"));
        assert_eq!(state.trigger_queue[0].manifest_name, "b");
    }

    #[test]
    fn test_targets_keep_configuration_order() {
        let mut state = EngineState::default();
        for name in ["c", "a", "b"] {
            state.upsert_manifest_target(ManifestTarget::new(Manifest::new(name)));
        }
        state.upsert_manifest_target(ManifestTarget::new(Manifest::new("a")));
        let names: Vec<&str> = state.targets().map(|t| t.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_cmds_by_server_uses_owner_refs() {
        let mut state = EngineState::default();
        for cmd in [
            new_server_cmd("fe", 1, CmdSpec::default(), None),
            new_server_cmd("fe", 4, CmdSpec::default(), None),
            new_server_cmd("be", 2, CmdSpec::default(), None),
        ] {
            state.cmds.insert(cmd.name().to_string(), cmd);
        }
        // A Cmd named like a server Cmd but without an owner reference is not owned.
        let mut stray = new_server_cmd("db", 9, CmdSpec::default(), None);
        stray.meta.owner_references.clear();
        state.cmds.insert(stray.name().to_string(), stray);

        let owned = state.cmds_by_server();
        assert_eq!(owned.len(), 2);
        assert_eq!(owned["fe"].name(), "fe-serve-4");
        assert_eq!(owned["be"].name(), "be-serve-2");
    }
}
