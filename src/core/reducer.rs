//! Applies actions to the engine state.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::domain::{Action, CmdStatus, EngineState, ManifestTarget, TriggerQueueEntry, UiResource};

use super::store::ChangeSummary;

/// Apply one action, returning what kind of change it was
pub fn apply(state: &mut EngineState, action: Action, max_log_events: usize) -> ChangeSummary {
    match action {
        Action::Log(event) => {
            state.logs.push_back(event);
            while state.logs.len() > max_log_events {
                state.logs.pop_front();
            }
            return ChangeSummary::logs();
        }

        Action::ConfigLoaded { manifests } => {
            let mut previous: HashMap<String, ManifestTarget> =
                std::mem::take(&mut state.manifest_targets);
            state.manifest_order.clear();
            for manifest in manifests {
                let target = match previous.remove(&manifest.name) {
                    Some(existing) => ManifestTarget {
                        manifest,
                        state: existing.state,
                    },
                    None => ManifestTarget::new(manifest),
                };
                state.upsert_manifest_target(target);
            }
            let removed: Vec<String> = previous.into_keys().collect();
            for name in &removed {
                state.remove_from_trigger_queue(name);
            }
            state.config_generation += 1;
            debug!(
                generation = state.config_generation,
                manifests = state.manifest_order.len(),
                removed = removed.len(),
                "Configuration loaded"
            );
        }

        Action::AppendToTriggerQueue {
            name,
            reason,
            files,
        } => {
            if let Some(target) = state.manifest_targets.get_mut(&name) {
                let pending = &mut target.state.pending_file_changes;
                pending.extend(files);
                pending.sort();
                pending.dedup();
            }
            if !state.append_to_trigger_queue(TriggerQueueEntry::new(name.clone(), reason)) {
                trace!(manifest = %name, "Already queued");
            }
        }

        Action::RemoveFromTriggerQueue { name } => {
            state.remove_from_trigger_queue(&name);
        }

        Action::BuildStarted { name, at } => {
            state.remove_from_trigger_queue(&name);
            if let Some(target) = state.manifest_targets.get_mut(&name) {
                target.state.last_build_start_time = Some(at);
                target.state.pending_file_changes.clear();
            }
        }

        Action::BuildCompleted { name, at, error } => {
            if let Some(target) = state.manifest_targets.get_mut(&name) {
                target.state.last_build_finish_time = Some(at);
                if error.is_none() {
                    target.state.last_successful_deploy_time = Some(at);
                }
                target.state.last_build_error = error;
            }
        }

        Action::CmdCreate { cmd } => {
            // Terminal Cmds of the same server are replaced by the new one.
            if let Some(server) = cmd.server_name() {
                let server = server.to_string();
                state.cmds.retain(|_, existing| {
                    !(existing.server_name() == Some(server.as_str())
                        && existing.status.is_terminal())
                });
            }
            state.cmds.insert(cmd.name().to_string(), cmd);
        }

        Action::CmdDelete { name } => {
            if let Some(cmd) = state.cmds.get_mut(&name) {
                cmd.deletion_requested = true;
            }
        }

        Action::CmdStarted { name, pid, at } => {
            if let Some(cmd) = state.cmds.get_mut(&name) {
                if !cmd.status.is_terminal() {
                    cmd.status = CmdStatus::Running {
                        pid,
                        started_at: at,
                    };
                }
            }
        }

        Action::CmdStatusChanged { name, status } => {
            if let Some(cmd) = state.cmds.get_mut(&name) {
                cmd.status = status;
            }
        }

        Action::SetDisabled { name, disabled } => {
            let resource = state
                .ui_resources
                .entry(name)
                .or_insert_with(UiResource::default);
            resource.disabled_count = u32::from(disabled);
        }

        Action::ObjectChanged { .. } => {
            state.object_generation += 1;
        }
    }

    ChangeSummary::default()
}
