//! Process-server lifecycle controller.
//!
//! Derives one CmdServer per locally served manifest and keeps exactly one
//! Cmd alive for it. A changed spec or trigger time replaces the Cmd, but the
//! replacement is only created once the previous Cmd is terminal: the two
//! would likely fight over the same port.
//!
//! The created/deleting maps are a cache. On the first pass they are
//! re-derived from the Cmds in the store through their owner references.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{
    new_server_cmd, Action, Cmd, CmdServer, CmdServerSpec, CmdServerStatus, EngineState,
};
use crate::error::Result;

/// What one reconcile step decided for a server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerDecision {
    /// The current Cmd matches the desired spec and trigger time
    UpToDate,
    /// A Cmd was requested but has not appeared in the store yet
    AwaitingCreate,
    /// A delete was requested and the Cmd is still live
    AwaitingTermination,
    /// Ask for the named Cmd to be terminated
    Delete(String),
    /// Create this Cmd
    Create(Cmd),
}

impl ServerDecision {
    pub fn into_action(self) -> Option<Action> {
        match self {
            Self::Delete(name) => Some(Action::CmdDelete { name }),
            Self::Create(cmd) => Some(Action::CmdCreate { cmd }),
            _ => None,
        }
    }
}

/// CmdServers for every locally served manifest that has deployed successfully
pub fn determine_servers(state: &EngineState) -> Vec<CmdServer> {
    let owned = state.cmds_by_server();

    let mut servers = Vec::new();
    for mt in state.targets() {
        let Some(local) = &mt.manifest.local else {
            continue;
        };
        if local.serve_cmd.is_empty() {
            continue;
        }
        let Some(deployed_at) = mt.state.last_successful_deploy_time else {
            continue;
        };

        let name = mt.manifest.name.clone();
        let status = owned
            .get(&name)
            .map(|cmd| CmdServerStatus {
                cmd_name: cmd.name().to_string(),
                cmd_status: cmd.status.clone(),
            })
            .unwrap_or_default();

        servers.push(CmdServer {
            name,
            spec: CmdServerSpec {
                args: local.serve_cmd.argv.clone(),
                dir: local.serve_cmd.dir.clone(),
                env: local.serve_cmd.env.clone(),
                readiness_probe: local.readiness_probe.clone(),
                trigger_time: Some(deployed_at),
            },
            status,
        });
    }
    servers
}

/// Subscriber creating and replacing server Cmds
#[derive(Debug, Default)]
pub struct ServerController {
    created_cmds: HashMap<String, Cmd>,
    created_trigger_time: HashMap<String, Option<DateTime<Utc>>>,
    deleting_cmds: HashSet<String>,
    cmd_count: u64,
    cache_loaded: bool,
}

impl ServerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derive the bookkeeping from the Cmds currently in `state`
    pub fn rebuild_cache(&mut self, state: &EngineState) {
        self.created_cmds.clear();
        self.created_trigger_time.clear();
        self.deleting_cmds.clear();

        for (server, cmd) in state.cmds_by_server() {
            self.cmd_count = self.cmd_count.max(cmd.serve_index().unwrap_or(0));
            self.created_trigger_time
                .insert(server.clone(), cmd.trigger_time());
            if cmd.deletion_requested {
                self.deleting_cmds.insert(server.clone());
            }
            self.created_cmds.insert(server, cmd.clone());
        }
        // Unowned leftovers still consume names.
        for cmd in state.cmds.values() {
            self.cmd_count = self.cmd_count.max(cmd.serve_index().unwrap_or(0));
        }
        self.cache_loaded = true;
        debug!(
            servers = self.created_cmds.len(),
            cmd_count = self.cmd_count,
            "Server cache rebuilt"
        );
    }

    /// Decide the next step for one server and update the bookkeeping
    pub fn reconcile(&mut self, server: &CmdServer) -> ServerDecision {
        let name = &server.name;
        let desired = server.spec.cmd_spec();

        let created = self.created_cmds.get(name);
        if let Some(created) = created {
            let trigger_time = self.created_trigger_time.get(name).copied().flatten();
            if created.spec == desired && trigger_time == server.spec.trigger_time {
                return ServerDecision::UpToDate;
            }
            // The status may still name an older Cmd until our create lands.
            if server.status.cmd_name != created.name() {
                return ServerDecision::AwaitingCreate;
            }
            if !server.status.cmd_status.is_terminal() {
                if self.deleting_cmds.insert(name.clone()) {
                    return ServerDecision::Delete(server.status.cmd_name.clone());
                }
                return ServerDecision::AwaitingTermination;
            }
        }

        self.created_trigger_time
            .insert(name.clone(), server.spec.trigger_time);
        self.deleting_cmds.remove(name);
        self.cmd_count += 1;

        let cmd = new_server_cmd(name, self.cmd_count, desired, server.spec.trigger_time);
        self.created_cmds.insert(name.clone(), cmd.clone());
        ServerDecision::Create(cmd)
    }
}

#[async_trait]
impl Subscriber for ServerController {
    fn name(&self) -> &str {
        "server"
    }

    #[instrument(skip_all, name = "server_controller")]
    async fn on_change(
        &mut self,
        _ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() {
            return Ok(());
        }

        let servers = store.read(|state| {
            if !self.cache_loaded {
                self.rebuild_cache(state);
            }
            determine_servers(state)
        });

        for server in servers {
            let decision = self.reconcile(&server);
            match &decision {
                ServerDecision::Create(cmd) => {
                    info!(server = %server.name, cmd = %cmd.name(), "Starting server")
                }
                ServerDecision::Delete(cmd) => {
                    info!(server = %server.name, cmd = %cmd, "Stopping server for replacement")
                }
                other => debug!(server = %server.name, decision = ?other, "No server change"),
            }
            if let Some(action) = decision.into_action() {
                store.dispatch(action);
            }
        }
        Ok(())
    }
}
