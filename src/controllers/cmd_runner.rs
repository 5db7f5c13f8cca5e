//! Bridge between Cmd records and the process executor.
//!
//! Starts a process for every new Cmd, terminates Cmds whose deletion was
//! requested, and reports exits back into the store. Process failures are
//! surfaced as log actions attributed to the owning manifest; they never fail
//! the pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ProcessExecutor, ProcessHandle};
use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{Action, Cmd, CmdStatus, LogLevel, ANNOTATION_SPAN_ID};
use crate::error::Result;

fn attribution(cmd: &Cmd) -> (String, String) {
    let manifest = cmd.manifest_name().unwrap_or_default().to_string();
    let span = cmd
        .meta
        .annotations
        .get(ANNOTATION_SPAN_ID)
        .cloned()
        .unwrap_or_else(|| format!("cmd:{}", cmd.name()));
    (manifest, span)
}

/// Subscriber running the processes behind Cmd records
pub struct CmdRunner {
    executor: Arc<dyn ProcessExecutor>,
    store: Arc<Store>,
    handles: HashMap<String, ProcessHandle>,
    attempted: HashSet<String>,
    terminating: HashSet<String>,
}

impl CmdRunner {
    pub fn new(executor: Arc<dyn ProcessExecutor>, store: Arc<Store>) -> Self {
        Self {
            executor,
            store,
            handles: HashMap::new(),
            attempted: HashSet::new(),
            terminating: HashSet::new(),
        }
    }

    async fn start(&mut self, cmd: &Cmd) {
        let name = cmd.name().to_string();
        self.attempted.insert(name.clone());
        let (manifest, span) = attribution(cmd);

        match self.executor.create_process(&name, &cmd.spec).await {
            Ok(handle) => {
                self.store.dispatch(Action::CmdStarted {
                    name: name.clone(),
                    pid: handle.pid,
                    at: Utc::now(),
                });
                self.spawn_waiter(handle.clone(), manifest, span);
                self.handles.insert(name, handle);
            }
            Err(e) => {
                warn!(cmd = %name, error = %e, "Failed to start process");
                self.store.dispatch(Action::CmdStatusChanged {
                    name: name.clone(),
                    status: CmdStatus::Errored {
                        reason: e.to_string(),
                    },
                });
                self.store.dispatch(Action::log(
                    manifest,
                    span,
                    LogLevel::Error,
                    format!("Failed to start {}: {}", name, e),
                ));
            }
        }
    }

    fn spawn_waiter(&self, handle: ProcessHandle, manifest: String, span: String) {
        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let status = executor.wait(&handle).await;
            let requested = store.read(|s| {
                s.cmds
                    .get(&handle.name)
                    .map(|c| c.deletion_requested)
                    .unwrap_or(true)
            });

            let failure = match &status {
                CmdStatus::Terminated { exit_code, .. } if *exit_code != 0 => {
                    Some(format!("{} exited with code {}", handle.name, exit_code))
                }
                CmdStatus::Errored { reason } => Some(format!("{} failed: {}", handle.name, reason)),
                _ => None,
            };
            match failure {
                Some(message) if !requested => {
                    store.dispatch(Action::log(manifest, span, LogLevel::Error, message))
                }
                _ => debug!(cmd = %handle.name, status = ?status, "Process finished"),
            }

            store.dispatch(Action::CmdStatusChanged {
                name: handle.name,
                status,
            });
        });
    }

    async fn terminate(&mut self, cmd: &Cmd) {
        let name = cmd.name();
        if !self.terminating.insert(name.to_string()) {
            return;
        }
        let Some(handle) = self.handles.get(name) else {
            // Never started: nothing to stop.
            self.store.dispatch(Action::CmdStatusChanged {
                name: name.to_string(),
                status: CmdStatus::Terminated {
                    exit_code: 0,
                    finished_at: Utc::now(),
                },
            });
            return;
        };

        info!(cmd = %name, "Terminating process");
        if let Err(e) = self.executor.delete_process(handle).await {
            warn!(cmd = %name, error = %e, "Failed to terminate process");
            // Retried on the next pass.
            self.terminating.remove(name);
            let (manifest, span) = attribution(cmd);
            self.store.dispatch(Action::log(
                manifest,
                span,
                LogLevel::Error,
                format!("Failed to stop {}: {}", name, e),
            ));
        }
    }
}

#[async_trait]
impl Subscriber for CmdRunner {
    fn name(&self) -> &str {
        "cmd-runner"
    }

    #[instrument(skip_all, name = "cmd_runner")]
    async fn on_change(
        &mut self,
        ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() {
            return Ok(());
        }

        let cmds: Vec<Cmd> = store.read(|s| s.cmds.values().cloned().collect());

        for cmd in &cmds {
            ctx.check()?;
            if cmd.status.is_terminal() {
                continue;
            }
            if cmd.deletion_requested {
                self.terminate(cmd).await;
            } else if !self.attempted.contains(cmd.name()) {
                self.start(cmd).await;
            }
        }

        // Forget Cmds that left the store.
        let live: HashSet<&str> = cmds.iter().map(Cmd::name).collect();
        self.handles.retain(|name, _| live.contains(name.as_str()));
        self.attempted.retain(|name| live.contains(name.as_str()));
        self.terminating.retain(|name| live.contains(name.as_str()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExecutorCall, MemoryExecutor};
    use crate::core::ActionReceiver;
    use crate::domain::{new_server_cmd, CmdSpec};
    use std::time::Duration;

    fn setup() -> (Arc<Store>, ActionReceiver, Arc<MemoryExecutor>, CmdRunner) {
        let (store, rx) = Store::new();
        let executor = Arc::new(MemoryExecutor::new());
        let runner = CmdRunner::new(
            executor.clone() as Arc<dyn ProcessExecutor>,
            Arc::clone(&store),
        );
        (store, rx, executor, runner)
    }

    fn create(store: &Store, server: &str, index: u64) {
        store.apply(Action::CmdCreate {
            cmd: new_server_cmd(
                server,
                index,
                CmdSpec {
                    args: vec!["serve".to_string()],
                    ..Default::default()
                },
                None,
            ),
        });
    }

    async fn pass(runner: &mut CmdRunner, store: &Store) {
        runner
            .on_change(&PassContext::background(), store, ChangeSummary::default())
            .await
            .unwrap();
    }

    /// Apply dispatched actions until `done` holds or a second passes
    async fn settle(
        store: &Store,
        rx: &mut ActionReceiver,
        done: impl Fn(&[Action]) -> bool,
    ) -> Vec<Action> {
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.extend(store.apply_pending(rx));
            if done(&seen) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen
    }

    fn has_status_change(actions: &[Action]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::CmdStatusChanged { .. }))
    }

    #[tokio::test]
    async fn test_new_cmd_is_started_once() {
        let (store, mut rx, executor, mut runner) = setup();
        create(&store, "fe", 1);

        pass(&mut runner, &store).await;
        pass(&mut runner, &store).await;
        store.apply_pending(&mut rx);

        assert_eq!(
            executor.calls(),
            vec![ExecutorCall::Create("fe-serve-1".to_string())]
        );
        assert!(store.read(|s| s.cmds["fe-serve-1"].status.is_running()));
    }

    #[tokio::test]
    async fn test_deletion_terminates_and_reports() {
        let (store, mut rx, executor, mut runner) = setup();
        create(&store, "fe", 1);
        pass(&mut runner, &store).await;
        store.apply_pending(&mut rx);

        store.apply(Action::CmdDelete {
            name: "fe-serve-1".to_string(),
        });
        pass(&mut runner, &store).await;
        pass(&mut runner, &store).await;
        assert_eq!(
            executor.calls(),
            vec![
                ExecutorCall::Create("fe-serve-1".to_string()),
                ExecutorCall::Delete("fe-serve-1".to_string()),
            ]
        );

        let actions = settle(&store, &mut rx, has_status_change).await;
        assert!(has_status_change(&actions));
        // Requested terminations are not reported as failures.
        assert!(!actions.iter().any(Action::is_log));
        assert!(store.read(|s| s.cmds["fe-serve-1"].status.is_terminal()));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_logged_against_manifest() {
        let (store, mut rx, executor, mut runner) = setup();
        executor.refuse("fe-serve-1");
        create(&store, "fe", 1);

        pass(&mut runner, &store).await;
        let actions = store.apply_pending(&mut rx);

        let log = actions
            .iter()
            .find_map(|a| match a {
                Action::Log(event) => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(log.manifest, "fe");
        assert_eq!(log.level, LogLevel::Error);
        assert!(log.message.contains("Failed to start fe-serve-1"));
        assert!(matches!(
            store.read(|s| s.cmds["fe-serve-1"].status.clone()),
            CmdStatus::Errored { .. }
        ));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_logged() {
        let (store, mut rx, executor, mut runner) = setup();
        create(&store, "fe", 1);
        pass(&mut runner, &store).await;
        store.apply_pending(&mut rx);

        executor.exit("fe-serve-1", 2);
        let actions = settle(&store, &mut rx, has_status_change).await;
        let message = actions
            .iter()
            .find_map(|a| match a {
                Action::Log(event) => Some(event.message.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(message, "fe-serve-1 exited with code 2");
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_without_blocking_others() {
        let (store, mut rx, executor, mut runner) = setup();
        create(&store, "be", 1);
        create(&store, "fe", 1);
        pass(&mut runner, &store).await;
        store.apply_pending(&mut rx);

        executor.fail_next_delete("be-serve-1");
        store.apply(Action::CmdDelete {
            name: "be-serve-1".to_string(),
        });
        store.apply(Action::CmdDelete {
            name: "fe-serve-1".to_string(),
        });
        pass(&mut runner, &store).await;

        // be failed to stop; fe, later in the same pass, still went through.
        assert_eq!(
            executor.calls()[2..],
            [
                ExecutorCall::Delete("be-serve-1".to_string()),
                ExecutorCall::Delete("fe-serve-1".to_string()),
            ]
        );
        let actions = store.apply_pending(&mut rx);
        let log = actions
            .iter()
            .find_map(|a| match a {
                Action::Log(event) => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(log.manifest, "be");
        assert_eq!(log.level, LogLevel::Error);
        assert!(log.message.starts_with("Failed to stop be-serve-1"));

        pass(&mut runner, &store).await;
        assert_eq!(
            executor.calls().last(),
            Some(&ExecutorCall::Delete("be-serve-1".to_string()))
        );
        settle(&store, &mut rx, |_| {
            store.read(|s| s.cmds.values().all(|c| c.status.is_terminal()))
        })
        .await;
        assert!(store.read(|s| s.cmds["be-serve-1"].status.is_terminal()));
        assert!(store.read(|s| s.cmds["fe-serve-1"].status.is_terminal()));
    }

    #[tokio::test]
    async fn test_delete_before_start_terminates_record() {
        let (store, mut rx, executor, mut runner) = setup();
        create(&store, "fe", 1);
        store.apply(Action::CmdDelete {
            name: "fe-serve-1".to_string(),
        });

        pass(&mut runner, &store).await;
        store.apply_pending(&mut rx);
        assert!(executor.calls().is_empty());
        assert!(store.read(|s| s.cmds["fe-serve-1"].status.is_terminal()));
    }
}
