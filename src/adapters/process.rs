//! Process executors.
//!
//! [`LocalExecutor`] runs real processes with `tokio::process`.
//! [`MemoryExecutor`] records requests and lets tests decide when a
//! process exits.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::domain::{CmdSpec, CmdStatus};
use crate::error::{Error, Result};

use super::{ProcessExecutor, ProcessHandle};

struct Tracked {
    kill: Option<oneshot::Sender<()>>,
    status: watch::Receiver<CmdStatus>,
}

fn lookup(
    processes: &Mutex<HashMap<String, Tracked>>,
    name: &str,
) -> Option<watch::Receiver<CmdStatus>> {
    processes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .map(|t| t.status.clone())
}

async fn wait_terminal(rx: Option<watch::Receiver<CmdStatus>>) -> CmdStatus {
    let Some(mut rx) = rx else {
        return CmdStatus::Waiting;
    };
    let terminal = rx
        .wait_for(CmdStatus::is_terminal)
        .await
        .map(|status| status.clone());
    match terminal {
        Ok(status) => status,
        // Sender gone: report whatever was last seen.
        Err(_) => rx.borrow().clone(),
    }
}

// ============================================================================
// LocalExecutor
// ============================================================================

/// Runs Cmds as local child processes
#[derive(Default)]
pub struct LocalExecutor {
    processes: Mutex<HashMap<String, Tracked>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(spec: &CmdSpec) -> Result<Command> {
        let Some((program, args)) = spec.args.split_first() else {
            return Err(Error::Process {
                name: String::new(),
                message: "empty command".to_string(),
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }
        for pair in &spec.env {
            match pair.split_once('=') {
                Some((k, v)) => {
                    cmd.env(k, v);
                }
                None => {
                    cmd.env(pair, "");
                }
            }
        }
        Ok(cmd)
    }
}

#[async_trait]
impl ProcessExecutor for LocalExecutor {
    async fn create_process(&self, name: &str, spec: &CmdSpec) -> Result<ProcessHandle> {
        let mut child = Self::command(spec)
            .and_then(|mut cmd| cmd.spawn().map_err(Error::from))
            .map_err(|e| Error::Process {
                name: name.to_string(),
                message: format!("failed to start {:?}: {}", spec.args, e),
            })?;
        let pid = child.id();
        info!(cmd = %name, pid = ?pid, "Process started");

        let (status_tx, status_rx) = watch::channel(CmdStatus::Running {
            pid,
            started_at: Utc::now(),
        });
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let task_name = name.to_string();
        tokio::spawn(async move {
            let exited = tokio::select! {
                res = child.wait() => res,
                _ = &mut kill_rx => {
                    debug!(cmd = %task_name, "Killing process");
                    if let Err(e) = child.start_kill() {
                        warn!(cmd = %task_name, error = %e, "Kill failed");
                    }
                    child.wait().await
                }
            };
            let status = match exited {
                Ok(exit) => CmdStatus::Terminated {
                    // Killed by a signal: no exit code.
                    exit_code: exit.code().unwrap_or(-1),
                    finished_at: Utc::now(),
                },
                Err(e) => CmdStatus::Errored {
                    reason: e.to_string(),
                },
            };
            let _ = status_tx.send(status);
        });

        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                Tracked {
                    kill: Some(kill_tx),
                    status: status_rx,
                },
            );

        Ok(ProcessHandle {
            name: name.to_string(),
            pid,
        })
    }

    async fn delete_process(&self, handle: &ProcessHandle) -> Result<()> {
        let kill = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&handle.name)
            .and_then(|t| t.kill.take());
        if let Some(kill) = kill {
            // The task may already have exited on its own.
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn status(&self, handle: &ProcessHandle) -> CmdStatus {
        lookup(&self.processes, &handle.name)
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default()
    }

    async fn wait(&self, handle: &ProcessHandle) -> CmdStatus {
        let status = wait_terminal(lookup(&self.processes, &handle.name)).await;
        if status.is_terminal() {
            let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
            if processes
                .get(&handle.name)
                .is_some_and(|t| t.status.borrow().is_terminal())
            {
                processes.remove(&handle.name);
            }
        }
        status
    }
}

// ============================================================================
// MemoryExecutor
// ============================================================================

/// Request made against a [`MemoryExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Create(String),
    Delete(String),
}

struct MemoryTracked {
    tx: watch::Sender<CmdStatus>,
    rx: watch::Receiver<CmdStatus>,
}

/// Executor that never runs anything.
///
/// Created processes stay Running until [`MemoryExecutor::exit`] is called or
/// they are deleted, which terminates them immediately.
#[derive(Default)]
pub struct MemoryExecutor {
    processes: Mutex<HashMap<String, MemoryTracked>>,
    calls: Mutex<Vec<ExecutorCall>>,
    refuse: Mutex<Vec<String>>,
    failing_deletes: Mutex<Vec<String>>,
    next_pid: Mutex<u32>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every future start of the named Cmd
    pub fn refuse(&self, name: impl Into<String>) {
        self.refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.into());
    }

    /// Fail the next delete of the named Cmd, leaving it running
    pub fn fail_next_delete(&self, name: impl Into<String>) {
        self.failing_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.into());
    }

    /// Finish the named process with `exit_code`
    pub fn exit(&self, name: &str, exit_code: i32) {
        if let Some(p) = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            let _ = p.tx.send(CmdStatus::Terminated {
                exit_code,
                finished_at: Utc::now(),
            });
        }
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: ExecutorCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn receiver(&self, name: &str) -> Option<watch::Receiver<CmdStatus>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|p| p.rx.clone())
    }
}

#[async_trait]
impl ProcessExecutor for MemoryExecutor {
    async fn create_process(&self, name: &str, _spec: &CmdSpec) -> Result<ProcessHandle> {
        self.record(ExecutorCall::Create(name.to_string()));
        let refused = self
            .refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|n| n == name);
        if refused {
            return Err(Error::Process {
                name: name.to_string(),
                message: "executable not found".to_string(),
            });
        }

        let pid = {
            let mut next = self.next_pid.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            1000 + *next
        };
        let (tx, rx) = watch::channel(CmdStatus::Running {
            pid: Some(pid),
            started_at: Utc::now(),
        });
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), MemoryTracked { tx, rx });
        Ok(ProcessHandle {
            name: name.to_string(),
            pid: Some(pid),
        })
    }

    async fn delete_process(&self, handle: &ProcessHandle) -> Result<()> {
        self.record(ExecutorCall::Delete(handle.name.clone()));
        {
            let mut failing = self
                .failing_deletes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(pos) = failing.iter().position(|n| *n == handle.name) {
                failing.remove(pos);
                return Err(Error::Process {
                    name: handle.name.clone(),
                    message: "signal delivery failed".to_string(),
                });
            }
        }
        if let Some(p) = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.name)
        {
            if !p.rx.borrow().is_terminal() {
                let _ = p.tx.send(CmdStatus::Terminated {
                    exit_code: -1,
                    finished_at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    async fn status(&self, handle: &ProcessHandle) -> CmdStatus {
        self.receiver(&handle.name)
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default()
    }

    async fn wait(&self, handle: &ProcessHandle) -> CmdStatus {
        wait_terminal(self.receiver(&handle.name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> CmdSpec {
        CmdSpec {
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_local_process_exit_code() {
        let exec = LocalExecutor::new();
        let handle = exec
            .create_process("fail", &spec(&["sh", "-c", "exit 3"]))
            .await
            .unwrap();
        match exec.wait(&handle).await {
            CmdStatus::Terminated { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finished_local_processes_are_forgotten() {
        let exec = LocalExecutor::new();
        for name in ["a", "b", "c"] {
            let handle = exec
                .create_process(name, &spec(&["sh", "-c", "exit 0"]))
                .await
                .unwrap();
            assert!(exec.wait(&handle).await.is_terminal());
        }
        assert!(exec.processes.lock().unwrap().is_empty());

        // A still-running process stays tracked.
        let sleeper = exec
            .create_process("sleeper", &spec(&["sleep", "30"]))
            .await
            .unwrap();
        assert_eq!(exec.processes.lock().unwrap().len(), 1);
        exec.delete_process(&sleeper).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), exec.wait(&sleeper))
            .await
            .unwrap();
        assert!(exec.processes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_process_delete_terminates() {
        let exec = LocalExecutor::new();
        let handle = exec
            .create_process("sleeper", &spec(&["sleep", "30"]))
            .await
            .unwrap();
        assert!(exec.status(&handle).await.is_running());

        exec.delete_process(&handle).await.unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), exec.wait(&handle))
            .await
            .unwrap();
        assert!(status.is_terminal());
    }

    #[tokio::test]
    async fn test_local_spawn_failure() {
        let exec = LocalExecutor::new();
        let err = exec
            .create_process("missing", &spec(&["/definitely/not/a/binary"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));

        let err = exec.create_process("empty", &spec(&[])).await.unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[tokio::test]
    async fn test_memory_executor_lifecycle() {
        let exec = MemoryExecutor::new();
        let handle = exec.create_process("fe-serve-1", &spec(&["x"])).await.unwrap();
        assert!(exec.status(&handle).await.is_running());

        exec.exit("fe-serve-1", 0);
        assert!(exec.wait(&handle).await.is_terminal());

        exec.fail_next_delete("fe-serve-3");
        let third = exec.create_process("fe-serve-3", &spec(&["x"])).await.unwrap();
        assert!(exec.delete_process(&third).await.is_err());
        assert!(exec.status(&third).await.is_running());
        exec.delete_process(&third).await.unwrap();
        assert!(exec.status(&third).await.is_terminal());

        exec.refuse("fe-serve-2");
        assert!(exec.create_process("fe-serve-2", &spec(&["x"])).await.is_err());
        assert_eq!(
            exec.calls(),
            vec![
                ExecutorCall::Create("fe-serve-1".to_string()),
                ExecutorCall::Create("fe-serve-3".to_string()),
                ExecutorCall::Delete("fe-serve-3".to_string()),
                ExecutorCall::Delete("fe-serve-3".to_string()),
                ExecutorCall::Create("fe-serve-2".to_string()),
            ]
        );
    }
}
