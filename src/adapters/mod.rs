//! Collaborator interfaces for external systems.
//!
//! The engine talks to two collaborators it does not own:
//! - an object store holding typed objects ([`ObjectClient`])
//! - a process executor running Cmds ([`ProcessExecutor`])
//!
//! Both are consumed only through these traits.

pub mod memory;
pub mod process;
pub mod watcher;

use async_trait::async_trait;

use crate::domain::{CmdSpec, CmdStatus, LabelSelector, Object, ObjectKind};
use crate::error::Result;

pub use memory::{ClientCall, ClientOp, MemoryClient};
pub use process::{ExecutorCall, LocalExecutor, MemoryExecutor};
pub use watcher::FileWatcher;

/// Typed object store
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, kind: ObjectKind, name: &str) -> Result<Object>;

    /// Objects of `kind` whose labels match `selector`
    async fn list(&self, kind: ObjectKind, selector: &LabelSelector) -> Result<Vec<Object>>;

    async fn create(&self, obj: Object) -> Result<Object>;

    /// Replace spec and metadata; the stored status is preserved.
    ///
    /// `obj` must carry the current resource version.
    async fn update(&self, obj: Object) -> Result<Object>;

    /// Replace status only
    async fn update_status(&self, obj: Object) -> Result<Object>;

    async fn delete(&self, obj: &Object) -> Result<()>;
}

/// A running (or finished) process started by an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Cmd name the process was started for
    pub name: String,
    pub pid: Option<u32>,
}

/// Runs processes on behalf of Cmds
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn create_process(&self, name: &str, spec: &CmdSpec) -> Result<ProcessHandle>;

    /// Ask the process to stop; completion is observed through [`Self::wait`]
    async fn delete_process(&self, handle: &ProcessHandle) -> Result<()>;

    async fn status(&self, handle: &ProcessHandle) -> CmdStatus;

    /// Resolve once the process reaches a terminal status
    async fn wait(&self, handle: &ProcessHandle) -> CmdStatus;
}
