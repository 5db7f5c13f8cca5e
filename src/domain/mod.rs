//! Domain types for the reconciliation engine.
//!
//! This module contains the core data structures:
//! - Objects: typed API objects held by the object store
//! - Cmd: process descriptors and the servers that own them
//! - Manifest: pre-evaluated desired configuration
//! - State: the centrally held engine snapshot
//! - Actions: the only way that snapshot changes

pub mod actions;
pub mod cmd;
pub mod manifest;
pub mod objects;
pub mod state;
pub mod trigger;

// Re-export commonly used types
pub use actions::Action;
pub use cmd::{
    new_server_cmd, Cmd, CmdServer, CmdServerSpec, CmdServerStatus, CmdSpec, CmdStatus, Probe,
    ProbeHandler, ANNOTATION_SERVE_INDEX, ANNOTATION_TRIGGER_TIME, OWNER_KIND_CMD_SERVER,
};
pub use manifest::{ImageTarget, LocalTarget, Manifest, ManifestState, ServeCmd};
pub use objects::{
    ConfigMap, FileEvent, FileWatch, FileWatchSpec, FileWatchStatus, ImageMap, ImageMapSpec,
    KubernetesApply, KubernetesApplySpec, LabelSelector, Object, ObjectKind, ObjectMeta,
    OwnerReference, UiButton, UiButtonSpec, UiButtonStatus, ANNOTATION_MANIFEST, ANNOTATION_SPAN_ID,
    LABEL_MANIFEST,
    LABEL_OWNER_KIND, OWNER_KIND_CONFIG,
};
pub use state::{EngineState, LogEvent, LogLevel, ManifestTarget, UiResource};
pub use trigger::{BuildReason, RestartOnSpec, StartOnSpec, TriggerQueueEntry};
