//! steward - declarative reconciliation engine
//!
//! Keeps a set of owned objects, locally served processes and a published
//! build trigger queue in line with a centrally held desired-state snapshot.
//!
//! # Architecture
//!
//! The system is built around a single state store:
//! - All state changes are actions applied by a reducer
//! - Controllers subscribe to the store and reconcile on every change
//! - Controllers talk to the outside world only through collaborator traits
//!   (`ObjectClient`, `ProcessExecutor`) and report back through actions
//!
//! # Modules
//!
//! - `adapters`: Collaborators (object store, process executor, file watcher)
//! - `controllers`: Reconcilers (owned objects, servers, trigger queue, ...)
//! - `core`: Store, reducer and subscriber runtime
//! - `domain`: Data structures (Manifest, Object, Cmd, Action)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Reconcile a manifest file until Ctrl-C
//! steward run --manifests manifests.yaml
//!
//! # Build everything once, fail on the first build error
//! steward run --manifests manifests.yaml --exit-on-done
//!
//! # Show the resolved configuration
//! steward config --json
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod controllers;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use config::{EngineConfig, RetryPolicy};
pub use core::{Engine, PassContext, Store, Subscriber};
pub use domain::{Action, EngineState, Manifest};
pub use error::{AggregateError, Error, Result};
