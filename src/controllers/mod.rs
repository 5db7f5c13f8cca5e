//! Reconciliation controllers.
//!
//! Each controller is a [`Subscriber`](crate::core::Subscriber): it reads the
//! engine state, talks to its collaborators, and reports back through
//! actions.

pub mod build_trigger;
pub mod builder;
pub mod cmd_runner;
pub mod exit;
pub mod owned;
pub mod restarton;
pub mod server;
pub mod trigger_queue;

pub use build_trigger::BuildTriggerController;
pub use builder::PassthroughBuilder;
pub use cmd_runner::CmdRunner;
pub use exit::{ExitController, ExitOutcome, ExitReceiver};
pub use owned::{ApplyReport, ObjectSet, OwnedObjectsController};
pub use server::{ServerController, ServerDecision};
pub use trigger_queue::TriggerQueuePublisher;
