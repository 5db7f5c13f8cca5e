//! Core engine runtime.
//!
//! This module contains:
//! - Store: the centrally held state with scoped reads and async dispatch
//! - Reducer: how actions change the state
//! - Engine: the subscriber runtime driving the controllers

pub mod engine;
pub mod reducer;
pub mod store;

// Re-export commonly used types
pub use engine::{Engine, PassContext, Subscriber};
pub use store::{drain, ActionReceiver, ChangeSummary, Store};
