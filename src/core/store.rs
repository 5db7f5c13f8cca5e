//! Centrally held engine state with scoped reads and asynchronous dispatch.
//!
//! Reads go through [`Store::read`], which hands the closure a shared
//! reference for the duration of the call only. The guard never escapes, so
//! no external I/O can happen while the lock is held. Writes happen only by
//! dispatching actions; the engine loop applies them through the reducer.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{Action, EngineState};

use super::reducer;

/// Receiving half of the action channel, drained by the engine loop
pub type ActionReceiver = mpsc::UnboundedReceiver<Action>;

/// What kind of change triggered a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSummary {
    /// Only log events were appended since the last pass
    pub log_only: bool,
}

impl ChangeSummary {
    pub fn logs() -> Self {
        Self { log_only: true }
    }

    /// Combine two summaries covering consecutive changes
    pub fn merge(self, other: Self) -> Self {
        Self {
            log_only: self.log_only && other.log_only,
        }
    }

    pub fn is_log_only(&self) -> bool {
        self.log_only
    }
}

/// Shared engine state store
pub struct Store {
    state: RwLock<EngineState>,
    actions: mpsc::UnboundedSender<Action>,
    max_log_events: usize,
}

impl Store {
    /// Create an empty store and the receiver its dispatched actions go to
    pub fn new() -> (Arc<Self>, ActionReceiver) {
        Self::with_max_log_events(10_000)
    }

    pub fn with_max_log_events(max_log_events: usize) -> (Arc<Self>, ActionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            state: RwLock::new(EngineState::default()),
            actions: tx,
            max_log_events,
        };
        (Arc::new(store), rx)
    }

    /// Run `f` against a shared snapshot of the state.
    ///
    /// The read lock is released when `f` returns.
    pub fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Queue an action; its effect is visible from the next notification cycle
    pub fn dispatch(&self, action: Action) {
        if self.actions.send(action).is_err() {
            debug!("Engine stopped, dropping action");
        }
    }

    /// Mutate the state in place.
    ///
    /// Intended for bootstrap and test setup; controllers dispatch actions.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Apply one action through the reducer
    pub fn apply(&self, action: Action) -> ChangeSummary {
        let max = self.max_log_events;
        self.with_state(|state| reducer::apply(state, action, max))
    }

    /// Apply every action currently waiting in `rx` and return them.
    ///
    /// Lets tests and single-step drivers run the dispatch cycle by hand.
    pub fn apply_pending(&self, rx: &mut ActionReceiver) -> Vec<Action> {
        let actions = drain(rx);
        for action in &actions {
            self.apply(action.clone());
        }
        actions
    }
}

/// Take every action currently queued in `rx` without applying it
pub fn drain(rx: &mut ActionReceiver) -> Vec<Action> {
    let mut actions = Vec::new();
    while let Ok(action) = rx.try_recv() {
        actions.push(action);
    }
    actions
}
