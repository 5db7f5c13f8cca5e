//! Exit condition for one-shot runs.
//!
//! Signals once, on the first failed build or when every manifest that
//! builds on its own has built successfully. Manifests waiting on a
//! `start_on` click and disabled manifests are not waited for.

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::EngineState;
use crate::error::Result;

/// Why a one-shot run stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure(String),
}

pub type ExitReceiver = watch::Receiver<Option<ExitOutcome>>;

/// Decide whether the run is over
pub fn exit_outcome(state: &EngineState) -> Option<ExitOutcome> {
    if state.config_generation == 0 {
        return None;
    }

    let mut all_built = true;
    for target in state.targets() {
        let name = &target.manifest.name;
        if state.is_disabled(name) {
            continue;
        }
        if let Some(error) = &target.state.last_build_error {
            return Some(ExitOutcome::Failure(format!(
                "Build failed for {}: {}",
                name, error
            )));
        }
        if target.manifest.start_on.is_none() && target.state.last_build_finish_time.is_none() {
            all_built = false;
        }
    }
    all_built.then_some(ExitOutcome::Success)
}

pub struct ExitController {
    tx: watch::Sender<Option<ExitOutcome>>,
}

impl ExitController {
    pub fn new() -> (Self, ExitReceiver) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Subscriber for ExitController {
    fn name(&self) -> &str {
        "exit"
    }

    #[instrument(skip_all, name = "exit")]
    async fn on_change(
        &mut self,
        _ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() || self.tx.borrow().is_some() {
            return Ok(());
        }

        let Some(outcome) = store.read(exit_outcome) else {
            return Ok(());
        };
        match &outcome {
            ExitOutcome::Success => info!("All manifests built"),
            ExitOutcome::Failure(reason) => warn!(%reason, "Stopping after failed build"),
        }
        self.tx.send_replace(Some(outcome));
        Ok(())
    }
}
