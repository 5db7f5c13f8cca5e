//! Stand-in build step.
//!
//! Consumes the trigger queue in order and records each queued manifest as
//! built and deployed immediately. Disabled manifests are left for the queue
//! publisher to evict.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};

use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{Action, BuildReason};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct PassthroughBuilder {
    in_flight: HashSet<String>,
}

impl PassthroughBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Subscriber for PassthroughBuilder {
    fn name(&self) -> &str {
        "builder"
    }

    #[instrument(skip_all, name = "builder")]
    async fn on_change(
        &mut self,
        ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() {
            return Ok(());
        }

        let queued: Vec<(String, BuildReason)> = store.read(|state| {
            state
                .trigger_queue
                .iter()
                .filter(|e| !state.is_disabled(&e.manifest_name))
                .map(|e| (e.manifest_name.clone(), e.reason))
                .collect()
        });

        // Entries that left the queue have had their BuildStarted applied.
        self.in_flight
            .retain(|name| queued.iter().any(|(queued, _)| queued == name));

        for (name, reason) in queued {
            ctx.check()?;
            if !self.in_flight.insert(name.clone()) {
                continue;
            }
            info!(manifest = %name, %reason, "Building");
            let at = Utc::now();
            store.dispatch(Action::BuildStarted {
                name: name.clone(),
                at,
            });
            store.dispatch(Action::BuildCompleted {
                name,
                at,
                error: None,
            });
        }
        Ok(())
    }
}
