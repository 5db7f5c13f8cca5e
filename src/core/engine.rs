//! Subscriber runtime.
//!
//! The engine drains dispatched actions, applies them through the reducer,
//! and notifies every subscriber. Each subscriber runs on its own task and
//! never runs two passes at once: notifications that arrive during a pass
//! are coalesced into a single follow-up pass.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

use super::store::{ActionReceiver, ChangeSummary, Store};

/// A controller invoked on every state change
#[async_trait]
pub trait Subscriber: Send {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Run one reconciliation pass
    async fn on_change(
        &mut self,
        ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()>;
}

/// Per-pass context carrying the engine's shutdown signal
#[derive(Debug, Clone)]
pub struct PassContext {
    shutdown: watch::Receiver<bool>,
}

impl PassContext {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// A context that is never cancelled
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { shutdown: rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// `Err(Cancelled)` once shutdown has been signalled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Pending notification for one subscriber
#[derive(Default)]
struct Slot {
    pending: Mutex<Option<ChangeSummary>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Slot {
    fn post(&self, summary: ChangeSummary) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = Some(match pending.take() {
            Some(existing) => existing.merge(summary),
            None => summary,
        });
        drop(pending);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<ChangeSummary> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Dispatch loop tying the store to its subscribers
pub struct Engine {
    store: Arc<Store>,
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl Engine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            subscribers: Vec::new(),
        }
    }

    pub fn with_subscriber(mut self, subscriber: impl Subscriber + 'static) -> Self {
        self.subscribers.push(Box::new(subscriber));
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscribers.iter().map(|s| s.name().to_string()).collect()
    }

    /// Run until `shutdown` resolves or every action sender is gone.
    ///
    /// Every subscriber gets one initial pass. On shutdown, in-flight passes
    /// see a cancelled [`PassContext`] and the call returns once they finish.
    #[instrument(skip_all, fields(subscribers = self.subscribers.len()))]
    pub async fn run(self, mut actions: ActionReceiver, shutdown: impl Future<Output = ()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = PassContext::new(stop_rx);

        let mut slots = Vec::with_capacity(self.subscribers.len());
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(self.subscribers.len());
        for subscriber in self.subscribers {
            let slot = Arc::new(Slot::default());
            tasks.push(tokio::spawn(run_subscriber(
                subscriber,
                Arc::clone(&slot),
                Arc::clone(&self.store),
                ctx.clone(),
            )));
            slots.push(slot);
        }

        info!("Engine started");
        for slot in &slots {
            slot.post(ChangeSummary::default());
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Engine shutting down");
                    break;
                }
                next = actions.recv() => {
                    let Some(action) = next else {
                        debug!("Action channel closed");
                        break;
                    };
                    let mut summary = self.store.apply(action);
                    // Batch everything already queued into one notification.
                    while let Ok(action) = actions.try_recv() {
                        summary = summary.merge(self.store.apply(action));
                    }
                    for slot in &slots {
                        slot.post(summary);
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        for slot in &slots {
            slot.close();
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Subscriber task panicked");
            }
        }
        info!("Engine stopped");
    }
}

async fn run_subscriber(
    mut subscriber: Box<dyn Subscriber>,
    slot: Arc<Slot>,
    store: Arc<Store>,
    ctx: PassContext,
) {
    loop {
        slot.notify.notified().await;
        if slot.closed.load(Ordering::SeqCst) {
            break;
        }
        let Some(summary) = slot.take() else {
            continue;
        };
        if let Err(e) = subscriber.on_change(&ctx, &store, summary).await {
            // Partial failures converge on a later pass.
            warn!(subscriber = subscriber.name(), error = %e, "Pass failed");
        }
    }
    debug!(subscriber = subscriber.name(), "Subscriber stopped");
}
