//! `steward run`: load manifests and reconcile them until interrupted.
//!
//! Wires the store, the in-memory object client, the local process executor,
//! the file watcher and every controller into one engine. With
//! `--exit-on-done` the run also stops once every manifest has built, or on
//! the first failed build.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::adapters::{FileWatcher, LocalExecutor, MemoryClient, ObjectClient, ProcessExecutor};
use crate::config::EngineConfig;
use crate::controllers::{
    BuildTriggerController, CmdRunner, ExitController, ExitOutcome, ExitReceiver,
    OwnedObjectsController, PassthroughBuilder, ServerController, TriggerQueuePublisher,
};
use crate::core::{ActionReceiver, Engine, Store};
use crate::domain::{Action, BuildReason, Manifest};

/// Manifest file schema
#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    manifests: Vec<Manifest>,
}

/// Parse a manifest file; names must be non-empty and unique
pub fn parse_manifests(content: &str) -> Result<Vec<Manifest>> {
    let file: ManifestFile = serde_yaml::from_str(content).context("Invalid manifest file")?;

    let mut seen = HashSet::new();
    for m in &file.manifests {
        if m.name.is_empty() {
            bail!("Manifest with empty name");
        }
        if !seen.insert(m.name.as_str()) {
            bail!("Duplicate manifest name: {}", m.name);
        }
    }
    Ok(file.manifests)
}

pub fn load_manifests(path: &Path) -> Result<Vec<Manifest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifests: {}", path.display()))?;
    parse_manifests(&content).with_context(|| format!("In {}", path.display()))
}

/// Build an engine with every controller subscribed
pub fn assemble(
    config: &EngineConfig,
    store: Arc<Store>,
    client: Arc<dyn ObjectClient>,
    executor: Arc<dyn ProcessExecutor>,
) -> Engine {
    Engine::new(Arc::clone(&store))
        .with_subscriber(OwnedObjectsController::new(
            Arc::clone(&client),
            config.not_ready_retry,
        ))
        .with_subscriber(FileWatcher::new(
            Arc::clone(&client),
            Arc::clone(&store),
            config.watch_debounce,
        ))
        .with_subscriber(BuildTriggerController::new(Arc::clone(&client)))
        .with_subscriber(TriggerQueuePublisher::new(
            Arc::clone(&client),
            config.trigger_queue_name.clone(),
        ))
        .with_subscriber(PassthroughBuilder::new())
        .with_subscriber(ServerController::new())
        .with_subscriber(CmdRunner::new(executor, store))
}

/// Load `manifests` into the store and queue their initial builds.
///
/// Manifests gated by `start_on` wait for a click instead.
pub fn bootstrap(store: &Store, manifests: Vec<Manifest>) {
    let initial: Vec<String> = manifests
        .iter()
        .filter(|m| m.start_on.is_none())
        .map(|m| m.name.clone())
        .collect();

    store.dispatch(Action::ConfigLoaded { manifests });
    for name in initial {
        store.dispatch(Action::AppendToTriggerQueue {
            name,
            reason: BuildReason::Init,
            files: vec![],
        });
    }
}

/// Start the engine over fresh in-memory collaborators.
///
/// With `exit_on_done`, an [`ExitController`] is subscribed and its receiver
/// returned.
pub fn start(
    config: &EngineConfig,
    manifests: Vec<Manifest>,
    exit_on_done: bool,
) -> (Engine, ActionReceiver, Option<ExitReceiver>) {
    let (store, rx) = Store::with_max_log_events(config.max_log_events);
    bootstrap(&store, manifests);

    let client: Arc<dyn ObjectClient> = Arc::new(MemoryClient::new());
    let executor: Arc<dyn ProcessExecutor> = Arc::new(LocalExecutor::new());
    let engine = assemble(config, store, client, executor);
    if !exit_on_done {
        return (engine, rx, None);
    }
    let (exit, exit_rx) = ExitController::new();
    (engine.with_subscriber(exit), rx, Some(exit_rx))
}

/// Resolve once the exit controller has decided; never if there is none
async fn exit_requested(exit: Option<ExitReceiver>) {
    if let Some(mut exit) = exit {
        let closed = exit.wait_for(Option::is_some).await.is_err();
        if !closed {
            return;
        }
    }
    std::future::pending::<()>().await
}

pub async fn execute(
    config: EngineConfig,
    manifests_path: &Path,
    exit_on_done: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let manifests = load_manifests(manifests_path)?;
    info!(
        manifests = manifests.len(),
        path = %manifests_path.display(),
        exit_on_done,
        "Starting engine"
    );

    let (engine, rx, exit) = start(&config, manifests, exit_on_done);
    let watched = exit.clone();
    engine
        .run(rx, async move {
            tokio::select! {
                _ = shutdown => info!("Interrupted"),
                _ = exit_requested(watched) => info!("Exit condition reached"),
            }
        })
        .await;
    info!("Engine stopped");

    let outcome = exit.as_ref().and_then(|exit| exit.borrow().clone());
    match outcome {
        Some(ExitOutcome::Failure(reason)) => Err(anyhow!(reason)),
        _ => Ok(()),
    }
}
