//! Filesystem watcher backing FileWatch objects.
//!
//! Mirrors the FileWatch objects in the object store into debounced
//! `notify` watchers. Every debounced batch that survives the ignore globs
//! is appended to the object's status as a [`FileEvent`], and an
//! `ObjectChanged` action tells the controllers to look again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use glob::Pattern;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{Action, FileEvent, FileWatch, FileWatchSpec, LabelSelector, Object, ObjectKind};
use crate::error::{Error, Result};

use super::ObjectClient;

/// Status writes retried after a version conflict
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Compiled ignore globs for one FileWatch
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    /// Invalid patterns are skipped with a warning
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|g| match Pattern::new(g) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(pattern = %g, error = %e, "Ignoring invalid glob");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Matches the whole path or its file name
    pub fn is_ignored(&self, path: &Path) -> bool {
        let file_name = path.file_name().map(Path::new);
        self.patterns.iter().any(|p| {
            p.matches_path(path) || file_name.map(|f| p.matches_path(f)).unwrap_or(false)
        })
    }

    /// Keep non-ignored paths, sorted and deduplicated
    pub fn filter(&self, paths: impl IntoIterator<Item = PathBuf>) -> Vec<String> {
        let mut files: Vec<String> = paths
            .into_iter()
            .filter(|p| !self.is_ignored(p))
            .map(|p| p.display().to_string())
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// Handle to control one running watch
pub struct WatchHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Watch task panicked");
        }
    }
}

struct ActiveWatch {
    spec: FileWatchSpec,
    handle: WatchHandle,
}

/// Subscriber keeping one filesystem watch per FileWatch object
pub struct FileWatcher {
    client: Arc<dyn ObjectClient>,
    store: Arc<Store>,
    debounce: Duration,
    active: HashMap<String, ActiveWatch>,
}

impl FileWatcher {
    pub fn new(client: Arc<dyn ObjectClient>, store: Arc<Store>, debounce: Duration) -> Self {
        Self {
            client,
            store,
            debounce,
            active: HashMap::new(),
        }
    }

    /// Names of the FileWatches currently being watched
    pub fn watching(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every running watch
    pub async fn stop_all(&mut self) {
        for (_, active) in self.active.drain() {
            active.handle.stop().await;
        }
    }

    async fn start(&self, fw: &FileWatch) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
        let name = fw.name().to_string();

        let handler_name = name.clone();
        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| match res {
            Ok(events) => {
                let _ = tx.send(events.into_iter().map(|e| e.path).collect());
            }
            Err(e) => warn!(watch = %handler_name, error = ?e, "Watcher error"),
        })?;

        let mut errors = Vec::new();
        let mut last_error = None;
        for path in &fw.spec.watched_paths {
            if let Err(e) = debouncer.watcher().watch(path, RecursiveMode::Recursive) {
                warn!(watch = %name, path = %path.display(), error = %e, "Cannot watch path");
                errors.push(format!("{}: {}", path.display(), e));
                last_error = Some(e);
            }
        }

        let mut started = fw.clone();
        started.status.monitor_start_time = Some(Utc::now());
        started.status.error = (!errors.is_empty()).then(|| errors.join("; "));
        if let Err(e) = self.client.update_status(Object::from(started)).await {
            debug!(watch = %name, error = %e, "Could not record monitor start");
        }
        // Nothing watchable yet; a later pass tries again.
        if errors.len() == fw.spec.watched_paths.len() {
            if let Some(e) = last_error {
                return Err(Error::Notify(e));
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let ignores = IgnoreSet::new(&fw.spec.ignores);
        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        let task = tokio::spawn(async move {
            // The debouncer stops watching when dropped.
            let _debouncer = debouncer;
            run_watch(name, ignores, client, store, rx, stop_rx).await;
        });

        Ok(WatchHandle { stop_tx, task })
    }
}

async fn run_watch(
    name: String,
    ignores: IgnoreSet,
    client: Arc<dyn ObjectClient>,
    store: Arc<Store>,
    mut rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    info!(watch = %name, "Watching");
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            batch = rx.recv() => {
                let Some(paths) = batch else {
                    break;
                };
                let files = ignores.filter(paths);
                if files.is_empty() {
                    continue;
                }
                match record_event(client.as_ref(), &name, files).await {
                    Ok(()) => store.dispatch(Action::ObjectChanged {
                        kind: ObjectKind::FileWatch,
                        name: name.clone(),
                    }),
                    Err(e) => warn!(watch = %name, error = %e, "Failed to record file event"),
                }
            }
        }
    }
    debug!(watch = %name, "Watch stopped");
}

/// Append one event to the FileWatch status
pub async fn record_event(client: &dyn ObjectClient, name: &str, files: Vec<String>) -> Result<()> {
    let event = FileEvent::new(Utc::now(), files);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut fw = FileWatch::try_from(client.get(ObjectKind::FileWatch, name).await?)?;
        fw.status.file_events.push(event.clone());
        match client.update_status(Object::from(fw)).await {
            Ok(_) => return Ok(()),
            Err(Error::Conflict { .. }) if attempt < STATUS_WRITE_ATTEMPTS => continue,
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl Subscriber for FileWatcher {
    fn name(&self) -> &str {
        "file-watcher"
    }

    #[instrument(skip_all, name = "file_watcher")]
    async fn on_change(
        &mut self,
        ctx: &PassContext,
        _store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if ctx.is_cancelled() {
            self.stop_all().await;
            return Err(Error::Cancelled);
        }
        if summary.is_log_only() {
            return Ok(());
        }

        let listed = self
            .client
            .list(ObjectKind::FileWatch, &LabelSelector::everything())
            .await?;
        let mut desired: HashMap<String, FileWatch> = HashMap::new();
        for obj in listed {
            let fw = FileWatch::try_from(obj)?;
            desired.insert(fw.name().to_string(), fw);
        }

        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|(name, active)| desired.get(*name).map(|fw| &fw.spec) != Some(&active.spec))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(active) = self.active.remove(&name) {
                debug!(watch = %name, "Stopping watch");
                active.handle.stop().await;
            }
        }

        for (name, fw) in desired {
            if self.active.contains_key(&name) {
                continue;
            }
            let handle = match self.start(&fw).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(watch = %name, error = %e, "Failed to start watch");
                    continue;
                }
            };
            self.active.insert(
                name,
                ActiveWatch {
                    spec: fw.spec,
                    handle,
                },
            );
        }
        Ok(())
    }
}
