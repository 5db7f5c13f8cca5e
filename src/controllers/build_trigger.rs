//! Queues builds when a manifest's restart/start dependencies fire.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::adapters::ObjectClient;
use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{Action, BuildReason, RestartOnSpec, StartOnSpec};
use crate::error::Result;

use super::restarton::{
    files_changed, last_restart_event, last_start_event, resolve_buttons, resolve_file_watches,
};

/// What a manifest's dependencies say about the next build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    pub at: DateTime<Utc>,
    pub reason: BuildReason,
    pub files: Vec<String>,
}

struct Candidate {
    name: String,
    restart_on: Option<RestartOnSpec>,
    start_on: Option<StartOnSpec>,
    last_build_start: Option<DateTime<Utc>>,
}

/// Subscriber turning button clicks and file events into trigger queue entries
pub struct BuildTriggerController {
    client: Arc<dyn ObjectClient>,
    last_triggered: HashMap<String, DateTime<Utc>>,
}

impl BuildTriggerController {
    pub fn new(client: Arc<dyn ObjectClient>) -> Self {
        Self {
            client,
            last_triggered: HashMap::new(),
        }
    }

    /// Resolve dependencies and compute the latest trigger, if it is newer
    /// than the last build start
    async fn evaluate(&self, c: &Candidate) -> Result<Option<TriggerDecision>> {
        let client = self.client.as_ref();
        let buttons = resolve_buttons(client, c.restart_on.as_ref(), c.start_on.as_ref()).await?;
        let file_watches = resolve_file_watches(client, c.restart_on.as_ref()).await?;

        let (start_at, start_button) = last_start_event(c.start_on.as_ref(), &buttons);
        let (restart_at, restart_button) =
            last_restart_event(c.restart_on.as_ref(), &file_watches, &buttons);
        let (latest, button) = if restart_at > start_at {
            (restart_at, restart_button)
        } else {
            (start_at, start_button)
        };

        let Some(at) = latest else {
            return Ok(None);
        };
        if latest <= c.last_build_start {
            return Ok(None);
        }

        let reason = if button.is_some() {
            BuildReason::TriggerWeb
        } else {
            BuildReason::ChangedFiles
        };
        let files = c
            .restart_on
            .as_ref()
            .map(|r| files_changed(r, &file_watches, c.last_build_start))
            .unwrap_or_default();
        Ok(Some(TriggerDecision { at, reason, files }))
    }
}

#[async_trait]
impl Subscriber for BuildTriggerController {
    fn name(&self) -> &str {
        "build-trigger"
    }

    #[instrument(skip_all, name = "build_trigger")]
    async fn on_change(
        &mut self,
        ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() {
            return Ok(());
        }

        let candidates: Vec<Candidate> = store.read(|state| {
            state
                .targets()
                .filter_map(|mt| {
                    let restart_on = mt.manifest.effective_restart_on();
                    let start_on = mt.manifest.start_on.clone();
                    if restart_on.is_none() && start_on.is_none() {
                        return None;
                    }
                    Some(Candidate {
                        name: mt.manifest.name.clone(),
                        restart_on,
                        start_on,
                        last_build_start: mt.state.last_build_start_time,
                    })
                })
                .collect()
        });

        for c in &candidates {
            ctx.check()?;
            let decision = match self.evaluate(c).await {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) if e.is_not_found() => {
                    debug!(manifest = %c.name, error = %e, "Trigger dependency not created yet");
                    continue;
                }
                Err(e) => {
                    warn!(manifest = %c.name, error = %e, "Cannot resolve trigger dependencies");
                    continue;
                }
            };

            if self
                .last_triggered
                .get(&c.name)
                .is_some_and(|prev| *prev >= decision.at)
            {
                continue;
            }
            self.last_triggered.insert(c.name.clone(), decision.at);

            info!(
                manifest = %c.name,
                reason = %decision.reason,
                files = decision.files.len(),
                "Queueing build"
            );
            store.dispatch(Action::AppendToTriggerQueue {
                name: c.name.clone(),
                reason: decision.reason,
                files: decision.files,
            });
        }

        let known: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        self.last_triggered
            .retain(|name, _| known.contains(&name.as_str()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryClient;
    use crate::core::ActionReceiver;
    use crate::domain::{FileEvent, FileWatch, FileWatchSpec, Manifest, Object, ObjectKind, UiButton};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record_at(client: &MemoryClient, name: &str, at: DateTime<Utc>, files: &[&str]) {
        let mut fw = FileWatch::try_from(client.peek(ObjectKind::FileWatch, name).unwrap()).unwrap();
        fw.status.file_events.push(FileEvent::new(at, files.iter().copied()));
        client.seed(Object::from(fw));
    }

    fn manifest_with_deps() -> Manifest {
        let mut m = Manifest::new("fe");
        m.deps.push(PathBuf::from("/src/fe"));
        m.restart_on = Some(RestartOnSpec {
            file_watches: vec![],
            ui_buttons: vec!["fe-restart".to_string()],
        });
        m
    }

    fn setup(client: &Arc<MemoryClient>) -> (Arc<Store>, ActionReceiver, BuildTriggerController) {
        let (store, rx) = Store::new();
        store.apply(Action::ConfigLoaded {
            manifests: vec![manifest_with_deps()],
        });
        let controller = BuildTriggerController::new(client.clone() as Arc<dyn ObjectClient>);
        (store, rx, controller)
    }

    async fn pass(c: &mut BuildTriggerController, store: &Store, rx: &mut ActionReceiver) -> Vec<Action> {
        c.on_change(&PassContext::background(), store, ChangeSummary::default())
            .await
            .unwrap();
        store.apply_pending(rx)
    }

    #[tokio::test]
    async fn test_missing_dependencies_skip_manifest() {
        let client = Arc::new(MemoryClient::new());
        let (store, mut rx, mut c) = setup(&client);
        assert!(pass(&mut c, &store, &mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_file_change_queues_build_once() {
        let client = Arc::new(MemoryClient::new());
        client.seed(Object::from(UiButton::new("fe-restart")));
        client.seed(Object::from(FileWatch::new("fe:update", FileWatchSpec::default())));
        let (store, mut rx, mut c) = setup(&client);

        assert!(pass(&mut c, &store, &mut rx).await.is_empty());

        record_at(&client, "fe:update", t(5), &["src/main.rs"]);
        let actions = pass(&mut c, &store, &mut rx).await;
        assert_eq!(
            actions,
            vec![Action::AppendToTriggerQueue {
                name: "fe".to_string(),
                reason: BuildReason::ChangedFiles,
                files: vec!["src/main.rs".to_string()],
            }]
        );

        // Same event: not queued again, even after the build consumed the entry.
        store.apply(Action::RemoveFromTriggerQueue {
            name: "fe".to_string(),
        });
        assert!(pass(&mut c, &store, &mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_button_click_is_a_web_trigger() {
        let client = Arc::new(MemoryClient::new());
        client.seed(Object::from(UiButton::new("fe-restart").clicked_at(t(9))));
        client.seed(Object::from(FileWatch::new("fe:update", FileWatchSpec::default())));
        record_at(&client, "fe:update", t(5), &["a"]);
        let (store, mut rx, mut c) = setup(&client);

        let actions = pass(&mut c, &store, &mut rx).await;
        match &actions[..] {
            [Action::AppendToTriggerQueue { reason, files, .. }] => {
                assert_eq!(*reason, BuildReason::TriggerWeb);
                assert_eq!(files, &vec!["a".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_before_last_build_are_ignored() {
        let client = Arc::new(MemoryClient::new());
        client.seed(Object::from(UiButton::new("fe-restart")));
        client.seed(Object::from(FileWatch::new("fe:update", FileWatchSpec::default())));
        record_at(&client, "fe:update", t(5), &["a"]);
        let (store, mut rx, mut c) = setup(&client);
        store.apply(Action::BuildStarted {
            name: "fe".to_string(),
            at: t(6),
        });

        assert!(pass(&mut c, &store, &mut rx).await.is_empty());

        record_at(&client, "fe:update", t(7), &["b"]);
        let actions = pass(&mut c, &store, &mut rx).await;
        match &actions[..] {
            [Action::AppendToTriggerQueue { files, .. }] => assert_eq!(files, &vec!["b".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_on_respects_start_after() {
        let client = Arc::new(MemoryClient::new());
        client.seed(Object::from(UiButton::new("go").clicked_at(t(1))));
        let (store, mut rx) = Store::new();
        let mut m = Manifest::new("job");
        m.start_on = Some(StartOnSpec {
            ui_buttons: vec!["go".to_string()],
            start_after: Some(t(2)),
        });
        store.apply(Action::ConfigLoaded { manifests: vec![m] });
        let mut c = BuildTriggerController::new(client.clone() as Arc<dyn ObjectClient>);

        assert!(pass(&mut c, &store, &mut rx).await.is_empty());

        client.seed(Object::from(UiButton::new("go").clicked_at(t(3))));
        let actions = pass(&mut c, &store, &mut rx).await;
        assert!(matches!(
            &actions[..],
            [Action::AppendToTriggerQueue {
                reason: BuildReason::TriggerWeb,
                ..
            }]
        ));
    }
}
