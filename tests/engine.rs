//! Engine Integration Tests
//!
//! Runs every controller together over the in-memory object client and
//! process executor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use steward::adapters::{ExecutorCall, MemoryClient, MemoryExecutor, ObjectClient, ProcessExecutor};
use steward::cli::run::{assemble, bootstrap};
use steward::controllers::trigger_queue::in_trigger_queue;
use steward::domain::{
    Action, ConfigMap, KubernetesApply, LocalTarget, Manifest, Object, ObjectKind, RestartOnSpec,
    ServeCmd, UiButton, LABEL_OWNER_KIND,
};
use steward::{EngineConfig, Store};

struct Harness {
    store: Arc<Store>,
    client: Arc<MemoryClient>,
    executor: Arc<MemoryExecutor>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Harness {
    fn start(manifests: Vec<Manifest>, before: impl FnOnce(&Store)) -> Self {
        Self::start_with(MemoryClient::new(), manifests, before)
    }

    fn start_with(client: MemoryClient, manifests: Vec<Manifest>, before: impl FnOnce(&Store)) -> Self {
        let config = EngineConfig::default();
        let (store, rx) = Store::new();
        bootstrap(&store, manifests);
        before(&store);

        let client = Arc::new(client);
        let executor = Arc::new(MemoryExecutor::new());
        let engine = assemble(
            &config,
            Arc::clone(&store),
            client.clone() as Arc<dyn ObjectClient>,
            executor.clone() as Arc<dyn ProcessExecutor>,
        );

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(engine.run(rx, async {
            let _ = stopped.await;
        }));

        Self {
            store,
            client,
            executor,
            stop: Some(stop),
            task: Some(task),
        }
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("engine did not stop")
                .unwrap();
        }
    }

    fn trigger_queue(&self) -> Option<ConfigMap> {
        self.client
            .peek(ObjectKind::ConfigMap, "trigger-queue")
            .map(|o| ConfigMap::try_from(o).unwrap())
    }
}

/// Poll `check` until it holds, failing after five seconds
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn served(name: &str) -> Manifest {
    let mut m = Manifest::new(name);
    m.local = Some(LocalTarget {
        serve_cmd: ServeCmd {
            argv: vec!["./serve.sh".to_string()],
            ..Default::default()
        },
        readiness_probe: None,
    });
    m
}

fn applied(name: &str) -> Manifest {
    let mut m = Manifest::new(name);
    m.k8s_yaml = Some("kind: Deployment\n".to_string());
    m
}

#[tokio::test]
async fn test_initial_build_starts_server_and_applies_objects() {
    let h = Harness::start(vec![served("fe"), applied("be")], |_| {});

    eventually("fe-serve-1 to start", || {
        h.executor.calls() == vec![ExecutorCall::Create("fe-serve-1".to_string())]
    })
    .await;
    eventually("owned KubernetesApply", || {
        h.client.peek(ObjectKind::KubernetesApply, "be").is_some()
    })
    .await;
    eventually("empty published queue", || {
        h.trigger_queue().is_some_and(|cm| cm.data.is_empty())
    })
    .await;

    let ka = KubernetesApply::try_from(h.client.peek(ObjectKind::KubernetesApply, "be").unwrap()).unwrap();
    assert_eq!(ka.meta.labels.get(LABEL_OWNER_KIND).map(String::as_str), Some("config"));
    assert!(h.store.read(|s| s.cmds["fe-serve-1"].status.is_running()));

    h.shutdown().await;
}

#[tokio::test]
async fn test_button_click_restarts_server() {
    let mut fe = served("fe");
    fe.restart_on = Some(RestartOnSpec {
        file_watches: vec![],
        ui_buttons: vec!["fe-restart".to_string()],
    });
    let client = MemoryClient::new();
    client.seed(Object::from(UiButton::new("fe-restart")));
    let h = Harness::start_with(client, vec![fe], |_| {});

    eventually("fe-serve-1 to run", || {
        h.store
            .read(|s| s.cmds.get("fe-serve-1").is_some_and(|c| c.status.is_running()))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.client
        .seed(Object::from(UiButton::new("fe-restart").clicked_at(Utc::now())));
    h.store.dispatch(Action::ObjectChanged {
        kind: ObjectKind::UiButton,
        name: "fe-restart".to_string(),
    });

    eventually("fe-serve-2 to start", || {
        h.executor
            .calls()
            .contains(&ExecutorCall::Create("fe-serve-2".to_string()))
    })
    .await;

    // The old process is stopped before its replacement is created.
    let calls = h.executor.calls();
    let deleted = calls
        .iter()
        .position(|c| *c == ExecutorCall::Delete("fe-serve-1".to_string()))
        .unwrap();
    let created = calls
        .iter()
        .position(|c| *c == ExecutorCall::Create("fe-serve-2".to_string()))
        .unwrap();
    assert!(deleted < created);

    // The terminated Cmd was replaced in the store.
    h.store.read(|s| {
        assert!(!s.cmds.contains_key("fe-serve-1"));
        assert!(s.cmds.contains_key("fe-serve-2"));
    });

    h.shutdown().await;
}

#[tokio::test]
async fn test_disabled_manifest_is_evicted_not_built() {
    let h = Harness::start(vec![served("fe")], |store| {
        store.dispatch(Action::SetDisabled {
            name: "fe".to_string(),
            disabled: true,
        });
    });

    eventually("eviction log", || {
        h.store.read(|s| {
            s.logs
                .iter()
                .any(|e| e.message == "Will not build resource \"fe\": it is disabled")
        })
    })
    .await;
    eventually("published queue without fe", || {
        h.trigger_queue().is_some_and(|cm| !in_trigger_queue(&cm, "fe"))
    })
    .await;

    assert!(h.executor.calls().is_empty());
    assert!(h
        .store
        .read(|s| s.manifest_state("fe").unwrap().last_build_start_time.is_none()));

    h.shutdown().await;
}

#[tokio::test]
async fn test_not_ready_store_is_retried() {
    let h = Harness::start_with(MemoryClient::new().with_warmup(2), vec![applied("be")], |_| {});

    eventually("owned KubernetesApply after warm-up", || {
        h.client.peek(ObjectKind::KubernetesApply, "be").is_some()
    })
    .await;

    h.shutdown().await;
}
