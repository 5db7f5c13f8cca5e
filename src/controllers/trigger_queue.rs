//! Trigger queue publisher.
//!
//! Evicts disabled manifests from the trigger queue and publishes the queue
//! as a single ConfigMap:
//!
//! ```text
//! 0-name: fe          0-reasonCode: 16
//! 1-name: be          1-reasonCode: 8
//! ```
//!
//! Positions are 0-indexed and contiguous. The document is only written when
//! its data differs from what this publisher wrote last.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::adapters::ObjectClient;
use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{
    Action, BuildReason, ConfigMap, EngineState, LogLevel, Object, ObjectKind, ObjectMeta,
};
use crate::error::Result;

fn name_key(i: usize) -> String {
    format!("{}-name", i)
}

fn reason_key(i: usize) -> String {
    format!("{}-reasonCode", i)
}

/// Published representation of the queue in `state`
pub fn from_state(state: &EngineState, document_name: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    for (i, entry) in state.trigger_queue.iter().enumerate() {
        data.insert(name_key(i), entry.manifest_name.clone());
        data.insert(reason_key(i), entry.reason.code().to_string());
    }
    ConfigMap {
        meta: ObjectMeta::named(document_name),
        data,
    }
}

fn position(cm: &ConfigMap, name: &str) -> Option<usize> {
    (0..)
        .map_while(|i| cm.data.get(&name_key(i)).map(|n| (i, n)))
        .find(|(_, n)| n.as_str() == name)
        .map(|(i, _)| i)
}

/// Whether `name` appears in a published queue document
pub fn in_trigger_queue(cm: &ConfigMap, name: &str) -> bool {
    position(cm, name).is_some()
}

/// Reason `name` was queued; `None` when absent or unreadable
pub fn trigger_queue_reason(cm: &ConfigMap, name: &str) -> BuildReason {
    position(cm, name)
        .and_then(|i| cm.data.get(&reason_key(i)))
        .and_then(|code| code.parse().ok())
        .and_then(BuildReason::from_code)
        .unwrap_or_default()
}

/// Dispatch a removal (and an explanatory log line) for every queued,
/// disabled manifest.
///
/// The removals land on a later pass; this pass still sees them queued.
pub fn remove_disabled_manifests(store: &Store) -> usize {
    let disabled: Vec<String> = store.read(|state| {
        state
            .trigger_queue
            .iter()
            .filter(|e| state.is_disabled(&e.manifest_name))
            .map(|e| e.manifest_name.clone())
            .collect()
    });

    for name in &disabled {
        store.dispatch(Action::log(
            name.clone(),
            format!("unqueue:{}", name),
            LogLevel::Info,
            format!("Will not build resource {:?}: it is disabled", name),
        ));
        store.dispatch(Action::RemoveFromTriggerQueue { name: name.clone() });
    }
    disabled.len()
}

/// Subscriber maintaining the published trigger queue document
pub struct TriggerQueuePublisher {
    client: Arc<dyn ObjectClient>,
    document_name: String,
    last_published: Option<BTreeMap<String, String>>,
}

impl TriggerQueuePublisher {
    pub fn new(client: Arc<dyn ObjectClient>, document_name: impl Into<String>) -> Self {
        Self {
            client,
            document_name: document_name.into(),
            last_published: None,
        }
    }

    /// Create the document, or update it in place if it exists
    async fn upsert(&self, desired: ConfigMap) -> Result<()> {
        match self
            .client
            .get(ObjectKind::ConfigMap, &self.document_name)
            .await
        {
            Ok(existing) => {
                let mut cm = ConfigMap::try_from(existing)?;
                cm.data = desired.data;
                self.client.update(Object::from(cm)).await?;
            }
            Err(e) if e.is_not_found() => {
                self.client.create(Object::from(desired)).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for TriggerQueuePublisher {
    fn name(&self) -> &str {
        "trigger-queue"
    }

    #[instrument(skip_all, name = "trigger_queue")]
    async fn on_change(
        &mut self,
        _ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() {
            return Ok(());
        }

        let evicted = remove_disabled_manifests(store);
        if evicted > 0 {
            debug!(evicted, "Evicting disabled manifests");
        }

        let cm = store.read(|state| from_state(state, &self.document_name));
        if self.last_published.as_ref() == Some(&cm.data) {
            return Ok(());
        }

        let data = cm.data.clone();
        self.upsert(cm).await?;
        debug!(entries = data.len() / 2, "Published trigger queue");
        self.last_published = Some(data);
        Ok(())
    }
}
