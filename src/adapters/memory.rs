//! In-memory object store.
//!
//! Thread-safe, versioned, label-selectable. Used by the `run` command and
//! by tests, which can also inject failures, simulate a warm-up period and,
//! on a [`MemoryClient::recording`] client, inspect every call made against
//! the store.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tracing::trace;

use crate::domain::{LabelSelector, Object, ObjectKind};
use crate::error::{Error, Result};

use super::ObjectClient;

/// Operation recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOp {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl ClientOp {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Get | Self::List)
    }
}

/// One call made against the store; `name` is empty for lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCall {
    pub op: ClientOp,
    pub kind: ObjectKind,
    pub name: String,
}

#[derive(Debug, Clone)]
struct Fault {
    op: ClientOp,
    kind: ObjectKind,
    name: String,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(ObjectKind, String), Object>,
    last_version: u64,
    warmup_remaining: u32,
    faults: Vec<Fault>,
    record_calls: bool,
    calls: Vec<ClientCall>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    fn record(&mut self, op: ClientOp, kind: ObjectKind, name: &str) -> Result<()> {
        if self.record_calls {
            self.calls.push(ClientCall {
                op,
                kind,
                name: name.to_string(),
            });
        }
        let injected = self
            .faults
            .iter()
            .any(|f| f.op == op && f.kind == kind && f.name == name);
        if injected {
            return Err(Error::Injected(format!("{:?} {}/{}", op, kind, name)));
        }
        Ok(())
    }

    fn check_version(&self, obj: &Object, stored: &Object) -> Result<()> {
        if obj.meta().resource_version != stored.meta().resource_version {
            return Err(Error::Conflict {
                kind: obj.kind(),
                name: obj.name().to_string(),
                expected: obj.meta().resource_version.clone(),
            });
        }
        Ok(())
    }
}

/// Object store kept in process memory
#[derive(Default)]
pub struct MemoryClient {
    inner: Mutex<Inner>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client that keeps a log of every get, list and write.
    ///
    /// The log is never drained on its own; use [`Self::clear_calls`].
    pub fn recording() -> Self {
        let client = Self::default();
        client.lock().record_calls = true;
        client
    }

    /// Fail the first `lists` list calls with `NotReady`
    pub fn with_warmup(self, lists: u32) -> Self {
        self.lock().warmup_remaining = lists;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `op` on `kind`/`name` fail until [`Self::clear_faults`]
    pub fn fail_on(&self, op: ClientOp, kind: ObjectKind, name: impl Into<String>) {
        self.lock().faults.push(Fault {
            op,
            kind,
            name: name.into(),
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Store an object directly, bypassing the call log
    pub fn seed(&self, mut obj: Object) -> Object {
        let mut inner = self.lock();
        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version);
        meta.creation_timestamp.get_or_insert_with(Utc::now);
        inner
            .objects
            .insert((obj.kind(), obj.name().to_string()), obj.clone());
        obj
    }

    /// Current copy of an object, without recording a call
    pub fn peek(&self, kind: ObjectKind, name: &str) -> Option<Object> {
        self.lock().objects.get(&(kind, name.to_string())).cloned()
    }

    /// Every stored object of `kind`, regardless of labels
    pub fn all(&self, kind: ObjectKind) -> Vec<Object> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Recorded calls; always empty unless built with [`Self::recording`]
    pub fn calls(&self) -> Vec<ClientCall> {
        self.lock().calls.clone()
    }

    /// Recorded create/update/delete calls
    pub fn writes(&self) -> Vec<ClientCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl ObjectClient for MemoryClient {
    async fn get(&self, kind: ObjectKind, name: &str) -> Result<Object> {
        let mut inner = self.lock();
        inner.record(ClientOp::Get, kind, name)?;
        inner
            .objects
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn list(&self, kind: ObjectKind, selector: &LabelSelector) -> Result<Vec<Object>> {
        let mut inner = self.lock();
        inner.record(ClientOp::List, kind, "")?;
        if inner.warmup_remaining > 0 {
            inner.warmup_remaining -= 1;
            return Err(Error::NotReady(format!("{} cache not started", kind)));
        }
        Ok(inner
            .objects
            .iter()
            .filter(|((k, _), o)| *k == kind && selector.matches(&o.meta().labels))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, mut obj: Object) -> Result<Object> {
        let mut inner = self.lock();
        let kind = obj.kind();
        let name = obj.name().to_string();
        inner.record(ClientOp::Create, kind, &name)?;
        if inner.objects.contains_key(&(kind, name.clone())) {
            return Err(Error::AlreadyExists { kind, name });
        }

        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version);
        meta.creation_timestamp = Some(Utc::now());
        trace!(kind = %kind, name = %name, "Created");
        inner.objects.insert((kind, name), obj.clone());
        Ok(obj)
    }

    async fn update(&self, obj: Object) -> Result<Object> {
        let mut inner = self.lock();
        let kind = obj.kind();
        let name = obj.name().to_string();
        inner.record(ClientOp::Update, kind, &name)?;

        let Some(stored) = inner.objects.get(&(kind, name.clone())) else {
            return Err(Error::NotFound { kind, name });
        };
        inner.check_version(&obj, stored)?;

        let mut updated = stored.clone();
        updated.take_spec_from(&obj);
        {
            let meta = updated.meta_mut();
            meta.labels = obj.meta().labels.clone();
            meta.annotations = obj.meta().annotations.clone();
            meta.owner_references = obj.meta().owner_references.clone();
        }
        let version = inner.next_version();
        updated.meta_mut().resource_version = Some(version);
        trace!(kind = %kind, name = %name, "Updated");
        inner.objects.insert((kind, name), updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, obj: Object) -> Result<Object> {
        let mut inner = self.lock();
        let kind = obj.kind();
        let name = obj.name().to_string();
        inner.record(ClientOp::UpdateStatus, kind, &name)?;

        let Some(stored) = inner.objects.get(&(kind, name.clone())) else {
            return Err(Error::NotFound { kind, name });
        };
        inner.check_version(&obj, stored)?;

        let mut updated = stored.clone();
        updated.take_status_from(&obj);
        let version = inner.next_version();
        updated.meta_mut().resource_version = Some(version);
        inner.objects.insert((kind, name), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, obj: &Object) -> Result<()> {
        let mut inner = self.lock();
        let kind = obj.kind();
        let name = obj.name().to_string();
        inner.record(ClientOp::Delete, kind, &name)?;
        match inner.objects.remove(&(kind, name.clone())) {
            Some(_) => {
                trace!(kind = %kind, name = %name, "Deleted");
                Ok(())
            }
            None => Err(Error::NotFound { kind, name }),
        }
    }
}
