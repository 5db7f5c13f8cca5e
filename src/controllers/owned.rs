//! Owned-object reconciler.
//!
//! One configuration load produces objects of several kinds. This module
//! keeps the object store in line with it: every generated object carries the
//! owner label, the existing set is always listed through the owner
//! selector, and the diff creates, updates or deletes only within that scope.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::adapters::ObjectClient;
use crate::config::RetryPolicy;
use crate::core::{ChangeSummary, PassContext, Store, Subscriber};
use crate::domain::{
    Action, FileWatch, FileWatchSpec, ImageMap, ImageMapSpec, KubernetesApply,
    KubernetesApplySpec, LabelSelector, Manifest, Object, ObjectKind, ObjectMeta,
    ANNOTATION_MANIFEST, ANNOTATION_SPAN_ID, LABEL_OWNER_KIND, OWNER_KIND_CONFIG,
};
use crate::error::{AggregateError, ApplyOp, Error, Result};

/// Objects grouped by kind, then by name
pub type ObjectSet = BTreeMap<ObjectKind, BTreeMap<String, Object>>;

/// Add `obj` to `set`, replacing any object of the same kind and name
pub fn insert_object(set: &mut ObjectSet, obj: Object) {
    set.entry(obj.kind())
        .or_default()
        .insert(obj.name().to_string(), obj);
}

/// Lowercase, with anything outside `[a-z0-9.-]` replaced by `-`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn owned_meta(name: impl Into<String>) -> ObjectMeta {
    ObjectMeta::named(name).with_label(LABEL_OWNER_KIND, OWNER_KIND_CONFIG)
}

fn kubernetes_apply_objects(manifests: &[Manifest]) -> BTreeMap<String, Object> {
    let mut result = BTreeMap::new();
    for m in manifests {
        let Some(yaml) = &m.k8s_yaml else {
            continue;
        };
        let ka = KubernetesApply {
            meta: owned_meta(&m.name)
                .with_annotation(ANNOTATION_MANIFEST, &m.name)
                .with_annotation(ANNOTATION_SPAN_ID, format!("kubernetesapply:{}", m.name)),
            spec: KubernetesApplySpec {
                yaml: yaml.clone(),
                image_maps: m
                    .image_targets
                    .iter()
                    .map(|it| sanitize_name(&it.image_ref))
                    .collect(),
            },
            ..Default::default()
        };
        result.insert(m.name.clone(), Object::from(ka));
    }
    result
}

fn image_map_objects(manifests: &[Manifest]) -> BTreeMap<String, Object> {
    let mut result = BTreeMap::new();
    for m in manifests {
        for it in &m.image_targets {
            // Shared between manifests, so no manifest attribution.
            let name = sanitize_name(&it.image_ref);
            let im = ImageMap {
                meta: owned_meta(&name),
                spec: ImageMapSpec {
                    selector: it.image_ref.clone(),
                    match_in_env_vars: it.match_in_env_vars,
                },
                ..Default::default()
            };
            result.insert(name, Object::from(im));
        }
    }
    result
}

fn file_watch_objects(manifests: &[Manifest]) -> BTreeMap<String, Object> {
    let mut result = BTreeMap::new();
    for m in manifests {
        let mut paths: Vec<PathBuf> = m.deps.clone();
        paths.extend(m.image_targets.iter().filter_map(|it| it.context.clone()));
        if paths.is_empty() {
            continue;
        }
        paths.sort();
        paths.dedup();

        let name = m.file_watch_name();
        let mut fw = FileWatch::new(
            name.clone(),
            FileWatchSpec {
                watched_paths: paths,
                ignores: m.ignores.clone(),
            },
        );
        fw.meta = owned_meta(&name).with_annotation(ANNOTATION_MANIFEST, &m.name);
        result.insert(name, Object::from(fw));
    }
    result
}

/// Everything the given manifests should produce in the object store
pub fn desired_objects(manifests: &[Manifest]) -> ObjectSet {
    let mut set = ObjectSet::new();
    set.insert(ObjectKind::KubernetesApply, kubernetes_apply_objects(manifests));
    set.insert(ObjectKind::ImageMap, image_map_objects(manifests));
    set.insert(ObjectKind::FileWatch, file_watch_objects(manifests));
    set
}

/// List every owned kind through the owner selector
pub async fn existing_objects(client: &dyn ObjectClient) -> Result<ObjectSet> {
    let selector = LabelSelector::owned_by_config();
    let mut set = ObjectSet::new();
    for kind in ObjectKind::OWNED {
        let items = client.list(kind, &selector).await?;
        let typed = set.entry(kind).or_default();
        for obj in items {
            typed.insert(obj.name().to_string(), obj);
        }
    }
    Ok(set)
}

/// Outcome of one diff-and-apply pass
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: Vec<(ObjectKind, String)>,
    pub updated: Vec<(ObjectKind, String)>,
    pub deleted: Vec<(ObjectKind, String)>,
    pub errors: AggregateError,
}

impl ApplyReport {
    /// Every write that went through
    pub fn changes(&self) -> impl Iterator<Item = &(ObjectKind, String)> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .chain(self.deleted.iter())
    }

    pub fn is_noop(&self) -> bool {
        self.changes().next().is_none() && self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        self.errors.into_result()
    }
}

/// Reconcile `desired` against `existing`.
///
/// Every mismatched entry is attempted; failures are collected rather than
/// returned early. Existing objects without the owner label are invisible
/// here, and desired objects without it are refused.
pub async fn update_objects(
    ctx: &PassContext,
    client: &dyn ObjectClient,
    desired: &ObjectSet,
    existing: &ObjectSet,
) -> ApplyReport {
    let owner = LabelSelector::owned_by_config();
    let mut report = ApplyReport::default();

    for (kind, objects) in desired {
        for (name, obj) in objects {
            if let Err(e) = ctx.check() {
                report.errors.push(e);
                return report;
            }
            if !owner.matches(&obj.meta().labels) {
                report.errors.push(Error::NotOwned {
                    kind: *kind,
                    name: name.clone(),
                });
                continue;
            }

            let old = existing
                .get(kind)
                .and_then(|s| s.get(name))
                .filter(|o| owner.matches(&o.meta().labels));
            match old {
                None => match client.create(obj.clone()).await {
                    Ok(_) => report.created.push((*kind, name.clone())),
                    Err(e) => report
                        .errors
                        .push(Error::apply(ApplyOp::Create, *kind, name, e)),
                },
                Some(old) if !old.spec_eq(obj) => {
                    let mut obj = obj.clone();
                    obj.meta_mut().resource_version = old.meta().resource_version.clone();
                    match client.update(obj).await {
                        Ok(_) => report.updated.push((*kind, name.clone())),
                        Err(e) => report
                            .errors
                            .push(Error::apply(ApplyOp::Update, *kind, name, e)),
                    }
                }
                Some(_) => {}
            }
        }
    }

    for (kind, objects) in existing {
        for (name, obj) in objects {
            let wanted = desired
                .get(kind)
                .map(|s| s.contains_key(name))
                .unwrap_or(false);
            if wanted {
                continue;
            }
            if !owner.matches(&obj.meta().labels) {
                debug!(kind = %kind, name = %name, "Skipping object without owner label");
                continue;
            }
            if let Err(e) = ctx.check() {
                report.errors.push(e);
                return report;
            }
            match client.delete(obj).await {
                Ok(()) => report.deleted.push((*kind, name.clone())),
                Err(e) => report
                    .errors
                    .push(Error::apply(ApplyOp::Delete, *kind, name, e)),
            }
        }
    }

    report
}

/// Bring the owned objects in line with `manifests`.
///
/// Listing the existing set is retried while the store reports it is not
/// ready; any other listing failure fails the pass.
#[instrument(skip_all, fields(manifests = manifests.len()))]
pub async fn update_owned_objects(
    ctx: &PassContext,
    client: &dyn ObjectClient,
    manifests: &[Manifest],
    retry: RetryPolicy,
) -> Result<ApplyReport> {
    let desired = desired_objects(manifests);

    let mut retries = 0u32;
    let existing = loop {
        match existing_objects(client).await {
            Ok(set) => break set,
            Err(e) if e.is_not_ready() && retry.should_retry(retries) => {
                retries += 1;
                debug!(attempt = retries, error = %e, "Object store not ready, retrying");
                tokio::time::sleep(retry.delay).await;
                ctx.check()?;
            }
            Err(e) => return Err(e),
        }
    };

    Ok(update_objects(ctx, client, &desired, &existing).await)
}

/// Subscriber running the owned-object reconciler on configuration changes
pub struct OwnedObjectsController {
    client: Arc<dyn ObjectClient>,
    retry: RetryPolicy,
    last_generation: Option<u64>,
    needs_retry: bool,
}

impl OwnedObjectsController {
    pub fn new(client: Arc<dyn ObjectClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            last_generation: None,
            needs_retry: false,
        }
    }
}

#[async_trait]
impl Subscriber for OwnedObjectsController {
    fn name(&self) -> &str {
        "owned-objects"
    }

    #[instrument(skip_all, name = "owned_objects")]
    async fn on_change(
        &mut self,
        ctx: &PassContext,
        store: &Store,
        summary: ChangeSummary,
    ) -> Result<()> {
        if summary.is_log_only() {
            return Ok(());
        }

        let (generation, manifests) = store.read(|s| (s.config_generation, s.manifests()));
        if generation == 0 {
            // Nothing loaded yet.
            return Ok(());
        }
        if self.last_generation == Some(generation) && !self.needs_retry {
            return Ok(());
        }
        self.last_generation = Some(generation);

        let report = match update_owned_objects(ctx, self.client.as_ref(), &manifests, self.retry).await {
            Ok(report) => report,
            Err(e) => {
                self.needs_retry = true;
                return Err(e);
            }
        };

        if !report.is_noop() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                failed = report.errors.len(),
                "Owned objects reconciled"
            );
        }
        for (kind, name) in report.changes() {
            store.dispatch(Action::ObjectChanged {
                kind: *kind,
                name: name.clone(),
            });
        }

        self.needs_retry = !report.errors.is_empty();
        if self.needs_retry {
            warn!(errors = report.errors.len(), "Owned object pass partially failed");
        }
        report.into_result()
    }
}
