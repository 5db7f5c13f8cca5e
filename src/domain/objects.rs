//! Typed API objects exchanged with the object store.
//!
//! Every kind is `{ meta, spec, status }`. Only the spec takes part in
//! reconciliation equality; metadata such as the resource version and
//! creation timestamp is volatile and assigned by the store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label marking objects generated by this engine
pub const LABEL_OWNER_KIND: &str = "steward.dev/owner-kind";

/// Owner label value for objects derived from the loaded configuration
pub const OWNER_KIND_CONFIG: &str = "config";

/// Label attributing an object to a manifest
pub const LABEL_MANIFEST: &str = "steward.dev/manifest";

/// Annotation naming the manifest an owned object was derived from
pub const ANNOTATION_MANIFEST: &str = "steward.dev/manifest";

/// Annotation carrying a log span id
pub const ANNOTATION_SPAN_ID: &str = "steward.dev/span-id";

/// Object kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    UiButton,
    FileWatch,
    KubernetesApply,
    ImageMap,
    ConfigMap,
}

impl ObjectKind {
    /// Kinds the owned-object reconciler creates from configuration
    pub const OWNED: [ObjectKind; 3] = [
        ObjectKind::KubernetesApply,
        ObjectKind::ImageMap,
        ObjectKind::FileWatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UiButton => "UIButton",
            Self::FileWatch => "FileWatch",
            Self::KubernetesApply => "KubernetesApply",
            Self::ImageMap => "ImageMap",
            Self::ConfigMap => "ConfigMap",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from an object to the logical object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

/// Metadata common to all objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    /// Opaque version token assigned by the store on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Owner reference of the given kind, if any
    pub fn owner(&self, kind: &str) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.kind == kind)
    }
}

/// Equality selector over labels (`key=value` for every entry)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(key.into(), value.into());
        Self { match_labels }
    }

    /// Selector for objects generated from configuration
    pub fn owned_by_config() -> Self {
        Self::from_label(LABEL_OWNER_KIND, OWNER_KIND_CONFIG)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Stamp the selector's labels onto a label map
    pub fn apply_to(&self, labels: &mut BTreeMap<String, String>) {
        for (k, v) in &self.match_labels {
            labels.insert(k.clone(), v.clone());
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        f.write_str(&parts.join(","))
    }
}

// ============================================================================
// UIButton
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiButtonSpec {
    #[serde(default)]
    pub text: String,

    /// Resource the button is displayed on
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiButtonStatus {
    #[serde(default)]
    pub last_clicked_at: Option<DateTime<Utc>>,
}

/// A user-actionable button recording when it was last clicked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiButton {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: UiButtonSpec,
    #[serde(default)]
    pub status: UiButtonStatus,
}

impl UiButton {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            ..Default::default()
        }
    }

    pub fn clicked_at(mut self, at: DateTime<Utc>) -> Self {
        self.status.last_clicked_at = Some(at);
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn last_clicked_at(&self) -> Option<DateTime<Utc>> {
        self.status.last_clicked_at
    }
}

// ============================================================================
// FileWatch
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWatchSpec {
    pub watched_paths: Vec<PathBuf>,

    /// Glob patterns; matching paths never produce events
    #[serde(default)]
    pub ignores: Vec<String>,
}

/// One batch of observed filesystem changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub time: DateTime<Utc>,
    pub seen_files: Vec<String>,
}

impl FileEvent {
    pub fn new<I, S>(time: DateTime<Utc>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            time,
            seen_files: files.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWatchStatus {
    /// Append-only, oldest first
    #[serde(default)]
    pub file_events: Vec<FileEvent>,

    #[serde(default)]
    pub monitor_start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error: Option<String>,
}

/// Ordered log of filesystem-change events for a set of paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileWatch {
    pub meta: ObjectMeta,
    pub spec: FileWatchSpec,
    #[serde(default)]
    pub status: FileWatchStatus,
}

impl FileWatch {
    pub fn new(name: impl Into<String>, spec: FileWatchSpec) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            spec,
            status: FileWatchStatus::default(),
        }
    }

    pub fn with_events(mut self, events: Vec<FileEvent>) -> Self {
        self.status.file_events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Time of the most recent event, across the whole log
    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.status.file_events.iter().map(|e| e.time).max()
    }
}

// ============================================================================
// KubernetesApply / ImageMap / ConfigMap
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesApplySpec {
    pub yaml: String,

    /// Image maps whose results are injected before applying
    #[serde(default)]
    pub image_maps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesApplyStatus {
    #[serde(default)]
    pub last_apply_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesApply {
    pub meta: ObjectMeta,
    pub spec: KubernetesApplySpec,
    #[serde(default)]
    pub status: KubernetesApplyStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMapSpec {
    /// Image reference selector
    pub selector: String,

    #[serde(default)]
    pub match_in_env_vars: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMapStatus {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMap {
    pub meta: ObjectMeta,
    pub spec: ImageMapSpec,
    #[serde(default)]
    pub status: ImageMapStatus,
}

/// Plain string document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

// ============================================================================
// Object - tagged variant over all kinds
// ============================================================================

/// Any object the store can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Object {
    UiButton(UiButton),
    FileWatch(FileWatch),
    KubernetesApply(KubernetesApply),
    ImageMap(ImageMap),
    ConfigMap(ConfigMap),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::UiButton(_) => ObjectKind::UiButton,
            Self::FileWatch(_) => ObjectKind::FileWatch,
            Self::KubernetesApply(_) => ObjectKind::KubernetesApply,
            Self::ImageMap(_) => ObjectKind::ImageMap,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::UiButton(o) => &o.meta,
            Self::FileWatch(o) => &o.meta,
            Self::KubernetesApply(o) => &o.meta,
            Self::ImageMap(o) => &o.meta,
            Self::ConfigMap(o) => &o.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::UiButton(o) => &mut o.meta,
            Self::FileWatch(o) => &mut o.meta,
            Self::KubernetesApply(o) => &mut o.meta,
            Self::ImageMap(o) => &mut o.meta,
            Self::ConfigMap(o) => &mut o.meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    /// Structural spec equality.
    ///
    /// Each kind compares only its desired-state fields. Metadata (resource
    /// version, timestamps, annotations) and status never count; objects of
    /// different kinds are never equal.
    pub fn spec_eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Self::UiButton(a), Self::UiButton(b)) => a.spec == b.spec,
            (Self::FileWatch(a), Self::FileWatch(b)) => a.spec == b.spec,
            (Self::KubernetesApply(a), Self::KubernetesApply(b)) => a.spec == b.spec,
            (Self::ImageMap(a), Self::ImageMap(b)) => a.spec == b.spec,
            // A ConfigMap has no spec/status split: its data is the spec.
            (Self::ConfigMap(a), Self::ConfigMap(b)) => a.data == b.data,
            _ => false,
        }
    }

    /// Replace this object's status with `other`'s, keeping our spec and metadata
    pub(crate) fn take_status_from(&mut self, other: &Object) {
        match (self, other) {
            (Self::UiButton(a), Self::UiButton(b)) => a.status = b.status.clone(),
            (Self::FileWatch(a), Self::FileWatch(b)) => a.status = b.status.clone(),
            (Self::KubernetesApply(a), Self::KubernetesApply(b)) => a.status = b.status.clone(),
            (Self::ImageMap(a), Self::ImageMap(b)) => a.status = b.status.clone(),
            _ => {}
        }
    }

    /// Replace this object's spec (and data) with `other`'s, keeping our status
    pub(crate) fn take_spec_from(&mut self, other: &Object) {
        match (self, other) {
            (Self::UiButton(a), Self::UiButton(b)) => a.spec = b.spec.clone(),
            (Self::FileWatch(a), Self::FileWatch(b)) => a.spec = b.spec.clone(),
            (Self::KubernetesApply(a), Self::KubernetesApply(b)) => a.spec = b.spec.clone(),
            (Self::ImageMap(a), Self::ImageMap(b)) => a.spec = b.spec.clone(),
            (Self::ConfigMap(a), Self::ConfigMap(b)) => a.data = b.data.clone(),
            _ => {}
        }
    }
}

macro_rules! object_conversions {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Object {
                fn from(o: $variant) -> Self {
                    Object::$variant(o)
                }
            }

            impl TryFrom<Object> for $variant {
                type Error = crate::error::Error;

                fn try_from(o: Object) -> Result<Self, Self::Error> {
                    match o {
                        Object::$variant(inner) => Ok(inner),
                        other => Err(crate::error::Error::WrongKind {
                            expected: ObjectKind::$variant,
                            actual: other.kind(),
                        }),
                    }
                }
            }
        )*
    };
}

object_conversions!(UiButton, FileWatch, KubernetesApply, ImageMap, ConfigMap);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_spec_eq_ignores_volatile_metadata() {
        let mut a = Object::from(FileWatch::new(
            "fw",
            FileWatchSpec {
                watched_paths: vec![PathBuf::from("/src")],
                ignores: vec![],
            },
        ));
        let mut b = a.clone();
        a.meta_mut().resource_version = Some("1".to_string());
        b.meta_mut().resource_version = Some("7".to_string());
        b.meta_mut().creation_timestamp = Some(t(0));
        assert!(a.spec_eq(&b));
    }

    #[test]
    fn test_spec_eq_ignores_status() {
        let a = Object::from(FileWatch::new("fw", FileWatchSpec::default()));
        let b = Object::from(
            FileWatch::new("fw", FileWatchSpec::default())
                .with_events(vec![FileEvent::new(t(1), ["a.txt"])]),
        );
        assert!(a.spec_eq(&b));
    }

    #[test]
    fn test_spec_eq_detects_spec_change_and_kind_mismatch() {
        let a = Object::from(ImageMap {
            meta: ObjectMeta::named("img"),
            spec: ImageMapSpec {
                selector: "gcr.io/fe".to_string(),
                match_in_env_vars: false,
            },
            ..Default::default()
        });
        let mut b = a.clone();
        if let Object::ImageMap(im) = &mut b {
            im.spec.match_in_env_vars = true;
        }
        assert!(!a.spec_eq(&b));

        let c = Object::from(ConfigMap {
            meta: ObjectMeta::named("img"),
            ..Default::default()
        });
        assert!(!a.spec_eq(&c));
    }

    #[test]
    fn test_last_event_time_is_max() {
        let fw = FileWatch::new("fw", FileWatchSpec::default()).with_events(vec![
            FileEvent::new(t(5), ["a"]),
            FileEvent::new(t(3), ["b"]),
        ]);
        assert_eq!(fw.last_event_time(), Some(t(5)));
        assert_eq!(FileWatch::default().last_event_time(), None);
    }

    #[test]
    fn test_label_selector() {
        let sel = LabelSelector::owned_by_config();
        let mut labels = BTreeMap::new();
        assert!(!sel.matches(&labels));
        sel.apply_to(&mut labels);
        assert!(sel.matches(&labels));
        assert!(LabelSelector::everything().matches(&BTreeMap::new()));
        assert_eq!(sel.to_string(), "steward.dev/owner-kind=config");
    }

    #[test]
    fn test_try_from_wrong_kind() {
        let obj = Object::from(UiButton::new("b"));
        let err = FileWatch::try_from(obj).unwrap_err();
        assert!(matches!(err, crate::error::Error::WrongKind { .. }));
    }
}
