//! Scanner core types: scan rules, resolved kinds, upsert events and
//! the seams between reconciliation, batching and upload.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version selector meaning "every version the group serves".
pub const WILDCARD_VERSION: &str = "*";

/// Declarative rule selecting which resources to watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanType {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    /// Empty uses the group's preferred version; `"*"` selects all served versions.
    #[serde(default)]
    pub versions: Vec<String>,
    /// `None` scans every namespace, `Some(vec![])` skips all namespaced objects.
    #[serde(default)]
    pub namespaces: Option<Vec<String>>,
}

/// How a scan type picks versions for a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelection {
    Preferred,
    All,
    Explicit(Vec<String>),
}

impl ScanType {
    pub fn version_selection(&self) -> VersionSelection {
        if self.versions.is_empty() {
            VersionSelection::Preferred
        } else if self.versions.iter().any(|v| v == WILDCARD_VERSION) {
            VersionSelection::All
        } else {
            VersionSelection::Explicit(self.versions.clone())
        }
    }
}

/// A concrete kind served by the cluster, as resolved through discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
    /// The group's preferred version at discovery time.
    pub preferred_version: String,
}

impl ResourceKind {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// A resolved kind plus the namespace allow-list of the scan type(s) it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub kind: ResourceKind,
    pub namespaces: Option<Vec<String>>,
}

impl WatchTarget {
    /// Cluster-scoped objects (empty namespace) always pass.
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        if namespace.is_empty() {
            return true;
        }
        match &self.namespaces {
            None => true,
            Some(list) => list.iter().any(|n| n == namespace),
        }
    }
}

/// Notification key for one object of a watched kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Point-in-time snapshot (or deletion marker) of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertEvent {
    /// Raw object including `apiVersion`, `kind` and `metadata`.
    pub object: serde_json::Value,
    pub preferred_version: String,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Correlation id of the reconciliation that produced this event.
    pub request_id: String,
}

impl UpsertEvent {
    /// Stable identity used for failure bookkeeping: `metadata.uid` when set,
    /// otherwise [`UpsertEvent::name_key`].
    pub fn identity(&self) -> String {
        match self.meta_str("uid").filter(|u| !u.is_empty()) {
            Some(uid) => uid.to_string(),
            None => self.name_key(),
        }
    }

    /// `apiVersion/kind/namespace/name`; the only key a deletion marker has.
    pub fn name_key(&self) -> String {
        let api_version = self.object.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = self.object.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        format!(
            "{}/{}/{}/{}",
            api_version,
            kind,
            self.meta_str("namespace").unwrap_or(""),
            self.meta_str("name").unwrap_or("")
        )
    }

    pub fn is_deletion(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.object.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
    }
}

/// Events shipped to the backend as a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Correlation id sent with the outbound request.
    pub request_id: String,
    pub events: Vec<UpsertEvent>,
}

impl Batch {
    pub fn new(events: Vec<UpsertEvent>) -> Self {
        Self { request_id: Uuid::new_v4().to_string(), events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What the control loop should do after one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing further to do until the next notification.
    Done,
    /// Re-check after the poll interval.
    RequeueAfter(Duration),
    /// Retry with the control loop's backoff.
    Retry,
}

/// Failure to deliver a batch to the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("could not post resources: {0}")]
    Transport(String),
    #[error("got non-2xx HTTP code {code} with body {body}")]
    Status { code: u16, body: String },
    #[error("could not construct request body: {0}")]
    Encode(String),
    #[error("upload pipeline is closed")]
    Closed,
}

impl UploadError {
    /// Status code recorded in metrics; transport failures count as 0.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UploadError::Transport(_) => Some(0),
            UploadError::Status { code, .. } => Some(*code),
            UploadError::Encode(_) | UploadError::Closed => None,
        }
    }
}

/// Receives events produced by reconciliations.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Resolves once the event has been delivered (or failed to be).
    async fn upsert(&self, event: UpsertEvent) -> Result<(), UploadError>;
}

/// Ships a batch to the backend.
#[async_trait::async_trait]
pub trait Upload: Send + Sync {
    async fn send(&self, batch: Batch) -> Result<(), UploadError>;
}

pub mod prelude {
    pub use super::{
        Batch, EventSink, ObjectKey, ReconcileAction, ResourceKind, ScanType, Upload, UploadError, UpsertEvent,
        VersionSelection, WatchTarget,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(object: serde_json::Value) -> UpsertEvent {
        UpsertEvent { object, preferred_version: "v1".into(), deleted_at: None, request_id: "r".into() }
    }

    #[test]
    fn version_selection_modes() {
        let mut st = ScanType { api_groups: vec!["apps".into()], resources: vec!["deployments".into()], ..Default::default() };
        assert_eq!(st.version_selection(), VersionSelection::Preferred);
        st.versions = vec!["v1".into(), "*".into()];
        assert_eq!(st.version_selection(), VersionSelection::All);
        st.versions = vec!["v1beta1".into(), "v1".into()];
        assert_eq!(st.version_selection(), VersionSelection::Explicit(vec!["v1beta1".into(), "v1".into()]));
    }

    #[test]
    fn namespace_allow_list() {
        let kind = ResourceKind {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            plural: "pods".into(),
            namespaced: true,
            preferred_version: "v1".into(),
        };
        let all = WatchTarget { kind: kind.clone(), namespaces: None };
        assert!(all.allows_namespace("default"));

        let none = WatchTarget { kind: kind.clone(), namespaces: Some(vec![]) };
        assert!(!none.allows_namespace("default"));
        assert!(none.allows_namespace(""), "cluster-scoped objects are never filtered");

        let some = WatchTarget { kind, namespaces: Some(vec!["prod".into()]) };
        assert!(some.allows_namespace("prod"));
        assert!(!some.allows_namespace("dev"));
    }

    #[test]
    fn identity_prefers_uid() {
        let e = event(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p", "namespace": "ns", "uid": "abc"}}));
        assert_eq!(e.identity(), "abc");
        assert_eq!(e.name_key(), "v1/Pod/ns/p");

        let d = event(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "prod"}}));
        assert_eq!(d.identity(), "apps/v1/Deployment/prod/web");
    }

    #[test]
    fn api_version_for_core_group() {
        let k = ResourceKind {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
            plural: "configmaps".into(),
            namespaced: true,
            preferred_version: "v1".into(),
        };
        assert_eq!(k.api_version(), "v1");
        assert_eq!(k.gvk_key(), "v1/ConfigMap");
    }

    #[test]
    fn transport_errors_map_to_code_zero() {
        assert_eq!(UploadError::Transport("timeout".into()).status_code(), Some(0));
        assert_eq!(UploadError::Status { code: 503, body: String::new() }.status_code(), Some(503));
        assert_eq!(UploadError::Closed.status_code(), None);
    }
}
