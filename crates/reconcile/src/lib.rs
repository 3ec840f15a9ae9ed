//! Scanner reconcile: turns one object notification into an upsert or
//! deletion event and hands it to the upload pipeline.
//!
//! The adapter keeps no state between invocations. The decision steps are
//! plain functions ([`admit`], [`classify`], [`after_upsert`]) so they can be
//! exercised without a control loop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::{
    api::Api,
    core::DynamicObject,
    discovery::ApiResource,
    Client,
};
use metrics::counter;
use scanner_core::{EventSink, ObjectKey, ReconcileAction, ResourceKind, UploadError, UpsertEvent, WatchTarget};
use scanner_kubehub::{api_resource, Reconciler};
use serde_json::{json, Value as Json};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("could not get referenced object {key}: {message}")]
    Transient { key: String, message: String },
}

/// Live cluster state for one kind.
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, FetchError>;
}

pub struct KubeObjectSource {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeObjectSource {
    pub fn new(client: Client, kind: &ResourceKind) -> Self {
        Self { client, resource: api_resource(kind), namespaced: kind.namespaced }
    }
}

#[async_trait::async_trait]
impl ObjectSource for KubeObjectSource {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, FetchError> {
        let api: Api<DynamicObject> = if self.namespaced && !key.namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), &key.namespace, &self.resource)
        } else {
            Api::all_with(self.client.clone(), &self.resource)
        };
        let transient = |message: String| FetchError::Transient { key: key.to_string(), message };
        match api.get_opt(&key.name).await {
            Ok(Some(obj)) => serde_json::to_value(&obj).map(Some).map_err(|e| transient(e.to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(transient(e.to_string())),
        }
    }
}

/// Whether a notification passes the namespace allow-list.
pub fn admit(target: &WatchTarget, key: &ObjectKey) -> bool {
    target.allows_namespace(&key.namespace)
}

/// Turn a fetch result into the event to publish. A missing object becomes a
/// deletion marker carrying only its name and namespace.
pub fn classify(
    target: &WatchTarget,
    key: &ObjectKey,
    fetched: Result<Option<Json>, FetchError>,
    request_id: String,
    now: DateTime<Utc>,
) -> Result<UpsertEvent, FetchError> {
    let preferred_version = target.kind.preferred_version.clone();
    match fetched? {
        Some(object) => Ok(UpsertEvent { object, preferred_version, deleted_at: None, request_id }),
        None => Ok(UpsertEvent {
            object: deletion_placeholder(&target.kind, key),
            preferred_version,
            deleted_at: Some(now),
            request_id,
        }),
    }
}

fn deletion_placeholder(kind: &ResourceKind, key: &ObjectKey) -> Json {
    let mut metadata = json!({ "name": key.name });
    if !key.namespace.is_empty() {
        metadata["namespace"] = Json::String(key.namespace.clone());
    }
    json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind,
        "metadata": metadata,
    })
}

/// Control-loop instruction after handing an event to the sink.
pub fn after_upsert(result: &Result<(), UploadError>, requeue_after: Duration) -> ReconcileAction {
    match result {
        Ok(()) => ReconcileAction::RequeueAfter(requeue_after),
        Err(_) => ReconcileAction::Retry,
    }
}

/// Reconciler for one watched kind.
pub struct ScanReconciler {
    target: WatchTarget,
    source: Arc<dyn ObjectSource>,
    sink: Arc<dyn EventSink>,
    requeue_after: Duration,
}

impl ScanReconciler {
    pub fn new(
        target: WatchTarget,
        source: Arc<dyn ObjectSource>,
        sink: Arc<dyn EventSink>,
        requeue_after: Duration,
    ) -> Self {
        Self { target, source, sink, requeue_after }
    }

    async fn run(&self, key: ObjectKey, request_id: String) -> ReconcileAction {
        info!("reconciling resource");
        if !admit(&self.target, &key) {
            debug!("skipping resource as namespace is ignored");
            return ReconcileAction::Done;
        }

        let fetched = self.source.get(&key).await;
        let event = match classify(&self.target, &key, fetched, request_id, Utc::now()) {
            Ok(ev) => ev,
            Err(e) => {
                counter!("scanner_reconcile_errors_total", "stage" => "fetch").increment(1);
                error!(error = %e, "could not get object from api server");
                return ReconcileAction::Retry;
            }
        };

        let deletion = event.is_deletion();
        let identity = event.identity();
        let result = self.sink.upsert(event).await;
        match &result {
            Ok(()) if deletion => info!(identity = %identity, "published deletion"),
            Ok(()) => info!(uid = %identity, "successful reconciliation"),
            Err(e) => {
                counter!("scanner_reconcile_errors_total", "stage" => "upload").increment(1);
                error!(uid = %identity, deletion, error = %e, "could not publish to backend");
            }
        }
        after_upsert(&result, self.requeue_after)
    }
}

#[async_trait::async_trait]
impl Reconciler for ScanReconciler {
    async fn reconcile(&self, key: ObjectKey) -> ReconcileAction {
        let request_id = Uuid::new_v4().to_string();
        let kind = &self.target.kind;
        let span = info_span!(
            "reconcile",
            group = %kind.group,
            version = %kind.version,
            kind = %kind.kind,
            name = %key.name,
            namespace = %key.namespace,
            request_id = %request_id,
        );
        self.run(key, request_id).instrument(span).await
    }
}
