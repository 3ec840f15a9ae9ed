//! Watch loop: one watcher per kind feeding a work queue drained by a bounded
//! pool of reconcile workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::ApiResource,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use scanner_core::{ObjectKey, ReconcileAction, ResourceKind};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;

/// Handles one notification; the returned action drives requeueing.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: ObjectKey) -> ReconcileAction;
}

pub fn api_resource(kind: &ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
    ApiResource::from_gvk_with_plural(&gvk, &kind.plural)
}

fn key_of(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectKey::new(obj.metadata.namespace.clone().unwrap_or_default(), name))
}

/// Run the watcher and the workers for one kind until `shutdown` flips to true.
pub async fn run_controller(
    client: Client,
    kind: ResourceKind,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (queue, rx) = WorkQueue::new();
    let queue = Arc::new(queue);
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource(&kind));

    let watch_queue = Arc::clone(&queue);
    let mut watch_shutdown = shutdown.clone();
    let gvk = kind.gvk_key();
    let watcher_handle = tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(gvk = %gvk, "watcher started");
        loop {
            tokio::select! {
                ev = stream.next() => match ev {
                    Some(Ok(watcher::Event::Applied(o))) | Some(Ok(watcher::Event::Deleted(o))) => {
                        if let Some(k) = key_of(&o) { watch_queue.add(k); }
                    }
                    Some(Ok(watcher::Event::Restarted(list))) => {
                        debug!(gvk = %gvk, count = list.len(), "watch restart");
                        for o in list.iter() {
                            if let Some(k) = key_of(o) { watch_queue.add(k); }
                        }
                    }
                    Some(Err(e)) => {
                        counter!("scanner_watch_errors_total").increment(1);
                        warn!(gvk = %gvk, error = %e, "watch error");
                    }
                    None => {
                        warn!(gvk = %gvk, "watcher stream ended");
                        break;
                    }
                },
                _ = watch_shutdown.changed() => break,
            }
        }
    });

    drive(queue, rx, reconciler, workers, shutdown).await;
    watcher_handle.abort();
    info!(gvk = %kind.gvk_key(), "controller stopped");
    Ok(())
}

/// Dispatch queued keys to at most `workers` concurrent reconciliations and
/// apply the returned actions. Returns once `shutdown` flips and in-flight
/// reconciliations have finished.
pub async fn drive(
    queue: Arc<WorkQueue>,
    mut rx: mpsc::UnboundedReceiver<ObjectKey>,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = workers.max(1);
    let permits = Arc::new(Semaphore::new(workers));
    loop {
        if *shutdown.borrow() {
            break;
        }
        let key = tokio::select! {
            k = rx.recv() => match k { Some(k) => k, None => break },
            res = shutdown.changed() => if res.is_err() { break } else { continue },
        };
        // Hold on to the key across unrelated shutdown-channel updates.
        let permit = loop {
            tokio::select! {
                p = Arc::clone(&permits).acquire_owned() => break p.ok(),
                res = shutdown.changed() => if res.is_err() || *shutdown.borrow() { break None },
            }
        };
        let Some(permit) = permit else { break };
        queue.start(&key);
        let queue = Arc::clone(&queue);
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let action = reconciler.reconcile(key.clone()).await;
            match action {
                ReconcileAction::Done => queue.forget(&key),
                ReconcileAction::RequeueAfter(after) => {
                    queue.forget(&key);
                    schedule(Arc::clone(&queue), key.clone(), after, shutdown);
                }
                ReconcileAction::Retry => {
                    let after = queue.backoff(&key);
                    debug!(key = %key, backoff_ms = after.as_millis() as u64, "retrying after backoff");
                    schedule(Arc::clone(&queue), key.clone(), after, shutdown);
                }
            }
            queue.finish(&key);
            drop(permit);
        });
    }
    // Wait for in-flight reconciliations so their events reach the pipeline.
    let _ = permits.acquire_many(workers as u32).await;
}

fn schedule(queue: Arc<WorkQueue>, key: ObjectKey, after: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => queue.add(key),
            _ = shutdown.changed() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Scripted {
        script: Mutex<HashMap<String, Vec<ReconcileAction>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(script: Vec<(&str, Vec<ReconcileAction>)>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().map(|(k, a)| (k.to_string(), a)).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
        }
    }

    #[async_trait::async_trait]
    impl Reconciler for Scripted {
        async fn reconcile(&self, key: ObjectKey) -> ReconcileAction {
            self.calls.lock().unwrap().push(key.name.clone());
            let mut script = self.script.lock().unwrap();
            let actions = script.get_mut(&key.name).unwrap();
            if actions.is_empty() { ReconcileAction::Done } else { actions.remove(0) }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn actions_drive_requeue_and_retry() {
        let (queue, rx) = WorkQueue::new();
        let queue = Arc::new(queue);
        let rec = Arc::new(Scripted::new(vec![
            ("done", vec![ReconcileAction::Done]),
            ("poll", vec![ReconcileAction::RequeueAfter(Duration::from_secs(60)), ReconcileAction::Done]),
            ("flaky", vec![ReconcileAction::Retry, ReconcileAction::Retry, ReconcileAction::Done]),
        ]));
        let (tx, shutdown) = watch::channel(false);
        let driver = tokio::spawn(drive(Arc::clone(&queue), rx, rec.clone(), 2, shutdown));

        for name in ["done", "poll", "flaky"] {
            queue.add(ObjectKey::new("default", name));
        }
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(rec.calls_for("done"), 1);
        assert_eq!(rec.calls_for("poll"), 2);
        assert_eq!(rec.calls_for("flaky"), 3);

        tx.send(true).unwrap();
        driver.await.unwrap();
    }

    struct Gated {
        open: tokio::sync::Notify,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Reconciler for Gated {
        async fn reconcile(&self, key: ObjectKey) -> ReconcileAction {
            self.calls.lock().unwrap().push(key.name.clone());
            if key.name == "slow" {
                self.open.notified().await;
            }
            ReconcileAction::Done
        }
    }

    #[tokio::test(start_paused = true)]
    async fn key_waiting_for_a_worker_survives_shutdown_channel_updates() {
        let (queue, rx) = WorkQueue::new();
        let queue = Arc::new(queue);
        let rec = Arc::new(Gated { open: tokio::sync::Notify::new(), calls: Mutex::new(Vec::new()) });
        let (tx, shutdown) = watch::channel(false);
        let driver = tokio::spawn(drive(Arc::clone(&queue), rx, rec.clone(), 1, shutdown));

        queue.add(ObjectKey::new("default", "slow"));
        queue.add(ObjectKey::new("default", "next"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*rec.calls.lock().unwrap(), vec!["slow".to_string()]);

        // "next" holds no permit yet; a non-stopping update must not drop it.
        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rec.open.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*rec.calls.lock().unwrap(), vec!["slow".to_string(), "next".to_string()]);

        tx.send(true).unwrap();
        driver.await.unwrap();
    }

    #[test]
    fn api_resource_uses_discovered_plural() {
        let kind = ResourceKind {
            group: "networking.k8s.io".into(),
            version: "v1".into(),
            kind: "Ingress".into(),
            plural: "ingresses".into(),
            namespaced: true,
            preferred_version: "v1".into(),
        };
        let ar = api_resource(&kind);
        assert_eq!(ar.plural, "ingresses");
        assert_eq!(ar.api_version, "networking.k8s.io/v1");
    }
}
