//! Scanner kubehub: discovery, scan-type expansion and the per-kind watch loop

#![forbid(unsafe_code)]

pub mod controller;
pub mod discovery;
pub mod expand;
pub mod queue;

pub use controller::{api_resource, drive, run_controller, Reconciler};
pub use discovery::{
    CachedDiscovery, Discovery, DiscoveryApi, DiscoveryError, GroupVersionResource, KubeDiscoveryApi, ServedGroup,
    ServedResource,
};
pub use expand::{expand, resolve_scan_type, ExpandError};
pub use queue::WorkQueue;

use anyhow::{Context, Result};
use kube::Client;
use scanner_core::{ScanType, WatchTarget};
use tracing::info;

/// Connect discovery to the cluster and expand the configured scan types.
pub async fn discover_targets(client: Client, types: &[ScanType]) -> Result<Vec<WatchTarget>> {
    let discovery = CachedDiscovery::new(KubeDiscoveryApi::new(client))
        .await
        .context("could not create discovery client")?;
    let targets = expand(types, &discovery).await.context("could not resolve scan types")?;
    for t in &targets {
        info!(gvk = %t.kind, namespaces = ?t.namespaces, "watching kind");
    }
    Ok(targets)
}
