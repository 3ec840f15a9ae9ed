//! Scan-type expansion: declarative scan types to the concrete kinds to watch.

use scanner_core::{ResourceKind, ScanType, VersionSelection, WatchTarget};
use tracing::info;

use crate::discovery::{Discovery, DiscoveryError, GroupVersionResource};

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("could not get versions for group {group:?}: {source}")]
    Versions { group: String, source: DiscoveryError },
    #[error("could not get kind for {gvr}: {source}")]
    Kind { gvr: GroupVersionResource, source: DiscoveryError },
}

fn versions_for(st: &ScanType, group: &str, d: &dyn Discovery) -> Result<Vec<String>, DiscoveryError> {
    match st.version_selection() {
        VersionSelection::Preferred => Ok(vec![d.preferred_version(group)?]),
        VersionSelection::All => d.all_versions(group),
        VersionSelection::Explicit(versions) => Ok(versions),
    }
}

/// Resolve one scan type. Missing groups and missing resource/version pairs
/// are skipped; any other discovery failure aborts.
pub async fn resolve_scan_type(st: &ScanType, d: &dyn Discovery) -> Result<Vec<ResourceKind>, ExpandError> {
    let mut out = Vec::new();
    for group in &st.api_groups {
        let versions = match versions_for(st, group, d) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                info!(group = %group, "skipping group as it does not exist");
                continue;
            }
            Err(source) => return Err(ExpandError::Versions { group: group.clone(), source }),
        };
        for version in &versions {
            for resource in &st.resources {
                let gvr = GroupVersionResource::new(group.as_str(), version.as_str(), resource.as_str());
                match d.find_kind(&gvr).await {
                    Ok(kind) => out.push(kind),
                    Err(e) if e.is_not_found() => {
                        info!(group = %group, version = %version, resource = %resource,
                            "skipping resource as it does not exist within groupversion");
                    }
                    Err(source) => return Err(ExpandError::Kind { gvr, source }),
                }
            }
        }
    }
    Ok(out)
}

/// Deduplicated union of the kinds of all scan types. A kind selected by
/// several scan types watches the union of their namespaces; `None` (all
/// namespaces) wins over any list.
pub async fn expand(types: &[ScanType], d: &dyn Discovery) -> Result<Vec<WatchTarget>, ExpandError> {
    let mut targets: Vec<WatchTarget> = Vec::new();
    for st in types {
        for kind in resolve_scan_type(st, d).await? {
            match targets.iter_mut().find(|t| t.kind.gvk_key() == kind.gvk_key()) {
                Some(existing) => existing.namespaces = merge_namespaces(existing.namespaces.take(), &st.namespaces),
                None => targets.push(WatchTarget { kind, namespaces: st.namespaces.clone() }),
            }
        }
    }
    info!(kinds = targets.len(), "expanded scan types");
    Ok(targets)
}

fn merge_namespaces(current: Option<Vec<String>>, other: &Option<Vec<String>>) -> Option<Vec<String>> {
    let (mut current, other) = match (current, other) {
        (Some(c), Some(o)) => (c, o),
        _ => return None,
    };
    for ns in other {
        if !current.contains(ns) {
            current.push(ns.clone());
        }
    }
    Some(current)
}
