//! Discovery resolver: server group/version metadata fetched once, resource
//! lists per group/version cached on first use and never invalidated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kube::Client;
use scanner_core::ResourceKind;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// The group, version or resource is not served by this cluster.
    #[error("not found in cluster: {0}")]
    NotFound(String),
    #[error("discovery request failed: {0}")]
    Api(String),
}

impl DiscoveryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscoveryError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_version(), self.resource)
    }
}

/// Capability interface the scan-type expander resolves against.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    fn preferred_version(&self, group: &str) -> Result<String, DiscoveryError>;
    fn all_versions(&self, group: &str) -> Result<Vec<String>, DiscoveryError>;
    async fn find_kind(&self, gvr: &GroupVersionResource) -> Result<ResourceKind, DiscoveryError>;
}

/// An API group as advertised by the server. The core group has an empty name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedGroup {
    pub name: String,
    pub versions: Vec<String>,
    pub preferred_version: String,
}

/// One entry of a group/version resource list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedResource {
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
}

/// Raw discovery endpoints; implemented over kube and by test doubles.
#[async_trait::async_trait]
pub trait DiscoveryApi: Send + Sync {
    async fn server_groups(&self) -> Result<Vec<ServedGroup>, DiscoveryError>;
    async fn server_resources(&self, group: &str, version: &str) -> Result<Vec<ServedResource>, DiscoveryError>;
}

pub struct KubeDiscoveryApi {
    client: Client,
}

impl KubeDiscoveryApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_kube_err(what: &str, err: kube::Error) -> DiscoveryError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => DiscoveryError::NotFound(what.to_string()),
        other => DiscoveryError::Api(format!("{}: {}", what, other)),
    }
}

#[async_trait::async_trait]
impl DiscoveryApi for KubeDiscoveryApi {
    async fn server_groups(&self) -> Result<Vec<ServedGroup>, DiscoveryError> {
        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|e| map_kube_err("core api versions", e))?;
        let mut out = Vec::new();
        if let Some(first) = core.versions.first() {
            out.push(ServedGroup {
                name: String::new(),
                versions: core.versions.clone(),
                preferred_version: first.clone(),
            });
        }
        let groups = self.client.list_api_groups().await.map_err(|e| map_kube_err("api groups", e))?;
        for g in groups.groups {
            let versions: Vec<String> = g.versions.iter().map(|v| v.version.clone()).collect();
            let preferred_version = g
                .preferred_version
                .as_ref()
                .map(|p| p.version.clone())
                .or_else(|| versions.first().cloned())
                .unwrap_or_default();
            out.push(ServedGroup { name: g.name, versions, preferred_version });
        }
        Ok(out)
    }

    async fn server_resources(&self, group: &str, version: &str) -> Result<Vec<ServedResource>, DiscoveryError> {
        let list = if group.is_empty() {
            self.client
                .list_core_api_resources(version)
                .await
                .map_err(|e| map_kube_err(&format!("groupversion {}", version), e))?
        } else {
            let gv = format!("{}/{}", group, version);
            self.client
                .list_api_group_resources(&gv)
                .await
                .map_err(|e| map_kube_err(&format!("groupversion {}", gv), e))?
        };
        Ok(list
            .resources
            .into_iter()
            .map(|r| ServedResource { name: r.name, kind: r.kind, namespaced: r.namespaced })
            .collect())
    }
}

type ResourceCache = HashMap<(String, String), Arc<Vec<ServedResource>>>;

/// Discovery resolver backed by a populate-once cache.
pub struct CachedDiscovery<A> {
    api: A,
    groups: Vec<ServedGroup>,
    resources: Mutex<ResourceCache>,
}

impl<A: DiscoveryApi> CachedDiscovery<A> {
    /// Fetches the group list once; it is never refreshed afterwards.
    pub async fn new(api: A) -> Result<Self, DiscoveryError> {
        let groups = api.server_groups().await?;
        debug!(groups = groups.len(), "discovered api groups");
        Ok(Self { api, groups, resources: Mutex::new(HashMap::new()) })
    }

    fn group(&self, name: &str) -> Result<&ServedGroup, DiscoveryError> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| DiscoveryError::NotFound(format!("group {:?}", name)))
    }

    async fn resources_for(&self, group: &str, version: &str) -> Result<Arc<Vec<ServedResource>>, DiscoveryError> {
        let key = (group.to_string(), version.to_string());
        let cached = {
            let cache = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
            cache.get(&key).cloned()
        };
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let fetched = Arc::new(self.api.server_resources(group, version).await?);
        debug!(group, version, resources = fetched.len(), "cached server resources");
        let mut cache = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(cache.entry(key).or_insert(fetched)))
    }
}

#[async_trait::async_trait]
impl<A: DiscoveryApi> Discovery for CachedDiscovery<A> {
    fn preferred_version(&self, group: &str) -> Result<String, DiscoveryError> {
        Ok(self.group(group)?.preferred_version.clone())
    }

    fn all_versions(&self, group: &str) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.group(group)?.versions.clone())
    }

    async fn find_kind(&self, gvr: &GroupVersionResource) -> Result<ResourceKind, DiscoveryError> {
        let preferred_version = self.group(&gvr.group).map(|g| g.preferred_version.clone()).unwrap_or_default();
        let resources = self.resources_for(&gvr.group, &gvr.version).await?;
        resources
            .iter()
            .find(|r| r.name == gvr.resource)
            .map(|r| ResourceKind {
                group: gvr.group.clone(),
                version: gvr.version.clone(),
                kind: r.kind.clone(),
                plural: r.name.clone(),
                namespaced: r.namespaced,
                preferred_version,
            })
            .ok_or_else(|| DiscoveryError::NotFound(format!("resource {}", gvr)))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned discovery endpoints that count resource-list fetches.
    #[derive(Default)]
    pub struct FakeApi {
        pub groups: Vec<ServedGroup>,
        pub resources: HashMap<(String, String), Vec<ServedResource>>,
        pub broken_group_versions: Vec<(String, String)>,
        pub resource_fetches: AtomicUsize,
    }

    impl FakeApi {
        pub fn group(mut self, name: &str, versions: &[&str], preferred: &str) -> Self {
            self.groups.push(ServedGroup {
                name: name.to_string(),
                versions: versions.iter().map(|v| v.to_string()).collect(),
                preferred_version: preferred.to_string(),
            });
            self
        }

        pub fn resource(mut self, group: &str, version: &str, name: &str, kind: &str) -> Self {
            self.resources
                .entry((group.to_string(), version.to_string()))
                .or_default()
                .push(ServedResource { name: name.to_string(), kind: kind.to_string(), namespaced: true });
            self
        }

        pub fn broken(mut self, group: &str, version: &str) -> Self {
            self.broken_group_versions.push((group.to_string(), version.to_string()));
            self
        }
    }

    #[async_trait::async_trait]
    impl DiscoveryApi for FakeApi {
        async fn server_groups(&self) -> Result<Vec<ServedGroup>, DiscoveryError> {
            Ok(self.groups.clone())
        }

        async fn server_resources(&self, group: &str, version: &str) -> Result<Vec<ServedResource>, DiscoveryError> {
            self.resource_fetches.fetch_add(1, Ordering::SeqCst);
            let key = (group.to_string(), version.to_string());
            if self.broken_group_versions.contains(&key) {
                return Err(DiscoveryError::Api("connection refused".into()));
            }
            self.resources
                .get(&key)
                .cloned()
                .ok_or_else(|| DiscoveryError::NotFound(format!("groupversion {}/{}", group, version)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeApi;
    use super::*;
    use std::sync::atomic::Ordering;

    fn api() -> FakeApi {
        FakeApi::default()
            .group("", &["v1"], "v1")
            .group("apps", &["v1", "v1beta1"], "v1")
            .resource("", "v1", "pods", "Pod")
            .resource("apps", "v1", "deployments", "Deployment")
            .resource("apps", "v1beta1", "deployments", "Deployment")
    }

    #[tokio::test]
    async fn preferred_and_all_versions() {
        let d = CachedDiscovery::new(api()).await.unwrap();
        assert_eq!(d.preferred_version("apps").unwrap(), "v1");
        assert_eq!(d.all_versions("apps").unwrap(), vec!["v1".to_string(), "v1beta1".to_string()]);
        assert_eq!(d.preferred_version("").unwrap(), "v1");
        assert!(d.preferred_version("batch").unwrap_err().is_not_found());
        assert!(d.all_versions("batch").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn find_kind_fills_kind_and_preferred_version() {
        let d = CachedDiscovery::new(api()).await.unwrap();
        let k = d.find_kind(&GroupVersionResource::new("apps", "v1beta1", "deployments")).await.unwrap();
        assert_eq!(k.kind, "Deployment");
        assert_eq!(k.version, "v1beta1");
        assert_eq!(k.preferred_version, "v1");
        assert_eq!(k.plural, "deployments");
    }

    #[tokio::test]
    async fn resource_lists_are_fetched_once_per_group_version() {
        let d = CachedDiscovery::new(api()).await.unwrap();
        for _ in 0..3 {
            d.find_kind(&GroupVersionResource::new("apps", "v1", "deployments")).await.unwrap();
        }
        let missing = d.find_kind(&GroupVersionResource::new("apps", "v1", "statefulsets")).await.unwrap_err();
        assert!(missing.is_not_found());
        assert_eq!(d.api.resource_fetches.load(Ordering::SeqCst), 1);

        d.find_kind(&GroupVersionResource::new("", "v1", "pods")).await.unwrap();
        assert_eq!(d.api.resource_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_not_found_errors_stay_distinct() {
        let d = CachedDiscovery::new(api().broken("apps", "v1")).await.unwrap();
        let err = d.find_kind(&GroupVersionResource::new("apps", "v1", "deployments")).await.unwrap_err();
        assert!(!err.is_not_found());
    }
}
