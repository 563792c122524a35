//! Ferry kubehub: cluster connection, kind discovery and the `Cluster` seam
//! every workflow talks through.

#![forbid(unsafe_code)]

mod connection;
pub mod fake;

use std::collections::HashMap;

use anyhow::Result;
use ferry_core::FerryError;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Node, Pod, Secret},
};
use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub use connection::{ConfigSource, Connection};
pub use fake::FakeCluster;

/// Whether a kind lives inside a namespace or at cluster scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Resolved API endpoint for one group/version/kind.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub resource: ApiResource,
    pub scope: Scope,
}

impl Endpoint {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, scope: Scope) -> Self {
        let api_version = if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) };
        Self {
            resource: ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version,
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            scope,
        }
    }

    pub fn gvk_key(&self) -> String {
        gvk_key(&self.resource.group, &self.resource.version, &self.resource.kind)
    }

    pub fn namespaced(&self) -> bool { self.scope == Scope::Namespaced }
}

/// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

/// Split a manifest `apiVersion` into a GVK.
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind { group, version, kind: kind.to_string() }
}

/// Kind to endpoint map, built once per connection from API discovery.
#[derive(Debug, Clone, Default)]
pub struct KindResolver {
    by_key: HashMap<String, Endpoint>,
}

impl KindResolver {
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let by_key = endpoints.into_iter().map(|e| (e.gvk_key(), e)).collect();
        Self { by_key }
    }

    /// Build from a completed kube discovery, covering every served version.
    pub fn from_discovery(discovery: &kube::discovery::Discovery) -> Self {
        use kube::discovery::Scope as KubeScope;
        let mut endpoints = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let scope = match caps.scope {
                        KubeScope::Namespaced => Scope::Namespaced,
                        KubeScope::Cluster => Scope::Cluster,
                    };
                    endpoints.push(Endpoint { resource: ar, scope });
                }
            }
        }
        Self::from_endpoints(endpoints)
    }

    pub fn resolve(&self, gvk: &GroupVersionKind) -> Result<&Endpoint, FerryError> {
        let key = gvk_key(&gvk.group, &gvk.version, &gvk.kind);
        self.by_key.get(&key).ok_or(FerryError::UnknownKind(key))
    }

    pub fn insert(&mut self, endpoint: Endpoint) {
        self.by_key.insert(endpoint.gvk_key(), endpoint);
    }

    pub fn len(&self) -> usize { self.by_key.len() }

    pub fn is_empty(&self) -> bool { self.by_key.is_empty() }
}

/// Everything ferry needs from a cluster. `Connection` is the live
/// implementation, `FakeCluster` the in-memory one used by tests.
///
/// Lookups return `Ok(None)` for "not found"; any `Err` is a real failure.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Resolve a kind to its endpoint (discovery runs at most once).
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Endpoint>;

    /// Server-side apply with the ferry field manager, forcing ownership.
    async fn apply(
        &self,
        endpoint: &Endpoint,
        namespace: Option<&str>,
        name: &str,
        body: &serde_json::Value,
        dry_run: bool,
    ) -> Result<()>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Strategic-merge patch, so list entries such as containers merge by name.
    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<Deployment>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Foreground cascading delete. Returns false when the namespace was already gone.
    async fn delete_namespace(&self, name: &str) -> Result<bool>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_formats_core_and_grouped() {
        assert_eq!(gvk_key("", "v1", "Namespace"), "v1/Namespace");
        assert_eq!(gvk_key("apps", "v1", "Deployment"), "apps/v1/Deployment");
    }

    #[test]
    fn gvk_from_api_version_splits_group() {
        let g = gvk_from_api_version("apps/v1", "Deployment");
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("apps", "v1", "Deployment"));
        let c = gvk_from_api_version("v1", "Secret");
        assert_eq!((c.group.as_str(), c.version.as_str()), ("", "v1"));
    }

    #[test]
    fn resolver_resolves_known_and_rejects_unknown() {
        let r = KindResolver::from_endpoints([
            Endpoint::new("", "v1", "Namespace", "namespaces", Scope::Cluster),
            Endpoint::new("apps", "v1", "Deployment", "deployments", Scope::Namespaced),
        ]);
        assert_eq!(r.len(), 2);
        let ns = r.resolve(&gvk_from_api_version("v1", "Namespace")).unwrap();
        assert_eq!(ns.scope, Scope::Cluster);
        assert_eq!(ns.resource.plural, "namespaces");
        let dep = r.resolve(&gvk_from_api_version("apps/v1", "Deployment")).unwrap();
        assert!(dep.namespaced());
        assert_eq!(dep.resource.api_version, "apps/v1");

        let err = r.resolve(&gvk_from_api_version("apps/v1", "Deploymnet")).unwrap_err();
        assert!(matches!(err, FerryError::UnknownKind(k) if k == "apps/v1/Deploymnet"));
    }
}
