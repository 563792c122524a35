use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ferry_core::{FerryError, FIELD_MANAGER};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Node, Pod, Secret},
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Client, Config,
};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{Cluster, Endpoint, KindResolver};

/// Where the connection's credentials came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    InCluster,
    Local,
}

/// Handle to one cluster. The kube client and the kind resolver are built on
/// first use and then shared read-only by every step of the invocation.
pub struct Connection {
    source: ConfigSource,
    config: Config,
    client: OnceCell<Client>,
    resolver: OnceCell<KindResolver>,
}

impl Connection {
    /// Resolve cluster credentials: explicit kubeconfig (hard failure if
    /// unreadable), then in-cluster service account, then the default local
    /// kubeconfig (`$KUBECONFIG` or `~/.kube/config`).
    pub async fn connect(explicit: Option<&Path>) -> Result<Self> {
        let (source, config) = match explicit {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)
                    .map_err(|e| FerryError::Config(format!("reading kubeconfig {}: {}", path.display(), e)))?;
                let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| FerryError::Config(format!("loading kubeconfig {}: {}", path.display(), e)))?;
                (ConfigSource::Explicit(path.to_path_buf()), config)
            }
            None => match Config::incluster() {
                Ok(config) => (ConfigSource::InCluster, config),
                Err(e) => {
                    debug!(error = %e, "no in-cluster credentials; using local kubeconfig");
                    let config = Config::from_kubeconfig(&KubeConfigOptions::default())
                        .await
                        .map_err(|e| FerryError::Config(format!("loading local kubeconfig: {}", e)))?;
                    (ConfigSource::Local, config)
                }
            },
        };
        info!(source = ?source, cluster = %config.cluster_url, "cluster config resolved");
        Ok(Self { source, config, client: OnceCell::new(), resolver: OnceCell::new() })
    }

    pub fn source(&self) -> &ConfigSource { &self.source }

    /// Typed client, built once.
    pub async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                Client::try_from(self.config.clone())
                    .map_err(|e| anyhow::Error::from(FerryError::Config(format!("building kube client: {}", e))))
            })
            .await
    }

    /// Kind resolver, built from one discovery run per connection.
    pub async fn resolver(&self) -> Result<&KindResolver> {
        self.resolver
            .get_or_try_init(|| async {
                let client = self.client().await?.clone();
                let discovery = Discovery::new(client).run().await.context("running API discovery")?;
                let resolver = KindResolver::from_discovery(&discovery);
                counter!("discovery_runs", 1u64);
                info!(kinds = resolver.len(), "api discovery complete");
                Ok::<_, anyhow::Error>(resolver)
            })
            .await
    }

    /// Untyped API handle for a resolved endpoint.
    pub async fn dynamic(&self, endpoint: &Endpoint, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let client = self.client().await?.clone();
        Ok(match namespace {
            Some(ns) if endpoint.namespaced() => Api::namespaced_with(client, ns, &endpoint.resource),
            _ => Api::all_with(client, &endpoint.resource),
        })
    }
}

#[async_trait::async_trait]
impl Cluster for Connection {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Endpoint> {
        Ok(self.resolver().await?.resolve(gvk)?.clone())
    }

    async fn apply(
        &self,
        endpoint: &Endpoint,
        namespace: Option<&str>,
        name: &str,
        body: &serde_json::Value,
        dry_run: bool,
    ) -> Result<()> {
        let api = self.dynamic(endpoint, namespace).await?;
        let mut pp = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            pp = pp.dry_run();
        }
        api.patch(name, &pp, &Patch::Apply(body)).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client().await?.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client().await?.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client().await?.clone(), namespace);
        let pp = PatchParams::default();
        Ok(api.patch(name, &pp, &Patch::Strategic(patch)).await?)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client().await?.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client().await?.clone());
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(anyhow!("deleting namespace {}: {}", name, e)),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client().await?.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client().await?.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_kubeconfig_that_does_not_exist_is_a_config_error() {
        let err = match Connection::connect(Some(Path::new("/nonexistent/ferry/kubeconfig"))).await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        let fe = err.downcast_ref::<FerryError>().expect("typed error");
        assert!(matches!(fe, FerryError::Config(m) if m.contains("/nonexistent/ferry/kubeconfig")));
    }
}
