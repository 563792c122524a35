use std::fmt;

use anyhow::{anyhow, Context, Result};
use ferry_health::{wait_rollout, RolloutStatus};
use ferry_kubehub::Cluster;
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{Lifecycle, WaitOptions};

/// Deployment whose image `update-image` and `revert` target by default.
pub const DEFAULT_IMAGE_DEPLOYMENT: &str = "app";
/// Container inside that deployment.
pub const DEFAULT_IMAGE_CONTAINER: &str = "app";

/// `registry/repository:tag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self { registry: registry.into(), repository: repository.into(), tag: tag.into() }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.trim_end_matches('/');
        if registry.is_empty() {
            write!(f, "{}:{}", self.repository, self.tag)
        } else {
            write!(f, "{}/{}:{}", registry, self.repository, self.tag)
        }
    }
}

/// Which container of which deployment to repoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTarget {
    pub deployment: String,
    pub container: String,
}

impl Default for ImageTarget {
    fn default() -> Self {
        Self { deployment: DEFAULT_IMAGE_DEPLOYMENT.to_string(), container: DEFAULT_IMAGE_CONTAINER.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    pub deployment: String,
    pub container: String,
    /// Image the container ran before the patch.
    pub previous: Option<String>,
    pub image: String,
    pub rollout: Option<RolloutStatus>,
}

fn container_image(dep: &Deployment, container: &str) -> Option<Option<String>> {
    dep.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == container))
        .map(|c| c.image.clone())
}

/// Strategic merge patch; containers merge by name.
pub(crate) fn image_patch(container: &str, image: &str) -> serde_json::Value {
    json!({
        "spec": { "template": { "spec": { "containers": [ { "name": container, "image": image } ] } } }
    })
}

impl<'a, C: Cluster + ?Sized> Lifecycle<'a, C> {
    /// Point the target container at a new image and wait for the rollout.
    pub async fn update_image(&self, target: &ImageTarget, image: &ImageRef, wait: &WaitOptions) -> Result<ImageReport> {
        self.set_image("update", target, image, wait).await
    }

    /// Same patch as `update_image`, with the operator naming the earlier image.
    pub async fn revert_image(&self, target: &ImageTarget, image: &ImageRef, wait: &WaitOptions) -> Result<ImageReport> {
        self.set_image("revert", target, image, wait).await
    }

    async fn set_image(&self, action: &str, target: &ImageTarget, image: &ImageRef, wait: &WaitOptions) -> Result<ImageReport> {
        let ns = self.instance.namespace();
        let dep = self
            .cluster
            .get_deployment(ns, &target.deployment)
            .await
            .with_context(|| format!("getting deployment {}", target.deployment))?
            .ok_or_else(|| anyhow!("deployment {}/{} not found", ns, target.deployment))?;
        let previous = container_image(&dep, &target.container)
            .ok_or_else(|| anyhow!("deployment {} has no container {}", target.deployment, target.container))?;
        let reference = image.to_string();
        self.cluster
            .patch_deployment(ns, &target.deployment, &image_patch(&target.container, &reference))
            .await
            .with_context(|| format!("patching deployment {}", target.deployment))?;
        info!(
            action,
            deployment = %target.deployment,
            container = %target.container,
            previous = previous.as_deref().unwrap_or("<none>"),
            image = %reference,
            "image patched"
        );
        let rollout = if wait.wait {
            let poller = wait.poller(format!("rollout {}", target.deployment));
            Some(wait_rollout(self.cluster, ns, &target.deployment, &poller).await?)
        } else {
            None
        };
        Ok(ImageReport {
            deployment: target.deployment.clone(),
            container: target.container.clone(),
            previous,
            image: reference,
            rollout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_kubehub::fake::deployment;

    #[test]
    fn reference_formatting() {
        assert_eq!(ImageRef::new("registry.example.com", "app", "1.4").to_string(), "registry.example.com/app:1.4");
        assert_eq!(ImageRef::new("registry.example.com/", "app", "1.4").to_string(), "registry.example.com/app:1.4");
        assert_eq!(ImageRef::new("", "app", "latest").to_string(), "app:latest");
    }

    #[test]
    fn patch_names_the_container() {
        let p = image_patch("web", "r/web:2");
        assert_eq!(p.pointer("/spec/template/spec/containers/0/name").unwrap(), "web");
        assert_eq!(p.pointer("/spec/template/spec/containers/0/image").unwrap(), "r/web:2");
    }

    #[test]
    fn finds_container_image() {
        let dep = deployment("app", "app", "r/app:1", 1);
        assert_eq!(container_image(&dep, "app"), Some(Some("r/app:1".to_string())));
        assert_eq!(container_image(&dep, "sidecar"), None);
    }
}
