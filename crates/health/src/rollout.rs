use std::fmt;

use anyhow::{anyhow, Context, Result};
use ferry_kubehub::Cluster;
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};

use crate::{Poller, Snapshot};

/// Rollout progress of a single deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub desired: i32,
    pub generation: i64,
    pub observed_generation: i64,
    pub updated: i32,
    pub available: i32,
    pub ready: i32,
    pub total: i32,
}

impl RolloutStatus {
    pub fn from_deployment(dep: &Deployment) -> Self {
        // The API server defaults spec.replicas to 1.
        let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = dep.status.as_ref();
        Self {
            desired,
            generation: dep.metadata.generation.unwrap_or(0),
            observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
            updated: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            available: status.and_then(|s| s.available_replicas).unwrap_or(0),
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            total: status.and_then(|s| s.replicas).unwrap_or(0),
        }
    }

    pub fn generation_observed(&self) -> bool { self.observed_generation >= self.generation }

    pub fn all_updated(&self) -> bool { self.updated == self.desired }

    pub fn all_available(&self) -> bool { self.available == self.desired }

    pub fn all_ready(&self) -> bool { self.ready == self.desired }

    /// Also false while old replicas are still around (total > desired).
    pub fn no_surplus(&self) -> bool { self.total == self.desired }

    pub fn is_complete(&self) -> bool {
        self.generation_observed() && self.all_updated() && self.all_available() && self.all_ready() && self.no_surplus()
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "desired={} updated={} available={} ready={} total={} generation={}/{}",
            self.desired, self.updated, self.available, self.ready, self.total, self.observed_generation, self.generation
        )
    }
}

/// Rollout status paired with the deployment it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRollout {
    pub name: String,
    pub status: RolloutStatus,
}

impl fmt::Display for NamedRollout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "deployment {}: {}", self.name, self.status) }
}

impl Snapshot for NamedRollout {
    fn is_done(&self) -> bool { self.status.is_complete() }

    fn progress(&self) -> (u64, u64) {
        (self.status.ready.max(0) as u64, self.status.desired.max(0) as u64)
    }
}

/// Fetch a deployment's rollout status. A missing deployment is an error
/// here; while polling that means "not yet".
pub async fn rollout_status<C>(cluster: &C, namespace: &str, name: &str) -> Result<RolloutStatus>
where
    C: Cluster + ?Sized,
{
    let dep = cluster
        .get_deployment(namespace, name)
        .await
        .with_context(|| format!("getting deployment {}/{}", namespace, name))?
        .ok_or_else(|| anyhow!("deployment {}/{} not found", namespace, name))?;
    Ok(RolloutStatus::from_deployment(&dep))
}

/// Block until the deployment's latest generation is fully rolled out.
pub async fn wait_rollout<C>(cluster: &C, namespace: &str, name: &str, poller: &Poller) -> Result<RolloutStatus>
where
    C: Cluster + ?Sized,
{
    let done = poller
        .run(|| async move {
            let status = rollout_status(cluster, namespace, name).await?;
            Ok(NamedRollout { name: name.to_string(), status })
        })
        .await?;
    Ok(done.status)
}
