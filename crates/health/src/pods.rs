use std::fmt;

use anyhow::{Context, Result};
use ferry_kubehub::Cluster;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::{Poller, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodState {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

impl PodState {
    /// `None` for pods that no longer count toward instance health:
    /// completed successfully, or already marked for deletion.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        if pod.metadata.deletion_timestamp.is_some() {
            return None;
        }
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string());
        if phase == "Succeeded" {
            return None;
        }
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);
        Some(Self { name: pod.metadata.name.clone().unwrap_or_default(), phase, ready })
    }
}

/// Instance-wide health: pods in the namespace and how many are ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub namespace: String,
    pub total: usize,
    pub ready: usize,
    pub pods: Vec<PodState>,
}

impl HealthSnapshot {
    pub fn from_pods(namespace: &str, pods: &[Pod]) -> Self {
        let pods: Vec<PodState> = pods.iter().filter_map(PodState::from_pod).collect();
        let ready = pods.iter().filter(|p| p.ready).count();
        Self { namespace: namespace.to_string(), total: pods.len(), ready, pods }
    }

    /// An empty namespace is never healthy.
    pub fn is_healthy(&self) -> bool {
        self.total > 0 && self.ready == self.total
    }
}

impl fmt::Display for HealthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} pods ready", self.namespace, self.ready, self.total)?;
        for p in &self.pods {
            write!(f, "\n  {:<40} {:<10} {}", p.name, p.phase, if p.ready { "ready" } else { "not ready" })?;
        }
        Ok(())
    }
}

impl Snapshot for HealthSnapshot {
    fn is_done(&self) -> bool { self.is_healthy() }
    fn progress(&self) -> (u64, u64) { (self.ready as u64, self.total as u64) }
}

pub async fn instance_snapshot<C>(cluster: &C, namespace: &str) -> Result<HealthSnapshot>
where
    C: Cluster + ?Sized,
{
    let pods = cluster.list_pods(namespace).await.with_context(|| format!("listing pods in {}", namespace))?;
    Ok(HealthSnapshot::from_pods(namespace, &pods))
}

/// Block until every live pod in the namespace is ready (and there is at least one).
pub async fn wait_instance_ready<C>(cluster: &C, namespace: &str, poller: &Poller) -> Result<HealthSnapshot>
where
    C: Cluster + ?Sized,
{
    poller.run(|| instance_snapshot(cluster, namespace)).await
}
