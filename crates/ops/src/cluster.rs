use anyhow::Result;
use ferry_core::FerryError;
use ferry_health::{cluster_report, ClusterReport};
use ferry_kubehub::Cluster;
use tracing::{info, warn};

/// Read every node once.
pub async fn cluster_status<C>(cluster: &C) -> Result<ClusterReport>
where
    C: Cluster + ?Sized,
{
    let report = cluster_report(cluster).await?;
    info!(total = report.total(), ready = report.ready(), healthy = report.healthy(), "cluster status");
    Ok(report)
}

/// Failure when any node is not Ready. Pressure alone does not fail the check.
pub fn check_cluster(report: &ClusterReport) -> Result<(), FerryError> {
    if report.all_ready() {
        return Ok(());
    }
    for n in report.nodes.iter().filter(|n| !n.ready) {
        warn!(node = %n.name, "node not ready");
    }
    Err(FerryError::ClusterUnhealthy { ready: report.ready(), total: report.total() })
}
