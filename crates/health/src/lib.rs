//! Ferry health: point-in-time snapshots of pods, deployments, namespaces
//! and nodes, plus the bounded poller that waits on them.

#![forbid(unsafe_code)]

mod namespace;
mod nodes;
mod pods;
mod poll;
mod rollout;

use std::time::Duration;

pub use namespace::{namespace_phase, wait_namespace_gone, NamespaceProbe};
pub use nodes::{cluster_report, ClusterReport, NodeHealth, PRESSURE_CONDITIONS};
pub use pods::{instance_snapshot, wait_instance_ready, HealthSnapshot, PodState};
pub use poll::{Poller, Snapshot};
pub use rollout::{rollout_status, wait_rollout, NamedRollout, RolloutStatus};

/// Default instance readiness timeout.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(180);
/// Default namespace deletion timeout.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(300);
/// Default deployment rollout timeout.
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(180);

/// Poll interval, `FERRY_POLL_SECS` (default 2s).
pub fn poll_interval() -> Duration {
    let secs = std::env::var("FERRY_POLL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(2);
    Duration::from_secs(secs)
}
