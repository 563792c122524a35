//! Ferry Ops: lifecycle workflows for one instance directory.
//! Each workflow applies manifests through the `Cluster` seam and then,
//! unless asked not to, blocks on the matching health predicate.

#![forbid(unsafe_code)]

mod cluster;
mod image;
mod stop;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ferry_apply::{apply_directory, apply_manifest, Applied, ApplyOptions, DirectoryReport};
use ferry_core::InstanceDir;
use ferry_health::{
    instance_snapshot, namespace_phase, wait_instance_ready, wait_rollout, HealthSnapshot, Poller, RolloutStatus,
};
use ferry_kubehub::Cluster;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use cluster::{check_cluster, cluster_status};
pub use image::{ImageRef, ImageReport, ImageTarget, DEFAULT_IMAGE_CONTAINER, DEFAULT_IMAGE_DEPLOYMENT};
pub use stop::{StopReport, TLS_SECRET_NAME};

/// How a workflow waits after mutating the cluster.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// When false the workflow returns right after its last mutation.
    pub wait: bool,
    pub timeout: Duration,
    /// Draw a progress bar on stderr while waiting.
    pub progress: bool,
    /// Overrides `FERRY_POLL_SECS`.
    pub interval: Option<Duration>,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self { wait: true, timeout, progress: false, interval: None }
    }

    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    pub fn with_progress(mut self, visible: bool) -> Self {
        self.progress = visible;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    fn poller(&self, what: impl Into<String>) -> Poller {
        let p = Poller::new(what, self.timeout).with_progress(self.progress);
        match self.interval {
            Some(i) => p.with_interval(i),
            None => p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReport {
    pub namespace: String,
    pub restored_tls_secret: bool,
    pub stack: DirectoryReport,
    /// Final snapshot when the workflow waited for readiness.
    pub health: Option<HealthSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Namespace was not Active; nothing was applied.
    Skipped { namespace: String, phase: Option<String> },
    Applied { namespace: String, stack: DirectoryReport, health: Option<HealthSnapshot> },
}

impl UpdateOutcome {
    pub fn is_skipped(&self) -> bool { matches!(self, UpdateOutcome::Skipped { .. }) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleReport {
    pub manifest: PathBuf,
    pub applied: Applied,
    pub rollout: Option<RolloutStatus>,
}

/// Workflows bound to one cluster connection and one instance directory.
pub struct Lifecycle<'a, C: Cluster + ?Sized> {
    cluster: &'a C,
    instance: &'a InstanceDir,
    dry_run: bool,
}

impl<'a, C: Cluster + ?Sized> Lifecycle<'a, C> {
    pub fn new(cluster: &'a C, instance: &'a InstanceDir) -> Self {
        Self { cluster, instance, dry_run: false }
    }

    /// Server-side dry run for the apply-based workflows; waits are skipped.
    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn instance(&self) -> &InstanceDir { self.instance }

    fn apply_opts(&self, namespace: &str) -> ApplyOptions {
        ApplyOptions { default_namespace: Some(namespace.to_string()), dry_run: self.dry_run }
    }

    fn should_wait(&self, wait: &WaitOptions) -> bool { wait.wait && !self.dry_run }

    /// Bring an instance up: namespace, restored TLS secret, then the stack.
    pub async fn start(&self, wait: &WaitOptions) -> Result<StartReport> {
        let ns_manifest = self.instance.namespace_manifest();
        let applied = apply_manifest(
            self.cluster,
            &ns_manifest,
            &ApplyOptions { default_namespace: None, dry_run: self.dry_run },
        )
        .await
        .context("applying namespace manifest")?;
        let namespace = applied.namespace.clone().unwrap_or_else(|| self.instance.namespace().to_string());
        if namespace != self.instance.namespace() {
            warn!(manifest = %namespace, derived = %self.instance.namespace(), "namespace manifest does not match directory name");
        }
        let opts = self.apply_opts(&namespace);

        let backup = self.instance.tls_secret_backup();
        let restored_tls_secret = backup.is_file();
        if restored_tls_secret {
            apply_manifest(self.cluster, &backup, &opts).await.context("restoring TLS secret")?;
            info!(path = %backup.display(), "restored TLS secret");
        }

        let stack = apply_directory(self.cluster, &self.instance.stack_dir(), &opts).await?;
        info!(namespace = %namespace, applied = stack.applied.len(), failed = stack.failed.len(), "stack applied");

        let health = if self.should_wait(wait) {
            let poller = wait.poller(format!("instance {} ready", namespace));
            Some(wait_instance_ready(self.cluster, &namespace, &poller).await?)
        } else {
            None
        };
        Ok(StartReport { namespace, restored_tls_secret, stack, health })
    }

    /// Re-apply the stack, but only into a namespace that is currently Active.
    pub async fn update(&self, wait: &WaitOptions) -> Result<UpdateOutcome> {
        let namespace = self.instance.namespace().to_string();
        let phase = namespace_phase(self.cluster, &namespace).await?;
        if phase.as_deref() != Some("Active") {
            info!(namespace = %namespace, phase = ?phase, "namespace not active; update skipped");
            return Ok(UpdateOutcome::Skipped { namespace, phase });
        }
        let stack = apply_directory(self.cluster, &self.instance.stack_dir(), &self.apply_opts(&namespace)).await?;
        let health = if self.should_wait(wait) {
            let poller = wait.poller(format!("instance {} ready", namespace));
            Some(wait_instance_ready(self.cluster, &namespace, &poller).await?)
        } else {
            None
        };
        Ok(UpdateOutcome::Applied { namespace, stack, health })
    }

    /// Re-apply one service's deployment manifest and wait for its rollout.
    pub async fn scale(&self, service: &str, wait: &WaitOptions) -> Result<ScaleReport> {
        let manifest = self.instance.deployment_manifest(service);
        let applied = apply_manifest(self.cluster, &manifest, &self.apply_opts(self.instance.namespace()))
            .await
            .with_context(|| format!("scaling service {}", service))?;
        let rollout = if self.should_wait(wait) {
            let ns = applied.namespace.as_deref().unwrap_or(self.instance.namespace());
            let poller = wait.poller(format!("rollout {}", applied.name));
            Some(wait_rollout(self.cluster, ns, &applied.name, &poller).await?)
        } else {
            None
        };
        Ok(ScaleReport { manifest, applied, rollout })
    }

    /// One-shot pod health of the instance namespace.
    pub async fn status(&self) -> Result<HealthSnapshot> {
        instance_snapshot(self.cluster, self.instance.namespace()).await
    }
}
