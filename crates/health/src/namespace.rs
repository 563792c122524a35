use std::fmt;

use anyhow::{Context, Result};
use ferry_kubehub::Cluster;

use crate::{Poller, Snapshot};

/// One lookup of a namespace that is expected to disappear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceProbe {
    pub name: String,
    /// `None` once the lookup reports not found.
    pub phase: Option<String>,
}

impl NamespaceProbe {
    pub fn is_gone(&self) -> bool { self.phase.is_none() }
}

impl fmt::Display for NamespaceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.phase {
            None => write!(f, "namespace {} deleted", self.name),
            Some(p) => write!(f, "namespace {} still present (phase {})", self.name, p),
        }
    }
}

impl Snapshot for NamespaceProbe {
    fn is_done(&self) -> bool { self.is_gone() }
    fn progress(&self) -> (u64, u64) { (self.is_gone() as u64, 1) }
}

/// Current phase of a namespace (`Active`, `Terminating`), `None` if it does not exist.
pub async fn namespace_phase<C>(cluster: &C, name: &str) -> Result<Option<String>>
where
    C: Cluster + ?Sized,
{
    let ns = cluster.get_namespace(name).await.with_context(|| format!("getting namespace {}", name))?;
    Ok(ns.map(|ns| ns.status.and_then(|s| s.phase).unwrap_or_else(|| "Unknown".to_string())))
}

/// Block until a namespace lookup returns not found. Lookup errors are not
/// terminal; a namespace stuck in `Terminating` simply keeps the loop going.
pub async fn wait_namespace_gone<C>(cluster: &C, name: &str, poller: &Poller) -> Result<()>
where
    C: Cluster + ?Sized,
{
    poller
        .run(|| async move {
            let phase = namespace_phase(cluster, name).await?;
            Ok(NamespaceProbe { name: name.to_string(), phase })
        })
        .await?;
    Ok(())
}
