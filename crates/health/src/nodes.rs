use std::fmt;

use anyhow::{Context, Result};
use ferry_kubehub::Cluster;
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};

/// Node conditions that make a Ready node unhealthy when True.
pub const PRESSURE_CONDITIONS: &[&str] = &["MemoryPressure", "DiskPressure", "PIDPressure", "NetworkUnavailable"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub name: String,
    pub ready: bool,
    /// Pressure conditions currently True.
    pub pressures: Vec<String>,
}

impl NodeHealth {
    pub fn from_node(node: &Node) -> Self {
        let conditions = node.status.as_ref().and_then(|s| s.conditions.as_ref());
        let is_true = |ty: &str| {
            conditions.map(|cs| cs.iter().any(|c| c.type_ == ty && c.status == "True")).unwrap_or(false)
        };
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            ready: is_true("Ready"),
            pressures: PRESSURE_CONDITIONS.iter().filter(|p| is_true(**p)).map(|p| p.to_string()).collect(),
        }
    }

    /// Ready with no pressure or network condition.
    pub fn is_healthy(&self) -> bool { self.ready && self.pressures.is_empty() }
}

/// One read of every node in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub nodes: Vec<NodeHealth>,
}

impl ClusterReport {
    pub fn from_nodes(nodes: &[Node]) -> Self {
        Self { nodes: nodes.iter().map(NodeHealth::from_node).collect() }
    }

    pub fn total(&self) -> usize { self.nodes.len() }

    pub fn ready(&self) -> usize { self.nodes.iter().filter(|n| n.ready).count() }

    pub fn healthy(&self) -> usize { self.nodes.iter().filter(|n| n.is_healthy()).count() }

    pub fn all_ready(&self) -> bool { self.ready() == self.total() }

    /// Machine-parsable first line: `cluster_status: <total> <ready>`.
    pub fn summary_line(&self) -> String {
        format!("cluster_status: {} {}", self.total(), self.ready())
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} nodes ready, {} healthy", self.ready(), self.total(), self.healthy())?;
        for n in &self.nodes {
            let state = if n.ready { "Ready" } else { "NotReady" };
            write!(f, "\n  {:<40} {}", n.name, state)?;
            if !n.pressures.is_empty() {
                write!(f, " ({})", n.pressures.join(", "))?;
            }
        }
        Ok(())
    }
}

pub async fn cluster_report<C>(cluster: &C) -> Result<ClusterReport>
where
    C: Cluster + ?Sized,
{
    let nodes = cluster.list_nodes().await.context("listing nodes")?;
    Ok(ClusterReport::from_nodes(&nodes))
}
