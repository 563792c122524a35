//! In-memory [`Cluster`] for tests. Lookups can be scripted as sequences so
//! polling loops observe state changing across ticks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, DeploymentStatus},
    core::v1::{
        Container, Namespace, NamespaceStatus, Node, NodeCondition, NodeStatus, Pod, PodCondition, PodSpec, PodStatus,
        PodTemplateSpec, Secret,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::GroupVersionKind;

use crate::{Cluster, Endpoint, KindResolver, Scope};

/// Replays values in order; the last one repeats forever.
#[derive(Debug, Clone)]
struct Script<T> {
    steps: VecDeque<T>,
}

impl<T: Clone> Script<T> {
    fn new(steps: impl IntoIterator<Item = T>) -> Self {
        Self { steps: steps.into_iter().collect() }
    }

    fn next(&mut self) -> Option<T> {
        if self.steps.len() > 1 { self.steps.pop_front() } else { self.steps.front().cloned() }
    }

    fn is_static(&self) -> bool { self.steps.len() <= 1 }
}

/// Outcome of one scripted lookup.
pub type Lookup<T> = std::result::Result<Option<T>, String>;

/// One recorded server-side apply.
#[derive(Debug, Clone)]
pub struct AppliedObject {
    pub gvk_key: String,
    pub namespace: Option<String>,
    pub name: String,
    pub body: serde_json::Value,
    pub dry_run: bool,
}

#[derive(Default)]
struct State {
    resolver: KindResolver,
    applied: Vec<AppliedObject>,
    rejected_names: HashSet<String>,
    pods: HashMap<String, Script<std::result::Result<Vec<Pod>, String>>>,
    deployments: HashMap<(String, String), Script<Lookup<Deployment>>>,
    namespaces: HashMap<String, Script<Lookup<Namespace>>>,
    secrets: HashMap<(String, String), Lookup<Secret>>,
    nodes: Vec<Node>,
    patches: Vec<(String, String, serde_json::Value)>,
    deleted_namespaces: Vec<String>,
    resolve_calls: usize,
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self { Self::new() }
}

impl FakeCluster {
    /// Fake with the built-in kinds a typical instance uses.
    pub fn new() -> Self {
        let resolver = KindResolver::from_endpoints([
            Endpoint::new("", "v1", "Namespace", "namespaces", Scope::Cluster),
            Endpoint::new("", "v1", "Node", "nodes", Scope::Cluster),
            Endpoint::new("", "v1", "Secret", "secrets", Scope::Namespaced),
            Endpoint::new("", "v1", "ConfigMap", "configmaps", Scope::Namespaced),
            Endpoint::new("", "v1", "Service", "services", Scope::Namespaced),
            Endpoint::new("apps", "v1", "Deployment", "deployments", Scope::Namespaced),
            Endpoint::new("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", Scope::Cluster),
        ]);
        Self { state: Mutex::new(State { resolver, ..Default::default() }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // poisoned by a panicking test; the state is still readable
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn with_endpoint(self, endpoint: Endpoint) -> Self {
        self.lock().resolver.insert(endpoint);
        self
    }

    /// Reject any apply whose metadata.name equals `name`.
    pub fn reject_apply(self, name: &str) -> Self {
        self.lock().rejected_names.insert(name.to_string());
        self
    }

    pub fn script_pods(&self, namespace: &str, steps: impl IntoIterator<Item = std::result::Result<Vec<Pod>, String>>) {
        self.lock().pods.insert(namespace.to_string(), Script::new(steps));
    }

    pub fn script_deployment(&self, namespace: &str, name: &str, steps: impl IntoIterator<Item = Lookup<Deployment>>) {
        self.lock().deployments.insert((namespace.to_string(), name.to_string()), Script::new(steps));
    }

    pub fn script_namespace(&self, name: &str, steps: impl IntoIterator<Item = Lookup<Namespace>>) {
        self.lock().namespaces.insert(name.to_string(), Script::new(steps));
    }

    pub fn set_secret(&self, namespace: &str, name: &str, lookup: Lookup<Secret>) {
        self.lock().secrets.insert((namespace.to_string(), name.to_string()), lookup);
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.lock().nodes = nodes;
    }

    pub fn applied(&self) -> Vec<AppliedObject> { self.lock().applied.clone() }

    pub fn applied_names(&self) -> Vec<String> { self.lock().applied.iter().map(|a| a.name.clone()).collect() }

    pub fn patches(&self) -> Vec<(String, String, serde_json::Value)> { self.lock().patches.clone() }

    pub fn deleted_namespaces(&self) -> Vec<String> { self.lock().deleted_namespaces.clone() }

    pub fn resolve_calls(&self) -> usize { self.lock().resolve_calls }
}

/// Namespace object in the given phase (`Active`, `Terminating`).
pub fn namespace(name: &str, phase: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        status: Some(NamespaceStatus { phase: Some(phase.to_string()), ..Default::default() }),
        ..Default::default()
    }
}

/// Pod in `phase`, with its Ready condition set to `ready`.
pub fn pod(name: &str, phase: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mark a pod as being deleted.
pub fn terminating(mut pod: Pod) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    pod
}

/// Deployment at generation 1 with one container and no observed status yet.
pub fn deployment(name: &str, container: &str, image: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta { name: Some(name.to_string()), generation: Some(1), ..Default::default() },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: container.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Replica counts as reported by the deployment controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observed {
    pub generation: i64,
    pub updated: i32,
    pub available: i32,
    pub ready: i32,
    pub total: i32,
}

impl Observed {
    /// Everything settled at `replicas` for generation `generation`.
    pub fn settled(generation: i64, replicas: i32) -> Self {
        Self { generation, updated: replicas, available: replicas, ready: replicas, total: replicas }
    }
}

pub fn observed(mut dep: Deployment, o: Observed) -> Deployment {
    dep.status = Some(DeploymentStatus {
        observed_generation: Some(o.generation),
        updated_replicas: Some(o.updated),
        available_replicas: Some(o.available),
        ready_replicas: Some(o.ready),
        replicas: Some(o.total),
        ..Default::default()
    });
    dep
}

/// Node with a Ready condition and any listed pressure conditions set to True.
pub fn node(name: &str, ready: bool, pressures: &[&str]) -> Node {
    let mut conditions = vec![NodeCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        ..Default::default()
    }];
    for p in pressures {
        conditions.push(NodeCondition { type_: p.to_string(), status: "True".to_string(), ..Default::default() });
    }
    Node {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        status: Some(NodeStatus { conditions: Some(conditions), ..Default::default() }),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Endpoint> {
        let mut st = self.lock();
        st.resolve_calls += 1;
        Ok(st.resolver.resolve(gvk)?.clone())
    }

    async fn apply(
        &self,
        endpoint: &Endpoint,
        namespace: Option<&str>,
        name: &str,
        body: &serde_json::Value,
        dry_run: bool,
    ) -> Result<()> {
        let mut st = self.lock();
        if st.rejected_names.contains(name) {
            return Err(anyhow!("admission webhook denied {}", name));
        }
        st.applied.push(AppliedObject {
            gvk_key: endpoint.gvk_key(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            body: body.clone(),
            dry_run,
        });
        if !dry_run && endpoint.resource.kind == "Namespace" && endpoint.resource.group.is_empty() {
            st.namespaces
                .entry(name.to_string())
                .or_insert_with(|| Script::new([Ok(Some(crate::fake::namespace(name, "Active")))]));
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let mut st = self.lock();
        match st.pods.get_mut(namespace).and_then(|s| s.next()) {
            Some(Ok(pods)) => Ok(pods),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(Vec::new()),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let mut st = self.lock();
        match st.deployments.get_mut(&(namespace.to_string(), name.to_string())).and_then(|s| s.next()) {
            Some(lookup) => lookup.map_err(|e| anyhow!(e)),
            None => Ok(None),
        }
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<Deployment> {
        let mut st = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let script = st.deployments.get_mut(&key).ok_or_else(|| anyhow!("deployments.apps \"{}\" not found", name))?;
        for step in script.steps.iter_mut() {
            if let Ok(Some(dep)) = step {
                apply_container_images(dep, patch);
            }
        }
        let current = script
            .steps
            .front()
            .cloned()
            .and_then(|s| s.ok().flatten())
            .ok_or_else(|| anyhow!("deployments.apps \"{}\" not found", name))?;
        st.patches.push((namespace.to_string(), name.to_string(), patch.clone()));
        Ok(current)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let mut st = self.lock();
        match st.namespaces.get_mut(name).and_then(|s| s.next()) {
            Some(lookup) => lookup.map_err(|e| anyhow!(e)),
            None => Ok(None),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool> {
        let mut st = self.lock();
        st.deleted_namespaces.push(name.to_string());
        let existed = match st.namespaces.get(name) {
            Some(s) => matches!(s.steps.front(), Some(Ok(Some(_)))),
            None => false,
        };
        // Unscripted namespaces disappear at once; scripted ones follow their script.
        let vanish = st.namespaces.get(name).map(|s| s.is_static()).unwrap_or(true);
        if vanish {
            st.namespaces.insert(name.to_string(), Script::new([Ok(None)]));
        }
        Ok(existed)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let st = self.lock();
        match st.secrets.get(&(namespace.to_string(), name.to_string())) {
            Some(lookup) => lookup.clone().map_err(|e| anyhow!(e)),
            None => Ok(None),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.lock().nodes.clone())
    }
}

/// Mirror the subset of strategic merge used for image patches: containers merge by name.
fn apply_container_images(dep: &mut Deployment, patch: &serde_json::Value) {
    let Some(wanted) = patch
        .pointer("/spec/template/spec/containers")
        .and_then(|v| v.as_array())
    else {
        return;
    };
    let Some(pod_spec) = dep.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else { return };
    for w in wanted {
        let (Some(name), Some(image)) = (w.get("name").and_then(|v| v.as_str()), w.get("image").and_then(|v| v.as_str())) else {
            continue;
        };
        if let Some(c) = pod_spec.containers.iter_mut().find(|c| c.name == name) {
            c.image = Some(image.to_string());
        }
    }
}
