//! Ferry apply: parse manifests, resolve their kind and server-side apply them.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ferry_core::{is_manifest_path, FerryError};
use ferry_kubehub::{gvk_from_api_version, Cluster};
use kube::core::GroupVersionKind;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

/// Size guards applied before a manifest is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_bytes: usize,
    /// Objects, arrays and scalars in the parsed tree.
    pub max_nodes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self { max_bytes: 1 << 20, max_nodes: 100_000 }
    }
}

impl ParseLimits {
    /// `FERRY_MAX_YAML_BYTES` / `FERRY_MAX_YAML_NODES`, unset or unparsable knobs keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let knob = |key: &str, default: usize| {
            lookup(key).and_then(|s| s.trim().parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(default)
        };
        let d = Self::default();
        Self {
            max_bytes: knob("FERRY_MAX_YAML_BYTES", d.max_bytes),
            max_nodes: knob("FERRY_MAX_YAML_NODES", d.max_nodes),
        }
    }
}

/// True once the tree holds more than `max` nodes. Stops counting early.
fn exceeds_node_budget(root: &Json, max: usize) -> bool {
    let mut pending = vec![root];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen > max {
            return true;
        }
        match node {
            Json::Object(fields) => pending.extend(fields.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

/// One parsed, untyped resource.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub body: Json,
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl Manifest {
    pub fn is_namespace(&self) -> bool {
        self.gvk.group.is_empty() && self.gvk.kind == "Namespace"
    }
}

/// Knobs shared by single-file and directory applies.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Used for namespaced kinds whose manifest carries no namespace.
    pub default_namespace: Option<String>,
    /// Ask the server to validate without persisting.
    pub dry_run: bool,
}

impl ApplyOptions {
    pub fn in_namespace(ns: impl Into<String>) -> Self {
        Self { default_namespace: Some(ns.into()), dry_run: false }
    }
}

/// What a successful apply touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub kind: String,
    pub name: String,
    /// Namespace used, or for a `Namespace` object, its own name.
    pub namespace: Option<String>,
}

/// Outcome of a best-effort directory apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryReport {
    pub applied: Vec<Applied>,
    pub failed: Vec<(PathBuf, String)>,
}

impl DirectoryReport {
    pub fn is_clean(&self) -> bool { self.failed.is_empty() }
}

pub fn parse_manifest(yaml: &str) -> Result<Manifest> {
    parse_manifest_with(yaml, &ParseLimits::from_env())
}

pub fn parse_manifest_with(yaml: &str, limits: &ParseLimits) -> Result<Manifest> {
    if yaml.len() > limits.max_bytes {
        return Err(anyhow!("manifest is {} bytes, limit is {}", yaml.len(), limits.max_bytes));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if exceeds_node_budget(&json, limits.max_nodes) {
        return Err(anyhow!("manifest has more than {} nodes", limits.max_nodes));
    }
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest has no apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest has no kind"))?;
    let gvk = gvk_from_api_version(api_version, kind);
    let meta = json.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest has no metadata.name"))?.to_string();
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    Ok(Manifest { body: json, gvk, name, namespace })
}

pub fn read_manifest(path: &Path) -> Result<Manifest, FerryError> {
    let parse_err = |reason: String| FerryError::Parse { path: path.display().to_string(), reason };
    let yaml = std::fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
    parse_manifest(&yaml).map_err(|e| parse_err(format!("{:#}", e)))
}

/// Apply one manifest file and report the namespace it landed in.
pub async fn apply_manifest<C>(cluster: &C, path: &Path, opts: &ApplyOptions) -> Result<Applied>
where
    C: Cluster + ?Sized,
{
    let manifest = read_manifest(path)?;
    apply_parsed(cluster, manifest, opts).await
}

pub async fn apply_parsed<C>(cluster: &C, manifest: Manifest, opts: &ApplyOptions) -> Result<Applied>
where
    C: Cluster + ?Sized,
{
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);

    let self_named = manifest.is_namespace();
    let Manifest { mut body, gvk, name, namespace } = manifest;
    let endpoint = cluster.resolve(&gvk).await?;

    let target_ns = if endpoint.namespaced() {
        let ns = namespace
            .or_else(|| opts.default_namespace.clone())
            .ok_or_else(|| FerryError::NamespaceRequired { kind: gvk.kind.clone(), name: name.clone() })?;
        ensure_metadata(&mut body, &name, Some(&ns));
        Some(ns)
    } else {
        ensure_metadata(&mut body, &name, None);
        None
    };

    if let Err(e) = cluster.apply(&endpoint, target_ns.as_deref(), &name, &body, opts.dry_run).await {
        counter!("apply_err", 1u64);
        return Err(FerryError::Apply { kind: gvk.kind, name, reason: format!("{:#}", e) }.into());
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    info!(kind = %gvk.kind, name = %name, ns = ?target_ns, dry_run = opts.dry_run, "applied");

    let namespace = if self_named { Some(name.clone()) } else { target_ns };
    Ok(Applied { kind: gvk.kind, name, namespace })
}

/// Apply every manifest directly inside `dir`, in file-name order.
/// A failing file is logged and skipped; only an unreadable directory is an error.
pub async fn apply_directory<C>(cluster: &C, dir: &Path, opts: &ApplyOptions) -> Result<DirectoryReport>
where
    C: Cluster + ?Sized,
{
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry.with_context(|| format!("listing {}", dir.display()))?.path();
        if path.is_file() && is_manifest_path(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut report = DirectoryReport::default();
    for path in paths {
        match apply_manifest(cluster, &path, opts).await {
            Ok(applied) => report.applied.push(applied),
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "manifest apply failed; continuing");
                report.failed.push((path, format!("{:#}", e)));
            }
        }
    }
    info!(dir = %dir.display(), applied = report.applied.len(), failed = report.failed.len(), "directory applied");
    Ok(report)
}

/// Drop fields the server owns so an exported object re-applies cleanly.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("uid");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("deletionTimestamp");
            obj.remove("deletionGracePeriodSeconds");
            obj.remove("ownerReferences");
            obj.remove("selfLink");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn ensure_metadata(v: &mut Json, name: &str, ns: Option<&str>) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert(Json::Object(serde_json::Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(name.to_string()));
        match ns {
            Some(ns) => { obj.insert("namespace".into(), Json::String(ns.to_string())); }
            None => { obj.remove("namespace"); }
        }
    }
}
