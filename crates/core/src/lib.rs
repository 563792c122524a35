//! Ferry core types: the on-disk instance layout and the namespace it maps to.

#![forbid(unsafe_code)]

mod error;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use error::FerryError;

/// Field manager used for every server-side apply issued by ferry.
pub const FIELD_MANAGER: &str = "ferry";

/// Characters dropped from a directory basename when deriving a namespace.
pub const NAMESPACE_SEPARATORS: &[char] = &['.', '_'];

/// File extensions treated as manifests when applying a directory.
pub const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Derive the cluster namespace for an instance from its directory basename.
///
/// Pure and idempotent: `extract_namespace(extract_namespace(x)) == extract_namespace(x)`.
pub fn extract_namespace(basename: &str) -> String {
    basename.chars().filter(|c| !NAMESPACE_SEPARATORS.contains(c)).collect()
}

/// True when `path` carries one of [`MANIFEST_EXTENSIONS`].
pub fn is_manifest_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MANIFEST_EXTENSIONS.iter().any(|m| m.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Read-only view of an instance directory produced by the setup tooling.
///
/// ```text
/// <root>/namespace.yaml
/// <root>/stack/<service>-deployment.yaml ...
/// <root>/secrets/tls-secret.yaml          (optional, written by stop)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDir {
    root: PathBuf,
    namespace: String,
}

impl InstanceDir {
    pub const NAMESPACE_MANIFEST: &'static str = "namespace.yaml";
    pub const STACK_DIR: &'static str = "stack";
    pub const SECRETS_DIR: &'static str = "secrets";
    pub const TLS_SECRET_BACKUP: &'static str = "tls-secret.yaml";

    /// Open an existing instance directory and derive its namespace.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, FerryError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(FerryError::Config(format!("instance directory {} does not exist", root.display())));
        }
        // `.` and `..` have no file_name; resolve them first.
        let basename = match root.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => std::fs::canonicalize(&root)
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .ok_or_else(|| FerryError::Config(format!("cannot determine basename of {}", root.display())))?,
        };
        let namespace = extract_namespace(&basename);
        if namespace.is_empty() {
            return Err(FerryError::Config(format!("instance directory {} yields an empty namespace", root.display())));
        }
        Ok(Self { root, namespace })
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn namespace_manifest(&self) -> PathBuf { self.root.join(Self::NAMESPACE_MANIFEST) }

    pub fn stack_dir(&self) -> PathBuf { self.root.join(Self::STACK_DIR) }

    pub fn secrets_dir(&self) -> PathBuf { self.root.join(Self::SECRETS_DIR) }

    pub fn tls_secret_backup(&self) -> PathBuf { self.secrets_dir().join(Self::TLS_SECRET_BACKUP) }

    /// Deployment manifest for a service, e.g. `stack/api-deployment.yaml`.
    pub fn deployment_manifest(&self, service: &str) -> PathBuf {
        self.stack_dir().join(format!("{}-deployment.yaml", service))
    }
}
