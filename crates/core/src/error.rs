use std::time::Duration;

/// Failures callers need to tell apart. Carried inside `anyhow::Error`;
/// recover with `err.downcast_ref::<FerryError>()`.
#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    #[error("config: {0}")]
    Config(String),
    #[error("parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("no cluster endpoint for kind {0}")]
    UnknownKind(String),
    #[error("{kind}/{name} is namespaced but no namespace was given")]
    NamespaceRequired { kind: String, name: String },
    #[error("apply {kind}/{name} rejected: {reason}")]
    Apply { kind: String, name: String, reason: String },
    #[error("timed out after {}s waiting for {what}; last seen: {last}", waited.as_secs())]
    Timeout { what: String, waited: Duration, last: String },
    #[error("cluster unhealthy: {ready}/{total} nodes ready")]
    ClusterUnhealthy { ready: usize, total: usize },
}

impl FerryError {
    pub fn is_timeout(&self) -> bool { matches!(self, FerryError::Timeout { .. }) }
}
