use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ferry_apply::strip_server_fields;
use ferry_health::wait_namespace_gone;
use ferry_kubehub::Cluster;
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Lifecycle, WaitOptions};

/// Secret preserved across stop/start cycles.
pub const TLS_SECRET_NAME: &str = "tls-secret";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReport {
    pub namespace: String,
    /// Where the TLS secret was saved, if it existed.
    pub backed_up: Option<PathBuf>,
    /// False when the namespace was already gone.
    pub deleted: bool,
}

impl<'a, C: Cluster + ?Sized> Lifecycle<'a, C> {
    /// Save the TLS secret, delete the namespace and wait until it is gone.
    pub async fn stop(&self, wait: &WaitOptions) -> Result<StopReport> {
        let namespace = self.instance.namespace().to_string();
        let backed_up = self.backup_tls_secret(&namespace).await?;
        let deleted = self
            .cluster
            .delete_namespace(&namespace)
            .await
            .with_context(|| format!("deleting namespace {}", namespace))?;
        if deleted {
            info!(namespace = %namespace, "namespace deletion requested");
        } else {
            info!(namespace = %namespace, "namespace already absent");
        }
        if wait.wait {
            let poller = wait.poller(format!("namespace {} deleted", namespace));
            wait_namespace_gone(self.cluster, &namespace, &poller).await?;
        }
        Ok(StopReport { namespace, backed_up, deleted })
    }

    /// Only the lookup is best-effort. A secret that exists but cannot be
    /// saved aborts the stop, since deleting the namespace would lose it.
    async fn backup_tls_secret(&self, namespace: &str) -> Result<Option<PathBuf>> {
        let secret = match self.cluster.get_secret(namespace, TLS_SECRET_NAME).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                debug!(namespace, "no TLS secret to back up");
                return Ok(None);
            }
            Err(e) => {
                warn!(namespace, error = %format!("{:#}", e), "TLS secret lookup failed; continuing without backup");
                return Ok(None);
            }
        };
        let path = self.instance.tls_secret_backup();
        let yaml = secret_manifest(&secret)?;
        write_private(&path, &yaml)
            .with_context(|| format!("saving TLS secret to {}; namespace {} left in place", path.display(), namespace))?;
        info!(path = %path.display(), "saved TLS secret");
        Ok(Some(path))
    }
}

/// Re-appliable YAML for a live secret.
pub(crate) fn secret_manifest(secret: &Secret) -> Result<String> {
    let mut v = strip_server_fields(serde_json::to_value(secret).context("encoding secret")?);
    if let Some(obj) = v.as_object_mut() {
        obj.entry("apiVersion").or_insert_with(|| "v1".into());
        obj.entry("kind").or_insert_with(|| "Secret".into());
    }
    serde_yaml::to_string(&v).context("rendering secret YAML")
}

/// Write `contents` readable by the owner only.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        f.write_all(contents.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut f = fs::File::create(path).with_context(|| format!("opening {}", path.display()))?;
        f.write_all(contents.as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn secret_manifest_drops_server_fields() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(TLS_SECRET_NAME.into()),
                namespace: Some("demo".into()),
                resource_version: Some("4711".into()),
                uid: Some("abc".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("tls.crt".to_string(), ByteString(b"cert".to_vec()))])),
            type_: Some("kubernetes.io/tls".into()),
            ..Default::default()
        };
        let yaml = secret_manifest(&secret).unwrap();
        assert!(yaml.contains("kind: Secret"));
        assert!(yaml.contains("tls.crt"));
        assert!(!yaml.contains("resourceVersion"));
        assert!(!yaml.contains("uid"));
    }

    #[cfg(unix)]
    #[test]
    fn private_file_modes() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secrets").join("s.yaml");
        write_private(&path, "a: 1\n").unwrap();
        write_private(&path, "a: 2\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a: 2\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777, 0o700);
    }
}
