#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use ferry_core::{FerryError, InstanceDir};
use ferry_kubehub::fake::{deployment, namespace, node, observed, pod, Observed};
use ferry_kubehub::FakeCluster;
use ferry_ops::{check_cluster, cluster_status, ImageRef, ImageTarget, Lifecycle, WaitOptions, TLS_SECRET_NAME};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tempfile::TempDir;

const NS: &str = "shopexample";

fn deployment_yaml(replicas: i32) -> String {
    format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: {}\n  template:\n    spec:\n      containers:\n        - name: web\n          image: reg/web:1\n",
        replicas
    )
}

fn instance(tmp: &TempDir, replicas: i32) -> InstanceDir {
    let root = tmp.path().join("shop.example");
    fs::create_dir_all(root.join("stack")).unwrap();
    fs::write(root.join("namespace.yaml"), format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n", NS)).unwrap();
    fs::write(root.join("stack").join("web-deployment.yaml"), deployment_yaml(replicas)).unwrap();
    fs::write(
        root.join("stack").join("web-service.yaml"),
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: web-svc\nspec:\n  ports:\n    - port: 80\n",
    )
    .unwrap();
    InstanceDir::open(root).unwrap()
}

fn waits(secs: u64) -> WaitOptions {
    WaitOptions::new(Duration::from_secs(secs)).with_interval(Duration::from_secs(2))
}

fn tls_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(TLS_SECRET_NAME.into()),
            namespace: Some(NS.into()),
            resource_version: Some("991".into()),
            uid: Some("5f1c".into()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), ByteString(b"cert".to_vec())),
            ("tls.key".to_string(), ByteString(b"key".to_vec())),
        ])),
        type_: Some("kubernetes.io/tls".into()),
        ..Default::default()
    }
}

fn read(path: &Path) -> String { fs::read_to_string(path).unwrap() }

#[tokio::test(start_paused = true)]
async fn start_applies_namespace_then_stack_and_waits() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 2);
    let fake = FakeCluster::new();
    fake.script_pods(NS, [Ok(vec![]), Ok(vec![pod("web-1", "Running", true), pod("web-2", "Running", true)])]);

    let report = Lifecycle::new(&fake, &inst).start(&waits(60)).await.unwrap();
    assert_eq!(report.namespace, NS);
    assert!(!report.restored_tls_secret);
    assert!(report.stack.is_clean());
    assert_eq!(fake.applied_names(), vec![NS, "web", "web-svc"]);
    assert!(fake.applied().iter().skip(1).all(|a| a.namespace.as_deref() == Some(NS)));
    assert_eq!(report.health.map(|h| (h.ready, h.total)), Some((2, 2)));
}

#[tokio::test(start_paused = true)]
async fn start_without_wait_returns_after_apply() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 2);
    let fake = FakeCluster::new();
    let report = Lifecycle::new(&fake, &inst).start(&waits(60).no_wait()).await.unwrap();
    assert!(report.health.is_none());
    assert_eq!(fake.applied().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn start_times_out_when_pods_never_ready() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_pods(NS, [Ok(vec![pod("web-1", "Running", false)])]);
    let err = Lifecycle::new(&fake, &inst).start(&waits(10)).await.unwrap_err();
    assert!(err.downcast_ref::<FerryError>().map(|e| e.is_timeout()).unwrap_or(false), "{:#}", err);
}

#[tokio::test(start_paused = true)]
async fn start_dry_run_skips_wait() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    let report = Lifecycle::new(&fake, &inst).dry_run(true).start(&waits(10)).await.unwrap();
    assert!(report.health.is_none());
    assert!(fake.applied().iter().all(|a| a.dry_run));
}

#[tokio::test(start_paused = true)]
async fn start_reports_broken_stack_files_and_keeps_going() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    fs::write(inst.stack_dir().join("aaa-broken.yaml"), "kind: [").unwrap();
    let fake = FakeCluster::new();
    let report = Lifecycle::new(&fake, &inst).start(&waits(10).no_wait()).await.unwrap();
    assert_eq!(report.stack.failed.len(), 1);
    assert_eq!(report.stack.applied.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_then_start_round_trips_tls_secret() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 2);
    let live = FakeCluster::new();
    Lifecycle::new(&live, &inst).start(&waits(10).no_wait()).await.unwrap();
    live.set_secret(NS, TLS_SECRET_NAME, Ok(Some(tls_secret())));

    let stopped = Lifecycle::new(&live, &inst).stop(&waits(60)).await.unwrap();
    assert!(stopped.deleted);
    assert_eq!(stopped.backed_up.as_deref(), Some(inst.tls_secret_backup().as_path()));
    assert_eq!(live.deleted_namespaces(), vec![NS]);

    let saved = read(&inst.tls_secret_backup());
    assert!(saved.contains("tls.crt"));
    assert!(!saved.contains("resourceVersion"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(inst.tls_secret_backup()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let fresh = FakeCluster::new();
    let started = Lifecycle::new(&fresh, &inst).start(&waits(10).no_wait()).await.unwrap();
    assert!(started.restored_tls_secret);
    assert_eq!(fresh.applied_names(), vec![NS, TLS_SECRET_NAME, "web", "web-svc"]);
    let secret = &fresh.applied()[1];
    assert_eq!(secret.namespace.as_deref(), Some(NS));
    assert_eq!(secret.body["data"]["tls.crt"], "Y2VydA==");
}

#[tokio::test(start_paused = true)]
async fn stop_continues_when_secret_lookup_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_namespace(NS, [Ok(Some(namespace(NS, "Active")))]);
    fake.set_secret(NS, TLS_SECRET_NAME, Err("secrets is forbidden".to_string()));
    let report = Lifecycle::new(&fake, &inst).stop(&waits(60)).await.unwrap();
    assert!(report.backed_up.is_none());
    assert!(report.deleted);
    assert!(!inst.tls_secret_backup().exists());
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_namespace_when_backup_cannot_be_written() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    fs::write(inst.secrets_dir(), "not a directory").unwrap();
    let fake = FakeCluster::new();
    fake.script_namespace(NS, [Ok(Some(namespace(NS, "Active")))]);
    fake.set_secret(NS, TLS_SECRET_NAME, Ok(Some(tls_secret())));

    let err = Lifecycle::new(&fake, &inst).stop(&waits(60)).await.unwrap_err();
    assert!(format!("{:#}", err).contains("saving TLS secret"), "{:#}", err);
    assert!(fake.deleted_namespaces().is_empty());
    assert!(inst.secrets_dir().is_file());
}

#[tokio::test(start_paused = true)]
async fn stop_on_absent_namespace_is_not_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    let report = Lifecycle::new(&fake, &inst).stop(&waits(60)).await.unwrap();
    assert!(!report.deleted);
}

#[tokio::test(start_paused = true)]
async fn stop_times_out_on_stuck_namespace() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_namespace(NS, [Ok(Some(namespace(NS, "Active"))), Ok(Some(namespace(NS, "Terminating")))]);
    let err = Lifecycle::new(&fake, &inst).stop(&waits(20)).await.unwrap_err();
    let fe = err.downcast_ref::<FerryError>().unwrap();
    assert!(fe.is_timeout());
    assert!(fe.to_string().contains("Terminating"));
}

#[tokio::test(start_paused = true)]
async fn update_skips_inactive_namespace() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_namespace(NS, [Ok(Some(namespace(NS, "Terminating")))]);
    let outcome = Lifecycle::new(&fake, &inst).update(&waits(10)).await.unwrap();
    assert!(outcome.is_skipped());
    assert!(fake.applied().is_empty());

    let absent = FakeCluster::new();
    assert!(Lifecycle::new(&absent, &inst).update(&waits(10)).await.unwrap().is_skipped());
}

#[tokio::test(start_paused = true)]
async fn update_applies_stack_into_active_namespace() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_namespace(NS, [Ok(Some(namespace(NS, "Active")))]);
    fake.script_pods(NS, [Ok(vec![pod("web-1", "Running", true)])]);
    let outcome = Lifecycle::new(&fake, &inst).update(&waits(10)).await.unwrap();
    assert!(!outcome.is_skipped());
    assert_eq!(fake.applied_names(), vec!["web", "web-svc"]);
}

#[tokio::test(start_paused = true)]
async fn start_then_scale_two_to_three_replicas() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 2);
    let fake = FakeCluster::new();
    fake.script_pods(NS, [Ok(vec![pod("web-1", "Running", true), pod("web-2", "Running", true)])]);
    Lifecycle::new(&fake, &inst).start(&waits(60)).await.unwrap();

    fs::write(inst.deployment_manifest("web"), deployment_yaml(3)).unwrap();
    let scaled = || {
        let mut d = deployment("web", "web", "reg/web:1", 3);
        d.metadata.generation = Some(2);
        d
    };
    fake.script_deployment(
        NS,
        "web",
        [
            Ok(Some(observed(scaled(), Observed::settled(1, 2)))),
            Ok(Some(observed(scaled(), Observed { generation: 2, updated: 3, available: 2, ready: 2, total: 3 }))),
            Ok(Some(observed(scaled(), Observed::settled(2, 3)))),
        ],
    );
    let report = Lifecycle::new(&fake, &inst).scale("web", &waits(60)).await.unwrap();
    let last = fake.applied().pop().unwrap();
    assert_eq!(last.name, "web");
    assert_eq!(last.body["spec"]["replicas"], 3);
    let rollout = report.rollout.unwrap();
    assert!(rollout.is_complete());
    assert_eq!(rollout.available, 3);
}

#[tokio::test(start_paused = true)]
async fn scale_unknown_service_is_a_parse_error() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    let err = Lifecycle::new(&fake, &inst).scale("cache", &waits(10)).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<FerryError>(), Some(FerryError::Parse { .. })), "{:#}", err);
}

#[tokio::test(start_paused = true)]
async fn update_image_then_revert() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_deployment(NS, "app", [Ok(Some(observed(deployment("app", "app", "reg.example.com/app:1.0", 2), Observed::settled(1, 2))))]);
    let lc = Lifecycle::new(&fake, &inst);
    let target = ImageTarget::default();

    let up = lc.update_image(&target, &ImageRef::new("reg.example.com", "app", "1.1"), &waits(30)).await.unwrap();
    assert_eq!(up.previous.as_deref(), Some("reg.example.com/app:1.0"));
    assert_eq!(up.image, "reg.example.com/app:1.1");
    assert!(up.rollout.unwrap().is_complete());

    let back = lc.revert_image(&target, &ImageRef::new("reg.example.com", "app", "1.0"), &waits(30)).await.unwrap();
    assert_eq!(back.previous.as_deref(), Some("reg.example.com/app:1.1"));

    let patches = fake.patches();
    assert_eq!(patches.len(), 2);
    assert_eq!(patches[0].2.pointer("/spec/template/spec/containers/0/image").unwrap(), "reg.example.com/app:1.1");
    assert_eq!(patches[1].2.pointer("/spec/template/spec/containers/0/name").unwrap(), "app");
}

#[tokio::test(start_paused = true)]
async fn update_image_rejects_unknown_container() {
    let tmp = tempfile::tempdir().unwrap();
    let inst = instance(&tmp, 1);
    let fake = FakeCluster::new();
    fake.script_deployment(NS, "app", [Ok(Some(deployment("app", "app", "r/app:1", 1)))]);
    let target = ImageTarget { deployment: "app".into(), container: "sidecar".into() };
    let err = Lifecycle::new(&fake, &inst)
        .update_image(&target, &ImageRef::new("r", "app", "2"), &waits(10))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("sidecar"));
    assert!(fake.patches().is_empty());
}

#[tokio::test]
async fn cluster_status_counts_and_fails_on_not_ready() {
    let fake = FakeCluster::new();
    fake.set_nodes(vec![node("cp", true, &[]), node("w1", true, &["MemoryPressure"]), node("w2", false, &[])]);
    let report = cluster_status(&fake).await.unwrap();
    assert_eq!(report.summary_line(), "cluster_status: 3 2");
    assert_eq!(report.healthy(), 1);
    assert!(matches!(check_cluster(&report), Err(FerryError::ClusterUnhealthy { ready: 2, total: 3 })));
}
