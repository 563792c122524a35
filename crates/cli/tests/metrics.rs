#![forbid(unsafe_code)]

use std::time::Duration;

use ferry_health::{wait_instance_ready, Poller};
use ferry_kubehub::fake::pod;
use ferry_kubehub::FakeCluster;
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::test]
async fn exporter_sees_workflow_counters() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).unwrap();

    let fake = FakeCluster::new();
    fake.script_pods("demo", [Ok(vec![pod("web-1", "Running", true)])]);
    let poller = Poller::new("instance demo ready", Duration::from_secs(5));
    wait_instance_ready(&fake, "demo", &poller).await.unwrap();

    let rendered = handle.render();
    assert!(rendered.contains("wait_ok 1"), "{}", rendered);
    assert!(rendered.contains("wait_latency_ms"), "{}", rendered);
}
