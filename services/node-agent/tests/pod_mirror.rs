//! Pod mirroring against in-memory up and down clusters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvFromSource, Pod, PodSpec, PodStatus, Secret,
    SecretEnvSource, SecretVolumeSource, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use tokio::io::AsyncReadExt;

use nk_node_agent::cluster::{AttachIo, ContainerLogOpts, MemoryCluster, TermSize};
use nk_node_agent::controller::{Action, PodController};
use nk_node_agent::process::ProcessManager;
use nk_node_agent::provider::{Provider, ProviderError, NODE_LABEL};

const NODE: &str = "vk-test";

#[derive(Default)]
struct RecordingProcesses {
    created: Mutex<Vec<String>>,
}

impl RecordingProcesses {
    fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl ProcessManager for RecordingProcesses {
    fn create(&self, pod: &Pod) {
        self.created
            .lock()
            .unwrap()
            .push(pod.metadata.name.clone().unwrap_or_default());
    }
}

struct Harness {
    up: Arc<MemoryCluster>,
    down: Arc<MemoryCluster>,
    processes: Arc<RecordingProcesses>,
    provider: Arc<Provider>,
}

fn harness() -> Harness {
    let up = Arc::new(MemoryCluster::new());
    let down = Arc::new(MemoryCluster::new());
    let processes = Arc::new(RecordingProcesses::default());
    let provider = Provider::new(NODE, up.clone(), down.clone(), processes.clone())
        .with_dependency_timing(Duration::from_millis(10), Duration::from_millis(300));
    Harness {
        up,
        down,
        processes,
        provider: Arc::new(provider),
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        ..Default::default()
    }
}

fn pod(name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            labels: Some([("app".to_string(), name.to_string())].into()),
            ..meta(name)
        },
        spec: Some(PodSpec {
            node_name: Some(NODE.to_string()),
            containers: vec![Container {
                name: "app".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn pod_with_deps(name: &str) -> Pod {
    let mut pod = pod(name, "registry/example:v1");
    let spec = pod.spec.as_mut().unwrap();
    spec.volumes = Some(vec![
        Volume {
            name: "creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("db-creds".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "settings".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: "app-settings".to_string().into(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]);
    spec.containers[0].env_from = Some(vec![EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: "api-token".to_string().into(),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    pod
}

fn secret(name: &str, value: &str) -> Secret {
    Secret {
        metadata: meta(name),
        data: Some([("value".to_string(), ByteString(value.as_bytes().to_vec()))].into()),
        ..Default::default()
    }
}

fn config_map(name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: meta(name),
        data: Some([("value".to_string(), value.to_string())].into()),
        ..Default::default()
    }
}

fn seed_deps(up: &MemoryCluster) {
    up.insert_secret(secret("db-creds", "hunter2")).unwrap();
    up.insert_secret(secret("api-token", "t0k3n")).unwrap();
    up.insert_config_map(config_map("app-settings", "verbose")).unwrap();
}

fn running() -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some("10.1.2.3".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_pod_copies_dependencies_and_mirrors() {
    let h = harness();
    seed_deps(&h.up);
    let up_pod = h.up.insert_pod(pod_with_deps("web")).unwrap();

    h.provider.create_pod(&up_pod).await.unwrap();

    assert_eq!(
        h.down.secret("default", "db-creds").unwrap().data,
        h.up.secret("default", "db-creds").unwrap().data
    );
    assert!(h.down.secret("default", "api-token").is_some());
    assert_eq!(
        h.down.config_map("default", "app-settings").unwrap().data,
        h.up.config_map("default", "app-settings").unwrap().data
    );

    let mirrored = h.down.pod("default", "web").unwrap();
    let labels = mirrored.metadata.labels.as_ref().unwrap();
    assert_eq!(labels.get(NODE_LABEL).map(String::as_str), Some(NODE));
    assert_eq!(labels.get("app").map(String::as_str), Some("web"));
    assert!(mirrored.spec.as_ref().unwrap().node_name.is_none());
    assert_ne!(mirrored.metadata.uid, up_pod.metadata.uid);

    assert_eq!(h.processes.created(), vec!["web".to_string()]);
}

#[tokio::test]
async fn test_create_pod_is_atomic_on_dependency_timeout() {
    let h = harness();
    // Only one of the three dependencies exists upstream
    h.up.insert_secret(secret("db-creds", "hunter2")).unwrap();
    let up_pod = h.up.insert_pod(pod_with_deps("web")).unwrap();

    let err = h.provider.create_pod(&up_pod).await.unwrap_err();
    assert!(
        matches!(err, ProviderError::DependencyTimeout { ref name, .. } if name == "web"),
        "unexpected error: {err}"
    );
    assert!(h.down.pod("default", "web").is_none());
    assert!(h.processes.created().is_empty());
}

#[tokio::test]
async fn test_create_pod_waits_for_late_dependency() {
    let h = harness();
    h.up.insert_secret(secret("db-creds", "hunter2")).unwrap();
    h.up.insert_config_map(config_map("app-settings", "verbose")).unwrap();
    let up_pod = h.up.insert_pod(pod_with_deps("web")).unwrap();

    let up = h.up.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        up.insert_secret(secret("api-token", "t0k3n")).unwrap();
    });

    h.provider.create_pod(&up_pod).await.unwrap();
    assert!(h.down.secret("default", "api-token").is_some());
    assert!(h.down.pod("default", "web").is_some());
}

#[tokio::test]
async fn test_stale_dependency_is_replaced() {
    let h = harness();
    seed_deps(&h.up);
    h.down.insert_secret(secret("db-creds", "old-password")).unwrap();
    let up_pod = h.up.insert_pod(pod_with_deps("web")).unwrap();

    h.provider.create_pod(&up_pod).await.unwrap();

    let copied = h.down.secret("default", "db-creds").unwrap();
    assert_eq!(
        copied.data.unwrap().get("value"),
        Some(&ByteString(b"hunter2".to_vec()))
    );
}

#[tokio::test]
async fn test_create_existing_mirror_is_propagated() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();

    let err = h.provider.create_pod(&up_pod).await.unwrap_err();
    match err {
        ProviderError::Cluster(e) => assert!(e.is_already_exists()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_get_pod_merges_down_status() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();
    assert!(h.down.set_pod_status("default", "web", running()));

    let merged = h.provider.get_pod("default", "web").await.unwrap();
    assert_eq!(merged.metadata.uid, up_pod.metadata.uid);
    assert_eq!(
        merged.spec.as_ref().unwrap().node_name.as_deref(),
        Some(NODE)
    );
    assert_eq!(merged.status, Some(running()));

    let status = h.provider.get_pod_status("default", "web").await.unwrap();
    assert_eq!(status.phase.as_deref(), Some("Running"));
}

#[tokio::test]
async fn test_get_pod_without_mirror_is_not_found() {
    let h = harness();
    h.up.insert_pod(pod("web", "nginx")).unwrap();

    let err = h.provider.get_pod("default", "web").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(
        err,
        ProviderError::PodNotFound { cluster: "down", .. }
    ));
}

#[tokio::test]
async fn test_get_pods_lists_labelled_mirrors() {
    let h = harness();
    for name in ["web", "worker"] {
        let up_pod = h.up.insert_pod(pod(name, "nginx")).unwrap();
        h.provider.create_pod(&up_pod).await.unwrap();
    }
    // Unrelated pod in the down cluster
    h.down.insert_pod(pod("other", "nginx")).unwrap();
    h.down.set_pod_status("default", "worker", running());

    let mut pods = h.provider.get_pods().await.unwrap();
    pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    let names: Vec<_> = pods
        .iter()
        .map(|p| p.metadata.name.as_deref().unwrap())
        .collect();
    assert_eq!(names, ["web", "worker"]);
    assert_eq!(pods[1].status, Some(running()));
}

#[tokio::test]
async fn test_get_pods_fails_when_up_pod_is_gone() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();
    h.up.remove_pod("default", "web");

    let err = h.provider.get_pods().await.unwrap_err();
    assert!(matches!(err, ProviderError::PodNotFound { cluster: "up", .. }));
}

#[tokio::test]
async fn test_update_pod_pushes_mutable_fields() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx:1.25")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();

    let mut changed = up_pod.clone();
    changed.spec.as_mut().unwrap().containers[0].image = Some("nginx:1.27".to_string());
    changed
        .metadata
        .labels
        .as_mut()
        .unwrap()
        .insert("tier".to_string(), "frontend".to_string());
    h.provider.update_pod(&changed).await.unwrap();

    let mirrored = h.down.pod("default", "web").unwrap();
    assert_eq!(
        mirrored.spec.unwrap().containers[0].image.as_deref(),
        Some("nginx:1.27")
    );
    let labels = mirrored.metadata.labels.unwrap();
    assert_eq!(labels.get("tier").map(String::as_str), Some("frontend"));
    assert_eq!(labels.get(NODE_LABEL).map(String::as_str), Some(NODE));
}

#[tokio::test]
async fn test_update_without_mirror_fails() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    let err = h.provider.update_pod(&up_pod).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_pod_is_idempotent() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();

    h.provider.delete_pod(&up_pod).await.unwrap();
    assert!(h.down.pod("default", "web").is_none());
    h.provider.delete_pod(&up_pod).await.unwrap();
}

#[tokio::test]
async fn test_container_logs_pass_through() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();
    h.down.set_logs("default", "web", "app", "one\ntwo\nthree\n");

    let opts = ContainerLogOpts {
        tail: Some(2),
        ..Default::default()
    };
    let mut stream = h
        .provider
        .get_container_logs("default", "web", "app", &opts)
        .await
        .unwrap();
    let mut logs = String::new();
    stream.read_to_string(&mut logs).await.unwrap();
    assert_eq!(logs, "two\nthree\n");
}

#[tokio::test]
async fn test_run_in_container_forwards_streams() {
    let h = harness();
    let up_pod = h.up.insert_pod(pod("web", "nginx")).unwrap();
    h.provider.create_pod(&up_pod).await.unwrap();

    let (stdout, mut output) = tokio::io::duplex(1024);
    let (resize_tx, resize_rx) = tokio::sync::mpsc::channel(4);
    resize_tx
        .send(TermSize {
            width: 120,
            height: 40,
        })
        .await
        .unwrap();

    let io = AttachIo {
        stdin: Some(Box::new(std::io::Cursor::new(b"ping".to_vec()))),
        stdout: Some(Box::new(stdout)),
        tty: true,
        resize: Some(resize_rx),
        ..Default::default()
    };
    let command = vec!["echo".to_string(), "hello".to_string()];
    h.provider
        .run_in_container("default", "web", "app", &command, io)
        .await
        .unwrap();

    let mut seen = String::new();
    output.read_to_string(&mut seen).await.unwrap();
    assert_eq!(seen, "echo hello\nping");
    assert_eq!(
        h.down.term_sizes(),
        vec![TermSize {
            width: 120,
            height: 40
        }]
    );
}

#[tokio::test]
async fn test_controller_dispatches_pod_lifecycle() {
    let h = harness();
    let controller = PodController::new(h.provider.clone());
    assert_eq!(controller.field_selector(), format!("spec.nodeName={NODE}"));

    let up_pod = h.up.insert_pod(pod("web", "nginx:1.25")).unwrap();
    assert_eq!(controller.reconcile(&up_pod).await.unwrap(), Action::Created);

    let mut changed = up_pod.clone();
    changed.spec.as_mut().unwrap().containers[0].image = Some("nginx:1.27".to_string());
    assert_eq!(controller.reconcile(&changed).await.unwrap(), Action::Updated);
    assert_eq!(
        h.down.pod("default", "web").unwrap().spec.unwrap().containers[0]
            .image
            .as_deref(),
        Some("nginx:1.27")
    );

    let mut deleting = changed.clone();
    deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    assert_eq!(controller.reconcile(&deleting).await.unwrap(), Action::Deleted);
    assert!(h.down.pod("default", "web").is_none());
    assert_eq!(h.processes.created().len(), 1);
}

#[test]
fn test_node_selector() {
    let h = harness();
    assert_eq!(h.provider.node_selector(), format!("{NODE_LABEL}={NODE}"));
}
