//! Access to the two Kubernetes clusters the agent bridges.
//!
//! The *up* cluster is the one that sees the virtual node; pods, secrets and
//! config maps are read from it. The *down* cluster is where mirrored pods
//! actually run.

mod client;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub use client::KubeCluster;
pub use memory::MemoryCluster;

/// Errors from cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Command failed: {0}")]
    Exec(String),

    #[error("Invalid object: {0}")]
    Invalid(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Write conflicts, including creates racing another writer.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } | Self::Conflict { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}

/// Options for streaming container logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogOpts {
    /// Lines from the end of the log to start at.
    pub tail: Option<i64>,
    /// Stop after this many bytes.
    pub limit_bytes: Option<i64>,
    /// Only entries newer than this many seconds.
    pub since_seconds: Option<i64>,
    /// Only entries newer than this instant.
    pub since_time: Option<DateTime<Utc>>,
    pub timestamps: bool,
    pub follow: bool,
    /// Logs of the previous container instance.
    pub previous: bool,
}

/// A readable container log.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Terminal dimensions forwarded to an interactive exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub width: u16,
    pub height: u16,
}

/// Streams wired to an exec session.
#[derive(Default)]
pub struct AttachIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Allocate a TTY. With a TTY, stderr is merged into stdout.
    pub tty: bool,
    /// Terminal resize events.
    pub resize: Option<mpsc::Receiver<TermSize>>,
}

/// Read access to the cluster that owns the virtual node.
#[async_trait]
pub trait UpCluster: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError>;
}

/// The cluster mirrored pods run in.
#[async_trait]
pub trait DownCluster: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;

    /// List pods in all namespaces matching a label selector.
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    /// Apply the mutable fields of `pod` to the stored pod.
    ///
    /// The implementation reads the current object and supplies its
    /// resourceVersion; see [`merge_pod_update`].
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError>;

    async fn replace_config_map(&self, config_map: &ConfigMap)
        -> Result<ConfigMap, ClusterError>;

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> Result<LogStream, ClusterError>;

    /// Run a command in a container, wiring the given streams until it exits.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        io: AttachIo,
    ) -> Result<(), ClusterError>;
}

/// Namespace and name of an object, or an error naming what is missing.
pub fn object_key(
    kind: &'static str,
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Result<(String, String), ClusterError> {
    let name = meta
        .name
        .clone()
        .ok_or_else(|| ClusterError::Invalid(format!("{kind} without a name")))?;
    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

/// Copy the fields Kubernetes allows changing on a running pod from
/// `desired` onto `current`.
///
/// Labels and annotations are merged key by key, so entries added by the
/// other cluster's controllers survive. Returns `None` when nothing would
/// change.
pub fn merge_pod_update(current: &Pod, desired: &Pod) -> Option<Pod> {
    let mut merged = current.clone();

    overlay(&mut merged.metadata.labels, &desired.metadata.labels);
    overlay(&mut merged.metadata.annotations, &desired.metadata.annotations);

    if let (Some(spec), Some(desired_spec)) = (merged.spec.as_mut(), desired.spec.as_ref()) {
        for container in spec.containers.iter_mut() {
            if let Some(image) = desired_spec
                .containers
                .iter()
                .find(|c| c.name == container.name)
                .and_then(|c| c.image.clone())
            {
                container.image = Some(image);
            }
        }
        if let (Some(init), Some(desired_init)) = (
            spec.init_containers.as_mut(),
            desired_spec.init_containers.as_ref(),
        ) {
            for container in init.iter_mut() {
                if let Some(image) = desired_init
                    .iter()
                    .find(|c| c.name == container.name)
                    .and_then(|c| c.image.clone())
                {
                    container.image = Some(image);
                }
            }
        }
        spec.active_deadline_seconds = desired_spec.active_deadline_seconds;
        spec.tolerations = desired_spec.tolerations.clone();
    }

    (merged != *current).then_some(merged)
}

fn overlay(
    current: &mut Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) {
    if let Some(desired) = desired {
        current
            .get_or_insert_with(BTreeMap::new)
            .extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}
