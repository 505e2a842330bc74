//! Pod mirroring between the up and down clusters.
//!
//! A pod bound to the virtual node has two copies: the authoritative one in
//! the up cluster and the running one in the down cluster. Writes flow up to
//! down; reads merge the up spec with the down status.

mod deps;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{
    object_key, AttachIo, ClusterError, ContainerLogOpts, DownCluster, LogStream, UpCluster,
};
use crate::process::ProcessManager;

pub use deps::{DependencySet, DependencySyncer};

/// Label carried by every mirrored pod, valued with the virtual node name.
pub const NODE_LABEL: &str = "native-kubelet.io/node";

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Timed out after {elapsed:?} syncing dependencies of pod {namespace}/{name}")]
    DependencyTimeout {
        namespace: String,
        name: String,
        elapsed: Duration,
    },

    #[error("Pod {namespace}/{name} not found in the {cluster} cluster")]
    PodNotFound {
        namespace: String,
        name: String,
        cluster: &'static str,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::PodNotFound { .. } => true,
            Self::Cluster(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Copy of `pod` suitable for creating in the down cluster.
///
/// Server-managed metadata, the status and the node binding are removed and
/// the node label is set.
pub fn trim_pod(pod: &Pod, node_name: &str) -> Pod {
    let mut trimmed = pod.clone();

    let meta = &mut trimmed.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.labels
        .get_or_insert_with(Default::default)
        .insert(NODE_LABEL.to_string(), node_name.to_string());

    trimmed.status = None;
    if let Some(spec) = trimmed.spec.as_mut() {
        spec.node_name = None;
    }
    trimmed
}

/// Mirrors pods of one virtual node into the down cluster.
pub struct Provider {
    node_name: String,
    up: Arc<dyn UpCluster>,
    down: Arc<dyn DownCluster>,
    deps: DependencySyncer,
    processes: Arc<dyn ProcessManager>,
}

impl Provider {
    pub fn new(
        node_name: impl Into<String>,
        up: Arc<dyn UpCluster>,
        down: Arc<dyn DownCluster>,
        processes: Arc<dyn ProcessManager>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            deps: DependencySyncer::new(up.clone(), down.clone()),
            up,
            down,
            processes,
        }
    }

    /// Override the dependency sync retry interval and deadline.
    pub fn with_dependency_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.deps = self.deps.with_timing(interval, timeout);
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Label selector matching this node's mirrored pods.
    pub fn node_selector(&self) -> String {
        format!("{NODE_LABEL}={}", self.node_name)
    }

    /// Sync the pod's dependencies, hand it to the process manager and create
    /// its mirror.
    ///
    /// Nothing is created downstream when the dependencies cannot be synced.
    pub async fn create_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        info!(namespace = %namespace, pod = %name, node = %self.node_name, "Creating pod");

        self.deps.sync_pod(pod).await.inspect_err(|e| {
            warn!(namespace = %namespace, pod = %name, error = %e, "Dependency sync failed");
        })?;

        self.processes.create(pod);

        self.down
            .create_pod(&trim_pod(pod, &self.node_name))
            .await
            .inspect_err(|e| {
                warn!(namespace = %namespace, pod = %name, error = %e, "Failed to create pod");
            })?;
        Ok(())
    }

    /// Push changes of the up pod to its mirror.
    pub async fn update_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        debug!(namespace = %namespace, pod = %name, "Updating pod");

        self.down
            .update_pod(&trim_pod(pod, &self.node_name))
            .await
            .inspect_err(|e| {
                warn!(namespace = %namespace, pod = %name, error = %e, "Failed to update pod");
            })?;
        Ok(())
    }

    /// Delete the mirror. An already absent mirror counts as deleted.
    pub async fn delete_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        info!(namespace = %namespace, pod = %name, "Deleting pod");

        match self.down.delete_pod(&namespace, &name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, pod = %name, "Pod already gone downstream");
                Ok(())
            }
            Err(e) => {
                warn!(namespace = %namespace, pod = %name, error = %e, "Failed to delete pod");
                Err(e.into())
            }
        }
    }

    /// The up pod with its status replaced by the mirror's status.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ProviderError> {
        let mut pod = self
            .up
            .get_pod(namespace, name)
            .await?
            .ok_or_else(|| not_found(namespace, name, "up"))?;
        let down = self
            .down
            .get_pod(namespace, name)
            .await?
            .ok_or_else(|| not_found(namespace, name, "down"))?;

        pod.status = down.status;
        Ok(pod)
    }

    /// Whether a mirror of the pod exists downstream.
    pub async fn is_mirrored(&self, namespace: &str, name: &str) -> Result<bool, ProviderError> {
        Ok(self.down.get_pod(namespace, name).await?.is_some())
    }

    pub async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodStatus, ProviderError> {
        Ok(self.get_pod(namespace, name).await?.status.unwrap_or_default())
    }

    /// All pods mirrored by this node, merged with their up spec.
    ///
    /// Fails if any mirrored pod no longer exists upstream.
    pub async fn get_pods(&self) -> Result<Vec<Pod>, ProviderError> {
        let mirrored = self.down.list_pods(&self.node_selector()).await?;

        let mut pods = Vec::with_capacity(mirrored.len());
        for down in mirrored {
            let (namespace, name) = object_key("Pod", &down.metadata)?;
            let mut pod = self.up.get_pod(&namespace, &name).await?.ok_or_else(|| {
                warn!(namespace = %namespace, pod = %name, "Mirrored pod missing upstream");
                not_found(&namespace, &name, "up")
            })?;
            pod.status = down.status;
            pods.push(pod);
        }
        Ok(pods)
    }

    pub async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> Result<LogStream, ProviderError> {
        debug!(namespace = %namespace, pod = %pod, container = %container, "Streaming container logs");
        Ok(self
            .down
            .container_logs(namespace, pod, container, opts)
            .await?)
    }

    pub async fn run_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        io: AttachIo,
    ) -> Result<(), ProviderError> {
        debug!(
            namespace = %namespace,
            pod = %pod,
            container = %container,
            command = ?command,
            tty = io.tty,
            "Running command in container"
        );
        Ok(self
            .down
            .exec(namespace, pod, container, command, io)
            .await?)
    }
}

fn not_found(namespace: &str, name: &str, cluster: &'static str) -> ProviderError {
    ProviderError::PodNotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
        cluster,
    }
}
