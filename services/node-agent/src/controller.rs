//! Watch loop feeding up-cluster pod events to the provider.
//!
//! The controller:
//! - Watches pods bound to the virtual node (`spec.nodeName=<node>`)
//! - Creates a mirror for pods not yet mirrored, updates the rest
//! - Deletes the mirror once the up pod is being deleted or is gone

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::object_key;
use crate::provider::{Provider, ProviderError};

/// What the controller did with a pod event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

/// Dispatches pod events of one virtual node.
pub struct PodController {
    provider: Arc<Provider>,
}

impl PodController {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Field selector for pods scheduled onto this node.
    pub fn field_selector(&self) -> String {
        format!("spec.nodeName={}", self.provider.node_name())
    }

    /// Bring the mirror of `pod` in line with the up object.
    pub async fn reconcile(&self, pod: &Pod) -> Result<Action, ProviderError> {
        if pod.metadata.deletion_timestamp.is_some() {
            self.provider.delete_pod(pod).await?;
            return Ok(Action::Deleted);
        }

        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        if self.provider.is_mirrored(&namespace, &name).await? {
            self.provider.update_pod(pod).await?;
            Ok(Action::Updated)
        } else {
            self.provider.create_pod(pod).await?;
            Ok(Action::Created)
        }
    }

    /// Run the watch loop until shutdown.
    pub async fn run(&self, pods: Api<Pod>, mut shutdown: watch::Receiver<bool>) {
        let config = watcher::Config::default().fields(&self.field_selector());
        info!(node = %self.provider.node_name(), "Starting pod watch");

        let mut events = watcher(pods, config).default_backoff().boxed();

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(Ok(event)) => self.handle(event).await,
                        Some(Err(e)) => warn!(error = %e, "Pod watch error"),
                        None => {
                            warn!("Pod watch stream ended");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pod controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                self.log_outcome(&pod, self.reconcile(&pod).await);
            }
            watcher::Event::Delete(pod) => {
                let result = self.provider.delete_pod(&pod).await.map(|()| Action::Deleted);
                self.log_outcome(&pod, result);
            }
            watcher::Event::Init => debug!("Pod watch resync started"),
            watcher::Event::InitDone => debug!("Pod watch resync done"),
        }
    }

    fn log_outcome(&self, pod: &Pod, result: Result<Action, ProviderError>) {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        match result {
            Ok(action) => debug!(namespace = %namespace, pod = %name, ?action, "Pod reconciled"),
            Err(e) => warn!(namespace = %namespace, pod = %name, error = %e, "Pod reconcile failed"),
        }
    }
}
