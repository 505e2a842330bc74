//! Hand-off of pods to the local process runtime.
//!
//! The runtime itself lives outside this crate. What it needs from the agent
//! is each container's image pulled and unpacked into a per-container
//! directory, which [`ImagePreparer`] does in the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use crate::image::{sanitize_file_name, ImageError, ImageManager, PullImageOpts};

/// Receives pods accepted by the provider.
pub trait ProcessManager: Send + Sync {
    /// Start preparing `pod`. Returns immediately; failures are reported
    /// through logs, not to the caller.
    fn create(&self, pod: &Pod);
}

/// Per-container working directory: `<pods_dir>/<namespace>/<pod>/<container>`.
pub fn container_dir(pods_dir: &Path, namespace: &str, pod: &str, container: &str) -> PathBuf {
    pods_dir
        .join(sanitize_file_name(namespace))
        .join(sanitize_file_name(pod))
        .join(sanitize_file_name(container))
}

/// Pulls and extracts the images of every container of a pod.
#[derive(Clone)]
pub struct ImagePreparer {
    images: Arc<ImageManager>,
    pods_dir: PathBuf,
}

impl ImagePreparer {
    pub fn new(images: Arc<ImageManager>, pods_dir: impl Into<PathBuf>) -> Self {
        Self {
            images,
            pods_dir: pods_dir.into(),
        }
    }

    /// Pull and extract all container images of `pod`, init containers included.
    ///
    /// Containers are prepared concurrently; the first error is returned after
    /// all of them finish.
    pub async fn prepare(&self, pod: &Pod) -> Result<(), ImageError> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();

        let containers: Vec<(String, String)> = pod
            .spec
            .iter()
            .flat_map(|spec| {
                spec.init_containers
                    .iter()
                    .flatten()
                    .chain(spec.containers.iter())
            })
            .filter_map(|c| c.image.clone().map(|image| (c.name.clone(), image)))
            .collect();

        let results = join_all(containers.iter().map(|(container, image)| async move {
            let workdir = container_dir(&self.pods_dir, namespace, name, container);
            debug!(
                namespace = %namespace,
                pod = %name,
                container = %container,
                image = %image,
                "Preparing container image"
            );
            self.images.pull_image(PullImageOpts::new(image.as_str())).await?;
            self.images.extract_image(image, &workdir).await
        }))
        .await;

        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        info!(
            namespace = %namespace,
            pod = %name,
            containers = containers.len(),
            "Pod images prepared"
        );
        Ok(())
    }
}

impl ProcessManager for ImagePreparer {
    fn create(&self, pod: &Pod) {
        let preparer = self.clone();
        let pod = pod.clone();
        tokio::spawn(async move {
            if let Err(e) = preparer.prepare(&pod).await {
                warn!(
                    namespace = pod.metadata.namespace.as_deref().unwrap_or("default"),
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "Failed to prepare pod images"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_dir() {
        assert_eq!(
            container_dir(Path::new("/w/pods"), "default", "web", "app"),
            PathBuf::from("/w/pods/default/web/app")
        );
        // Names never escape the pods directory
        assert_eq!(
            container_dir(Path::new("/w/pods"), "..", "a/b", "c"),
            PathBuf::from("/w/pods/-/a-b/c")
        );
    }
}
