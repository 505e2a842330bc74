//! Kubernetes API implementation of the cluster traits.

use std::fmt::Debug;

use async_trait::async_trait;
use futures_util::SinkExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams, TerminalSize};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    merge_pod_update, object_key, AttachIo, ClusterError, ContainerLogOpts, DownCluster,
    LogStream, UpCluster,
};

const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// Cluster access through a `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        match self.api::<K>(namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create<K>(&self, kind: &'static str, obj: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let (namespace, name) = object_key(kind, obj.meta())?;
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| write_error(kind, &namespace, &name, e))
    }

    async fn replace<K>(&self, kind: &'static str, obj: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let (namespace, name) = object_key(kind, obj.meta())?;
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| write_error(kind, &namespace, &name, e))
    }
}

/// Map API status codes onto the cluster error kinds callers branch on.
fn write_error(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: ae.message,
        },
        other => ClusterError::Kube(other),
    }
}

fn log_params(container: &str, opts: &ContainerLogOpts) -> LogParams {
    // since_time is sent as a relative offset
    let since_seconds = opts.since_seconds.or_else(|| {
        opts.since_time
            .map(|t| (chrono::Utc::now() - t).num_seconds().max(1))
    });

    LogParams {
        container: Some(container.to_string()),
        follow: opts.follow,
        limit_bytes: opts.limit_bytes,
        previous: opts.previous,
        since_seconds,
        tail_lines: opts.tail,
        timestamps: opts.timestamps,
        ..LogParams::default()
    }
}

#[async_trait]
impl UpCluster for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.get_opt(namespace, name).await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        self.get_opt(namespace, name).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        self.get_opt(namespace, name).await
    }
}

#[async_trait]
impl DownCluster for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.get_opt(namespace, name).await
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.create("Pod", pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        let api: Api<Pod> = self.api(&namespace);

        let current = api
            .get(&name)
            .await
            .map_err(|e| write_error("Pod", &namespace, &name, e))?;

        let Some(merged) = merge_pod_update(&current, pod) else {
            debug!(namespace = %namespace, pod = %name, "Pod unchanged, skipping update");
            return Ok(current);
        };

        api.replace(&name, &PostParams::default(), &merged)
            .await
            .map_err(|e| write_error("Pod", &namespace, &name, e))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| write_error("Pod", namespace, name, e))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        self.get_opt(namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        self.create("Secret", secret).await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        self.replace("Secret", secret).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        self.get_opt(namespace, name).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        self.create("ConfigMap", config_map).await
    }

    async fn replace_config_map(
        &self,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ClusterError> {
        self.replace("ConfigMap", config_map).await
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> Result<LogStream, ClusterError> {
        let api: Api<Pod> = self.api(namespace);
        let params = log_params(container, opts);
        let name = pod.to_string();
        let (reader, mut writer) = tokio::io::duplex(LOG_BUFFER_SIZE);
        let (opened_tx, opened_rx) = oneshot::channel();

        // The stream borrows the Api, so both live in the copy task
        tokio::spawn(async move {
            let stream = match api.log_stream(&name, &params).await {
                Ok(stream) => {
                    let _ = opened_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };

            let mut stream = Box::pin(stream);
            let mut buf = vec![0u8; 8192];
            loop {
                match futures_util::AsyncReadExt::read(&mut stream, &mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        // Reader gone
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(pod = %name, error = %e, "Container log stream failed");
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        opened_rx
            .await
            .map_err(|_| ClusterError::Stream("log stream task exited".to_string()))?
            .map_err(|e| write_error("Pod", namespace, pod, e))?;

        Ok(Box::new(reader))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        io: AttachIo,
    ) -> Result<(), ClusterError> {
        let AttachIo {
            stdin,
            stdout,
            stderr,
            tty,
            resize,
        } = io;

        let params = AttachParams::default()
            .container(container)
            .stdin(stdin.is_some())
            .stdout(stdout.is_some())
            .stderr(stderr.is_some() && !tty)
            .tty(tty);

        let mut attached = self
            .api::<Pod>(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| write_error("Pod", namespace, pod, e))?;

        let status = attached.take_status();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();

        if let (Some(mut input), Some(mut remote)) = (stdin, attached.stdin()) {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut input, &mut remote).await {
                    debug!(error = %e, "Exec stdin closed");
                }
                let _ = remote.shutdown().await;
            });
        }

        if let (Some(mut sizes), Some(mut remote)) = (resize, attached.terminal_size()) {
            tokio::spawn(async move {
                while let Some(size) = sizes.recv().await {
                    let size = TerminalSize {
                        width: size.width,
                        height: size.height,
                    };
                    if remote.send(size).await.is_err() {
                        break;
                    }
                }
            });
        }

        let copy_stdout = async {
            if let (Some(mut out), Some(mut remote)) = (stdout, remote_stdout) {
                tokio::io::copy(&mut remote, &mut out).await?;
                out.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let copy_stderr = async {
            if let (Some(mut err), Some(mut remote)) = (stderr, remote_stderr) {
                tokio::io::copy(&mut remote, &mut err).await?;
                err.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::try_join!(copy_stdout, copy_stderr)
            .map_err(|e| ClusterError::Stream(e.to_string()))?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(ClusterError::Exec(status.message.unwrap_or_default()));
                }
            }
        }

        attached
            .join()
            .await
            .map_err(|e| ClusterError::Stream(e.to_string()))
    }
}
