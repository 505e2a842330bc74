//! In-process cluster used for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus, Secret};
use kube::Resource;
use tokio::io::AsyncWriteExt;

use super::{
    merge_pod_update, object_key, AttachIo, ClusterError, ContainerLogOpts, DownCluster,
    LogStream, TermSize, UpCluster,
};

type Key = (String, String);

#[derive(Default)]
struct State {
    pods: BTreeMap<Key, Pod>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    logs: HashMap<(String, String, String), Vec<u8>>,
    term_sizes: Vec<TermSize>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// A cluster held in memory.
///
/// Objects get a fresh resourceVersion on every write. Replaces carrying a
/// stale resourceVersion fail with a conflict, like the API server.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn create_in<K>(
    state: &mut State,
    map: fn(&mut State) -> &mut BTreeMap<Key, K>,
    kind: &'static str,
    obj: &K,
) -> Result<K, ClusterError>
where
    K: Resource + Clone,
{
    let (namespace, name) = object_key(kind, obj.meta())?;
    if map(state).contains_key(&key(&namespace, &name)) {
        return Err(ClusterError::AlreadyExists {
            kind,
            namespace,
            name,
        });
    }

    let version = state.next_version();
    let mut stored = obj.clone();
    let meta = stored.meta_mut();
    meta.namespace = Some(namespace.clone());
    meta.uid = Some(format!("{namespace}-{name}-{version}"));
    meta.resource_version = Some(version);
    map(state).insert(key(&namespace, &name), stored.clone());
    Ok(stored)
}

fn replace_in<K>(
    state: &mut State,
    map: fn(&mut State) -> &mut BTreeMap<Key, K>,
    kind: &'static str,
    obj: &K,
) -> Result<K, ClusterError>
where
    K: Resource + Clone,
{
    let (namespace, name) = object_key(kind, obj.meta())?;
    let Some(current) = map(state).get(&key(&namespace, &name)) else {
        return Err(ClusterError::NotFound {
            kind,
            namespace,
            name,
        });
    };

    let current_version = current.meta().resource_version.clone();
    let uid = current.meta().uid.clone();
    if obj.meta().resource_version.is_some() && obj.meta().resource_version != current_version {
        return Err(ClusterError::Conflict {
            kind,
            namespace,
            name,
            message: "the object has been modified".to_string(),
        });
    }

    let version = state.next_version();
    let mut stored = obj.clone();
    let meta = stored.meta_mut();
    meta.namespace = Some(namespace.clone());
    meta.uid = uid;
    meta.resource_version = Some(version);
    map(state).insert(key(&namespace, &name), stored.clone());
    Ok(stored)
}

/// Whether `labels` satisfy an equality-based selector (`a=b,c!=d,e`).
pub(crate) fn matches_selector(
    labels: Option<&BTreeMap<String, String>>,
    selector: &str,
) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a pod.
    pub fn insert_pod(&self, pod: Pod) -> Result<Pod, ClusterError> {
        let mut state = self.lock();
        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        state.pods.remove(&key(&namespace, &name));
        create_in(&mut state, |s| &mut s.pods, "Pod", &pod)
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.get(&key(namespace, name)).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.lock().pods.values().cloned().collect()
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.remove(&key(namespace, name))
    }

    /// Overwrite a pod's status, as a kubelet would. Returns false when the pod is absent.
    pub fn set_pod_status(&self, namespace: &str, name: &str, status: PodStatus) -> bool {
        let mut state = self.lock();
        let version = state.next_version();
        match state.pods.get_mut(&key(namespace, name)) {
            Some(pod) => {
                pod.status = Some(status);
                pod.metadata.resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    /// Insert or overwrite a secret.
    pub fn insert_secret(&self, secret: Secret) -> Result<Secret, ClusterError> {
        let mut state = self.lock();
        let (namespace, name) = object_key("Secret", &secret.metadata)?;
        state.secrets.remove(&key(&namespace, &name));
        create_in(&mut state, |s| &mut s.secrets, "Secret", &secret)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    /// Insert or overwrite a config map.
    pub fn insert_config_map(&self, config_map: ConfigMap) -> Result<ConfigMap, ClusterError> {
        let mut state = self.lock();
        let (namespace, name) = object_key("ConfigMap", &config_map.metadata)?;
        state.config_maps.remove(&key(&namespace, &name));
        create_in(&mut state, |s| &mut s.config_maps, "ConfigMap", &config_map)
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.get(&key(namespace, name)).cloned()
    }

    /// Set the log contents served for a container.
    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, logs: impl Into<Vec<u8>>) {
        self.lock().logs.insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            logs.into(),
        );
    }

    /// Terminal sizes received by exec sessions, oldest first.
    pub fn term_sizes(&self) -> Vec<TermSize> {
        self.lock().term_sizes.clone()
    }

    fn require_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        if self.lock().pods.contains_key(&key(namespace, name)) {
            Ok(())
        } else {
            Err(ClusterError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        }
    }
}

#[async_trait]
impl UpCluster for MemoryCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pod(namespace, name))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Ok(self.secret(namespace, name))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        Ok(self.config_map(namespace, name))
    }
}

#[async_trait]
impl DownCluster for MemoryCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pod(namespace, name))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|pod| matches_selector(pod.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        create_in(&mut self.lock(), |s| &mut s.pods, "Pod", pod)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let (namespace, name) = object_key("Pod", &pod.metadata)?;
        let mut state = self.lock();
        let Some(current) = state.pods.get(&key(&namespace, &name)).cloned() else {
            return Err(ClusterError::NotFound {
                kind: "Pod",
                namespace,
                name,
            });
        };
        match merge_pod_update(&current, pod) {
            Some(merged) => replace_in(&mut state, |s| &mut s.pods, "Pod", &merged),
            None => Ok(current),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        match self.lock().pods.remove(&key(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        create_in(&mut self.lock(), |s| &mut s.secrets, "Secret", secret)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        replace_in(&mut self.lock(), |s| &mut s.secrets, "Secret", secret)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        create_in(&mut self.lock(), |s| &mut s.config_maps, "ConfigMap", config_map)
    }

    async fn replace_config_map(
        &self,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ClusterError> {
        replace_in(&mut self.lock(), |s| &mut s.config_maps, "ConfigMap", config_map)
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> Result<LogStream, ClusterError> {
        self.require_pod(namespace, pod)?;
        let mut logs = self
            .lock()
            .logs
            .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
            .cloned()
            .unwrap_or_default();

        if let Some(tail) = opts.tail {
            let text = String::from_utf8_lossy(&logs).into_owned();
            let lines: Vec<&str> = text.lines().collect();
            let skip = lines.len().saturating_sub(usize::try_from(tail).unwrap_or(0));
            logs = lines[skip..]
                .iter()
                .flat_map(|line| format!("{line}\n").into_bytes())
                .collect();
        }
        if let Some(limit) = opts.limit_bytes {
            logs.truncate(usize::try_from(limit).unwrap_or(0));
        }

        Ok(Box::new(std::io::Cursor::new(logs)))
    }

    /// Echoes the command line, then stdin, to stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
        io: AttachIo,
    ) -> Result<(), ClusterError> {
        self.require_pod(namespace, pod)?;
        let AttachIo {
            stdin,
            stdout,
            resize,
            ..
        } = io;

        if let Some(mut out) = stdout {
            let io_err = |e: std::io::Error| ClusterError::Stream(e.to_string());
            out.write_all(format!("{}\n", command.join(" ")).as_bytes())
                .await
                .map_err(io_err)?;
            if let Some(mut input) = stdin {
                tokio::io::copy(&mut input, &mut out).await.map_err(io_err)?;
            }
            out.shutdown().await.map_err(io_err)?;
        }

        if let Some(mut sizes) = resize {
            while let Ok(size) = sizes.try_recv() {
                self.lock().term_sizes.push(size);
            }
        }
        Ok(())
    }
}
