//! Secret and ConfigMap dependencies of a pod.
//!
//! Before a pod can run downstream, every Secret and ConfigMap it references
//! must exist there too. Copies are compared by content hash and replaced
//! when the source has changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvFromSource, EnvVar, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use nk_reconcile::{poll_until, SpecHash, DEFAULT_POLL_INTERVAL, DEFAULT_SYNC_TIMEOUT};
use tracing::{debug, info};

use super::ProviderError;
use crate::cluster::{DownCluster, UpCluster};

/// Names of the Secrets and ConfigMaps a pod references, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    pub secrets: BTreeSet<String>,
    pub config_maps: BTreeSet<String>,
}

/// Insert a reference name; accepts both required and optional name fields.
fn insert(set: &mut BTreeSet<String>, name: impl Into<Option<String>>) {
    if let Some(name) = name.into().filter(|n| !n.is_empty()) {
        set.insert(name);
    }
}

impl DependencySet {
    pub fn from_pod(pod: &Pod) -> Self {
        let mut deps = Self::default();
        let Some(spec) = pod.spec.as_ref() else {
            return deps;
        };

        for volume in spec.volumes.iter().flatten() {
            if let Some(secret) = &volume.secret {
                insert(&mut deps.secrets, secret.secret_name.clone());
            }
            if let Some(config_map) = &volume.config_map {
                insert(&mut deps.config_maps, config_map.name.clone());
            }
            let projections = volume
                .projected
                .iter()
                .flat_map(|p| p.sources.iter().flatten());
            for projection in projections {
                if let Some(secret) = &projection.secret {
                    insert(&mut deps.secrets, secret.name.clone());
                }
                if let Some(config_map) = &projection.config_map {
                    insert(&mut deps.config_maps, config_map.name.clone());
                }
            }
        }

        for pull_secret in spec.image_pull_secrets.iter().flatten() {
            insert(&mut deps.secrets, pull_secret.name.clone());
        }

        let containers = spec
            .init_containers
            .iter()
            .flatten()
            .chain(spec.containers.iter())
            .map(|c: &Container| (c.env.as_deref(), c.env_from.as_deref()));
        let ephemeral = spec
            .ephemeral_containers
            .iter()
            .flatten()
            .map(|c| (c.env.as_deref(), c.env_from.as_deref()));

        for (env, env_from) in containers.chain(ephemeral) {
            deps.add_env(env.unwrap_or_default(), env_from.unwrap_or_default());
        }

        deps
    }

    fn add_env(&mut self, env: &[EnvVar], env_from: &[EnvFromSource]) {
        for source in env.iter().filter_map(|e| e.value_from.as_ref()) {
            if let Some(key_ref) = &source.secret_key_ref {
                insert(&mut self.secrets, key_ref.name.clone());
            }
            if let Some(key_ref) = &source.config_map_key_ref {
                insert(&mut self.config_maps, key_ref.name.clone());
            }
        }
        for source in env_from {
            if let Some(secret_ref) = &source.secret_ref {
                insert(&mut self.secrets, secret_ref.name.clone());
            }
            if let Some(config_map_ref) = &source.config_map_ref {
                insert(&mut self.config_maps, config_map_ref.name.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty() && self.config_maps.is_empty()
    }
}

/// Result of syncing one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Synced {
    Created,
    Replaced,
    UpToDate,
    /// Not visible in the up cluster yet.
    Missing,
}

/// Copy of the metadata a mirrored object keeps.
fn copied_meta(source: &ObjectMeta, namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: source.labels.clone(),
        annotations: source.annotations.clone(),
        ..Default::default()
    }
}

pub(crate) fn secret_hash(secret: &Secret) -> Result<SpecHash, serde_json::Error> {
    Ok(SpecHash::from_json(&serde_json::json!({
        "type": secret.type_,
        "data": serde_json::to_value(&secret.data)?,
        "stringData": secret.string_data,
        "immutable": secret.immutable,
        "labels": secret.metadata.labels,
        "annotations": secret.metadata.annotations,
    })))
}

pub(crate) fn config_map_hash(config_map: &ConfigMap) -> Result<SpecHash, serde_json::Error> {
    Ok(SpecHash::from_json(&serde_json::json!({
        "data": config_map.data,
        "binaryData": serde_json::to_value(&config_map.binary_data)?,
        "immutable": config_map.immutable,
        "labels": config_map.metadata.labels,
        "annotations": config_map.metadata.annotations,
    })))
}

/// Copies a pod's dependencies from the up cluster into the down cluster.
pub struct DependencySyncer {
    up: Arc<dyn UpCluster>,
    down: Arc<dyn DownCluster>,
    interval: Duration,
    timeout: Duration,
}

impl DependencySyncer {
    pub fn new(up: Arc<dyn UpCluster>, down: Arc<dyn DownCluster>) -> Self {
        Self {
            up,
            down,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    /// Override the retry interval and overall deadline.
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Sync every dependency of `pod`, retrying until all are in place or the
    /// deadline passes.
    pub async fn sync_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let deps = DependencySet::from_pod(pod);
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        if deps.is_empty() {
            return Ok(());
        }

        debug!(
            namespace = %namespace,
            pod = %name,
            secrets = deps.secrets.len(),
            config_maps = deps.config_maps.len(),
            "Syncing pod dependencies"
        );

        let resource = format!("dependencies of pod {namespace}/{name}");
        poll_until(&resource, self.interval, self.timeout, || {
            self.sync_once(namespace, &deps)
        })
        .await
        .map_err(|e| match e {
            nk_reconcile::PollError::Timeout { elapsed, .. } => ProviderError::DependencyTimeout {
                namespace: namespace.to_string(),
                name: name.to_string(),
                elapsed,
            },
            nk_reconcile::PollError::Aborted(e) => e,
        })
    }

    /// One pass over all dependencies. `Ok(false)` means retry.
    async fn sync_once(&self, namespace: &str, deps: &DependencySet) -> Result<bool, ProviderError> {
        let mut ready = true;
        for name in &deps.secrets {
            ready &= settle(self.sync_secret(namespace, name).await, "Secret", namespace, name)?;
        }
        for name in &deps.config_maps {
            ready &= settle(
                self.sync_config_map(namespace, name).await,
                "ConfigMap",
                namespace,
                name,
            )?;
        }
        Ok(ready)
    }

    async fn sync_secret(&self, namespace: &str, name: &str) -> Result<Synced, ProviderError> {
        let Some(source) = self.up.get_secret(namespace, name).await? else {
            return Ok(Synced::Missing);
        };

        let copy = Secret {
            metadata: copied_meta(&source.metadata, namespace, name),
            type_: source.type_.clone(),
            data: source.data.clone(),
            string_data: source.string_data.clone(),
            immutable: source.immutable,
        };

        match self.down.get_secret(namespace, name).await? {
            None => {
                self.down.create_secret(&copy).await?;
                Ok(Synced::Created)
            }
            Some(existing) if secret_hash(&existing)? == secret_hash(&copy)? => Ok(Synced::UpToDate),
            Some(existing) => {
                let mut copy = copy;
                copy.metadata.resource_version = existing.metadata.resource_version;
                self.down.replace_secret(&copy).await?;
                Ok(Synced::Replaced)
            }
        }
    }

    async fn sync_config_map(&self, namespace: &str, name: &str) -> Result<Synced, ProviderError> {
        let Some(source) = self.up.get_config_map(namespace, name).await? else {
            return Ok(Synced::Missing);
        };

        let copy = ConfigMap {
            metadata: copied_meta(&source.metadata, namespace, name),
            data: source.data.clone(),
            binary_data: source.binary_data.clone(),
            immutable: source.immutable,
        };

        match self.down.get_config_map(namespace, name).await? {
            None => {
                self.down.create_config_map(&copy).await?;
                Ok(Synced::Created)
            }
            Some(existing) if config_map_hash(&existing)? == config_map_hash(&copy)? => {
                Ok(Synced::UpToDate)
            }
            Some(existing) => {
                let mut copy = copy;
                copy.metadata.resource_version = existing.metadata.resource_version;
                self.down.replace_config_map(&copy).await?;
                Ok(Synced::Replaced)
            }
        }
    }
}

/// Fold one sync result into "ready", "retry" or a fatal error.
fn settle(
    result: Result<Synced, ProviderError>,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<bool, ProviderError> {
    match result {
        Ok(Synced::Missing) => {
            debug!(kind, namespace = %namespace, name = %name, "Dependency not found upstream yet");
            Ok(false)
        }
        Ok(Synced::UpToDate) => Ok(true),
        Ok(outcome) => {
            info!(kind, namespace = %namespace, name = %name, ?outcome, "Dependency mirrored");
            Ok(true)
        }
        Err(ProviderError::Cluster(e)) if e.is_conflict() || e.is_not_found() => {
            debug!(kind, namespace = %namespace, name = %name, error = %e, "Dependency write raced, retrying");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
