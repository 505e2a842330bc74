//! Configuration for the node agent.
//!
//! Agent settings come from the environment; provider settings (work
//! directory and pull timeout) come from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Pull timeout applied when the config file sets none, in minutes.
pub const DEFAULT_MAX_TIMEOUT_MINUTES: u64 = 10;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the virtual node.
    pub node_name: String,

    /// Path of the provider config file.
    pub config_path: PathBuf,

    /// Kubeconfig for the up cluster; in-cluster or `KUBECONFIG` inference when unset.
    pub up_kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the down cluster.
    pub down_kubeconfig: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_name =
            std::env::var("NK_NODE_NAME").unwrap_or_else(|_| "native-kubelet".to_string());

        let config_path = std::env::var("NK_CONFIG_PATH")
            .unwrap_or_else(|_| "/etc/native-kubelet/config.json".to_string())
            .into();

        let up_kubeconfig = std::env::var("NK_UP_KUBECONFIG").ok().map(PathBuf::from);

        let down_kubeconfig = std::env::var("NK_DOWN_KUBECONFIG")
            .context("NK_DOWN_KUBECONFIG must point at the down cluster kubeconfig")?
            .into();

        let log_level = std::env::var("NK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_name,
            config_path,
            up_kubeconfig,
            down_kubeconfig,
            log_level,
        })
    }
}

/// Errors loading the provider config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config {path}: work_dir must not be empty")]
    MissingWorkDir { path: PathBuf },
}

/// Provider settings from the JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Root of all on-disk state.
    pub work_dir: PathBuf,

    /// Default pull timeout in minutes; `0` selects the default.
    #[serde(default)]
    pub max_timeout: u64,

    /// Registries (`host[:port]`) pulled from over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

impl ProviderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingWorkDir {
                path: path.to_path_buf(),
            });
        }
        Ok(config)
    }

    /// Directory holding the image database.
    pub fn data_dir(&self) -> PathBuf {
        self.work_dir.join("data")
    }

    /// Directory holding pulled image archives.
    pub fn images_dir(&self) -> PathBuf {
        self.work_dir.join("images")
    }

    /// Directory holding per-container working directories.
    pub fn pods_dir(&self) -> PathBuf {
        self.work_dir.join("pods")
    }

    pub fn default_pull_timeout(&self) -> Duration {
        let minutes = match self.max_timeout {
            0 => DEFAULT_MAX_TIMEOUT_MINUTES,
            m => m,
        };
        Duration::from_secs(minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_provider_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"work_dir": "/var/lib/nk", "max_timeout": 3}"#);

        let config = ProviderConfig::load(&path).unwrap();
        assert_eq!(config.images_dir(), PathBuf::from("/var/lib/nk/images"));
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/nk/data"));
        assert_eq!(config.pods_dir(), PathBuf::from("/var/lib/nk/pods"));
        assert_eq!(config.default_pull_timeout(), Duration::from_secs(180));
        assert!(config.insecure_registries.is_empty());
    }

    #[test]
    fn test_insecure_registries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"work_dir": "/w", "insecure_registries": ["registry.local:5000"]}"#,
        );
        let config = ProviderConfig::load(&path).unwrap();
        assert_eq!(config.insecure_registries, vec!["registry.local:5000".to_string()]);
    }

    #[rstest]
    #[case(r#"{"work_dir": "/w", "max_timeout": 0}"#)]
    #[case(r#"{"work_dir": "/w"}"#)]
    fn test_default_timeout(#[case] body: &str) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProviderConfig::load(&write_config(dir.path(), body)).unwrap();
        assert_eq!(config.default_pull_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ProviderConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
        assert!(matches!(
            ProviderConfig::load(&write_config(dir.path(), "{not json")),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            ProviderConfig::load(&write_config(dir.path(), r#"{"work_dir": ""}"#)),
            Err(ConfigError::MissingWorkDir { .. })
        ));
    }
}
