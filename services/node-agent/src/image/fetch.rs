//! Network copy of an image into the local archive cache.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::archive::{blob_file_name, ArchiveWriter};
use super::oci::{Descriptor, OciClient, OciConfig, RegistryAuth};
use super::reference::ImageReference;
use super::ImageError;

/// File name prefix of per-pull log files.
pub const PULL_LOG_PREFIX: &str = "native-kubelet-pullImage";

/// Registry credentials and transport options for a pull.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PullAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued bearer token; takes precedence over username/password.
    pub bearer_token: Option<String>,
    pub user_agent: Option<String>,
    pub insecure_skip_tls_verify: bool,
}

impl PullAuth {
    fn registry_auth(&self) -> RegistryAuth {
        if let Some(token) = &self.bearer_token {
            return RegistryAuth::Bearer(token.clone());
        }
        match (&self.username, &self.password) {
            (Some(username), password) => RegistryAuth::Basic {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            },
            _ => RegistryAuth::Anonymous,
        }
    }
}

impl fmt::Debug for PullAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

/// Options for [`ImageManager::pull_image`](super::ImageManager::pull_image).
#[derive(Debug, Clone, Default)]
pub struct PullImageOpts {
    /// Image reference, optionally transport-prefixed (`docker://nginx:1.27`).
    pub image: String,
    pub auth: PullAuth,
    /// Overall deadline for the call. `None` uses the manager default.
    pub timeout: Option<Duration>,
}

impl PullImageOpts {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, auth: PullAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Private progress log of one pull.
pub struct PullLog {
    path: PathBuf,
    file: tokio::fs::File,
}

impl PullLog {
    /// Create a uniquely named log file inside `dir`.
    pub async fn create(dir: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let suffix: u64 = rand::rng().random();
        let path = dir.join(format!("{PULL_LOG_PREFIX}-{suffix}"));
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Write failures are logged and otherwise ignored.
    pub async fn line(&mut self, message: impl fmt::Display) {
        let line = format!("{} {message}\n", chrono::Utc::now().to_rfc3339());
        if let Err(e) = self.file.write_all(line.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write pull log");
        }
    }

    /// Flush and close the log.
    pub async fn close(mut self) {
        if let Err(e) = self.file.flush().await {
            warn!(path = %self.path.display(), error = %e, "Failed to flush pull log");
        }
    }
}

/// Copies an image from its source into a local archive at `dest`.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(
        &self,
        reference: &ImageReference,
        auth: &PullAuth,
        dest: &Path,
        log: &mut PullLog,
    ) -> Result<(), ImageError>;
}

/// Fetcher speaking the OCI Distribution protocol.
pub struct RegistryFetcher {
    base: OciConfig,
    /// Registries reached over plain HTTP.
    plain_http: Vec<String>,
}

impl RegistryFetcher {
    /// `base` supplies platform, size and timeout limits; the registry URL
    /// and credentials are filled in per pull.
    pub fn new(base: OciConfig) -> Self {
        Self {
            base,
            plain_http: Vec::new(),
        }
    }

    /// Talk to these registries (`host[:port]`) over HTTP instead of HTTPS.
    pub fn with_plain_http<I, S>(mut self, registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plain_http.extend(registries.into_iter().map(Into::into));
        self
    }

    fn registry_url(&self, registry: &str) -> String {
        if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.to_string()
        } else if self.plain_http.iter().any(|host| host == registry) {
            format!("http://{registry}")
        } else {
            format!("https://{registry}")
        }
    }

    fn client_for(&self, registry: &str, auth: &PullAuth) -> Result<OciClient, ImageError> {
        let mut config = self.base.clone();
        config.registry_url = self.registry_url(registry);
        config.auth = auth.registry_auth();
        config.insecure_skip_tls_verify = auth.insecure_skip_tls_verify;
        if auth.user_agent.is_some() {
            config.user_agent = auth.user_agent.clone();
        }
        Ok(OciClient::new(config)?)
    }

    async fn download(
        &self,
        client: &OciClient,
        repo: &str,
        tag: &str,
        staging: StagingDir,
        dest: &Path,
        log: &mut PullLog,
    ) -> Result<(), ImageError> {
        let (manifest, raw_manifest) = client.pull_manifest(repo, tag).await?;

        let total_compressed = manifest.total_layer_size();
        if total_compressed > self.base.max_compressed_size {
            return Err(ImageError::ImageTooLarge {
                size: total_compressed,
                limit: self.base.max_compressed_size,
            });
        }

        log.line(format!(
            "manifest {repo}:{tag}: {} layers, {total_compressed} bytes",
            manifest.layers.len()
        ))
        .await;

        let blobs: Vec<&Descriptor> = std::iter::once(&manifest.config)
            .chain(manifest.layers.iter())
            .collect();

        let mut files = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let name =
                blob_file_name(&blob.digest).map_err(|e| ImageError::io(staging.path(), e))?;
            let path = staging.path().join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                // Manifests may list the same blob more than once
                debug!(digest = %blob.digest, "Blob already staged");
                continue;
            }
            log.line(format!("copying blob {} ({} bytes)", blob.digest, blob.size))
                .await;
            client.pull_blob(repo, &blob.digest, &path).await?;
            files.push((blob.digest.clone(), path));
        }

        log.line("writing archive").await;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), ImageError> {
            // Blobs stay on disk until the archive is complete
            let _staging = staging;
            let pack = || -> std::io::Result<()> {
                let mut writer = ArchiveWriter::create(&dest)?;
                writer.append_manifest(&raw_manifest)?;
                for (digest, path) in &files {
                    writer.append_blob(digest, path)?;
                }
                writer.finish()
            };
            pack().map_err(|e| ImageError::io(&dest, e))
        })
        .await??;

        Ok(())
    }
}

#[async_trait]
impl ImageFetcher for RegistryFetcher {
    async fn fetch(
        &self,
        reference: &ImageReference,
        auth: &PullAuth,
        dest: &Path,
        log: &mut PullLog,
    ) -> Result<(), ImageError> {
        let (registry, repo, tag) = reference.registry_parts()?;
        let client = self.client_for(&registry, auth)?;

        let staging = StagingDir::create(dest).await?;

        info!(
            image = %reference,
            registry = %registry,
            repo = %repo,
            "Pulling image from registry"
        );
        log.line(format!("pulling {reference} from {registry}")).await;

        let result = self.download(&client, &repo, &tag, staging, dest, log).await;

        match &result {
            Ok(()) => log.line("done").await,
            Err(e) => log.line(format!("failed: {e}")).await,
        }
        result
    }
}

/// Directory holding blobs of one in-progress pull of `dest`.
///
/// Each pull gets its own directory so a pull abandoned on timeout never
/// shares files with its retry. The directory is removed on drop.
pub(crate) struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    async fn create(dest: &Path) -> Result<Self, ImageError> {
        let suffix: u64 = rand::rng().random();
        let path = staging_dir(dest, suffix);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ImageError::io(&path, e))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

fn staging_dir(dest: &Path, suffix: u64) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(format!(".partial-{suffix:016x}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_precedence() {
        let auth = PullAuth {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            bearer_token: Some("tok".to_string()),
            ..Default::default()
        };
        assert_eq!(auth.registry_auth(), RegistryAuth::Bearer("tok".to_string()));

        let auth = PullAuth {
            username: Some("user".to_string()),
            ..Default::default()
        };
        assert_eq!(
            auth.registry_auth(),
            RegistryAuth::Basic {
                username: "user".to_string(),
                password: String::new()
            }
        );

        assert_eq!(PullAuth::default().registry_auth(), RegistryAuth::Anonymous);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = PullAuth {
            password: Some("hunter2".to_string()),
            bearer_token: Some("secret-token".to_string()),
            ..Default::default()
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_registry_url_scheme() {
        let fetcher =
            RegistryFetcher::new(OciConfig::default()).with_plain_http(["registry.local:5000"]);
        assert_eq!(fetcher.registry_url("registry.local:5000"), "http://registry.local:5000");
        assert_eq!(fetcher.registry_url("ghcr.io"), "https://ghcr.io");
        assert_eq!(fetcher.registry_url("http://other:80"), "http://other:80");
    }

    #[test]
    fn test_staging_dir() {
        assert_eq!(
            staging_dir(Path::new("/w/images/app-v1.tar.gz"), 0xab),
            PathBuf::from("/w/images/app-v1.tar.gz.partial-00000000000000ab")
        );
    }

    #[tokio::test]
    async fn test_staging_dir_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("app.tar.gz");

        let first = StagingDir::create(&dest).await.unwrap();
        let second = StagingDir::create(&dest).await.unwrap();
        assert_ne!(first.path(), second.path());
        std::fs::write(first.path().join("blob"), b"data").unwrap();

        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
        assert!(second.path().exists());
    }

    #[tokio::test]
    async fn test_pull_log_files_are_unique() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut a = PullLog::create(dir.path()).await.unwrap();
        let b = PullLog::create(dir.path()).await.unwrap();
        assert_ne!(a.path(), b.path());

        a.line("hello").await;
        let path = a.path().to_path_buf();
        a.close().await;
        b.close().await;

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.ends_with("hello\n"));
        let names = file_names(dir.path());
        assert!(names.iter().all(|n| n.starts_with(PULL_LOG_PREFIX)));
    }

    fn file_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}
