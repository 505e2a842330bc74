//! OCI registry client for pulling images by tag or digest.
//!
//! This module implements the pull side of the OCI Distribution
//! Specification: manifest and blob fetches, manifest list platform
//! selection, and the bearer token handshake registries answer a 401 with.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::io;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Errors from OCI operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Unexpected registry response {status} for {url}")]
    UnexpectedStatus { status: StatusCode, url: String },

    #[error("No manifest for platform {os}/{architecture}")]
    NoMatchingPlatform { os: String, architecture: String },

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Pull timeout")]
    Timeout,
}

/// Credentials presented to a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    /// No credentials; anonymous tokens are still negotiated.
    #[default]
    Anonymous,
    /// Username and password, sent as basic auth or exchanged for a token.
    Basic { username: String, password: String },
    /// A pre-issued bearer token.
    Bearer(String),
}

/// Configuration for OCI client.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Registry URL (e.g., "https://registry-1.docker.io").
    pub registry_url: String,
    /// Registry credentials.
    pub auth: RegistryAuth,
    /// User agent override.
    pub user_agent: Option<String>,
    /// Accept invalid TLS certificates from the registry.
    pub insecure_skip_tls_verify: bool,
    /// Per-request timeout for establishing a blob download.
    pub layer_timeout: Duration,
    /// Max compressed image size.
    pub max_compressed_size: u64,
    /// Platform selected from manifest lists.
    pub platform: Platform,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://registry-1.docker.io".to_string(),
            auth: RegistryAuth::Anonymous,
            user_agent: None,
            insecure_skip_tls_verify: false,
            layer_timeout: Duration::from_secs(300),      // 5 minutes
            max_compressed_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            platform: Platform::host(),
        }
    }
}

/// OCI Distribution client.
pub struct OciClient {
    config: OciConfig,
    client: Client,
    /// Token negotiated from a `WWW-Authenticate` challenge.
    token: Mutex<Option<String>>,
}

impl OciClient {
    /// Create a new OCI client.
    pub fn new(config: OciConfig) -> Result<Self, OciError> {
        let mut builder = Client::builder().danger_accept_invalid_certs(config.insecure_skip_tls_verify);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        } else {
            builder = builder.user_agent(concat!("native-kubelet/", env!("CARGO_PKG_VERSION")));
        }

        Ok(Self {
            client: builder.build()?,
            token: Mutex::new(match &config.auth {
                RegistryAuth::Bearer(token) => Some(token.clone()),
                _ => None,
            }),
            config,
        })
    }

    /// Pull the image manifest for a tag or digest.
    ///
    /// Manifest lists are resolved to the configured platform. Returns the
    /// parsed manifest together with its raw bytes.
    pub async fn pull_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Manifest, Vec<u8>), OciError> {
        let (media_type, body) = self.fetch_manifest(repo, reference).await?;

        if is_index(&media_type, &body)? {
            let index: ManifestIndex = serde_json::from_slice(&body)?;
            let selected = index.select(&self.config.platform).ok_or_else(|| {
                OciError::NoMatchingPlatform {
                    os: self.config.platform.os.clone(),
                    architecture: self.config.platform.architecture.clone(),
                }
            })?;

            debug!(
                repo = %repo,
                digest = %selected.digest,
                "Resolved manifest list to platform manifest"
            );

            let digest = selected.digest.clone();
            let (_, body) = self.fetch_manifest(repo, &digest).await?;
            let manifest: Manifest = serde_json::from_slice(&body)?;
            return Ok((manifest, body));
        }

        let manifest: Manifest = serde_json::from_slice(&body)?;
        Ok((manifest, body))
    }

    async fn fetch_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(String, Vec<u8>), OciError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, repo, reference
        );

        debug!(url = %url, "Pulling manifest");

        let accept = [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ]
        .join(", ");

        let response = self
            .send(|| self.client.get(&url).header(ACCEPT, accept.as_str()))
            .await?;

        match response.status() {
            StatusCode::OK => {
                let media_type = content_type(response.headers());
                let body = response.bytes().await?.to_vec();

                // Only digest references can be verified
                if reference.starts_with("sha256:") {
                    let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
                    if computed != reference {
                        return Err(OciError::DigestMismatch {
                            expected: reference.to_string(),
                            actual: computed,
                        });
                    }
                }

                Ok((media_type, body))
            }
            StatusCode::NOT_FOUND => Err(OciError::NotFound(format!("{repo}:{reference}"))),
            StatusCode::UNAUTHORIZED => Err(OciError::AuthRequired),
            status => Err(OciError::UnexpectedStatus { status, url }),
        }
    }

    /// Pull a blob by digest to a file, verifying its sha256 digest.
    pub async fn pull_blob(&self, repo: &str, digest: &str, dest: &Path) -> Result<u64, OciError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.registry_url, repo, digest);

        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let mut response = tokio::time::timeout(
            self.config.layer_timeout,
            self.send(|| self.client.get(&url)),
        )
        .await
        .map_err(|_| OciError::Timeout)??;

        match response.status() {
            StatusCode::OK => {
                if let Some(size) = response.content_length() {
                    if size > self.config.max_compressed_size {
                        return Err(OciError::TooLarge {
                            size,
                            limit: self.config.max_compressed_size,
                        });
                    }
                }

                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                // Download to temporary file, then rename
                let temp_path = dest.with_extension("tmp");
                let mut file = tokio::fs::File::create(&temp_path).await?;
                let mut hasher = Sha256::new();
                let mut total_bytes = 0u64;

                while let Some(chunk) = response.chunk().await? {
                    total_bytes += chunk.len() as u64;
                    if total_bytes > self.config.max_compressed_size {
                        drop(file);
                        tokio::fs::remove_file(&temp_path).await.ok();
                        return Err(OciError::TooLarge {
                            size: total_bytes,
                            limit: self.config.max_compressed_size,
                        });
                    }
                    hasher.update(&chunk);
                    file.write_all(&chunk).await?;
                }
                file.sync_all().await?;
                drop(file);

                let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
                if computed != digest {
                    tokio::fs::remove_file(&temp_path).await.ok();
                    return Err(OciError::DigestMismatch {
                        expected: digest.to_string(),
                        actual: computed,
                    });
                }

                tokio::fs::rename(&temp_path, dest).await?;

                info!(
                    digest = %digest,
                    size = total_bytes,
                    "Blob downloaded"
                );

                Ok(total_bytes)
            }
            StatusCode::NOT_FOUND => Err(OciError::NotFound(digest.to_string())),
            StatusCode::UNAUTHORIZED => Err(OciError::AuthRequired),
            status => Err(OciError::UnexpectedStatus { status, url }),
        }
    }

    /// Send a request, negotiating a bearer token once if the registry asks for one.
    async fn send<F>(&self, build: F) -> Result<Response, OciError>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = self.authorize(build()).await.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge).await?;
        *self.token.lock().await = Some(token);
        Ok(self.authorize(build()).await.send().await?)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = self.token.lock().await.as_ref() {
            return request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        match &self.config.auth {
            RegistryAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            _ => request,
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, OciError> {
        debug!(realm = %challenge.realm, scope = ?challenge.scope, "Requesting registry token");

        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let mut request = self.client.get(&challenge.realm).query(&query);
        if let RegistryAuth::Basic { username, password } = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OciError::AuthRequired);
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or(OciError::AuthRequired)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header.strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        // Values are quoted and may themselves contain commas (scope lists)
        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=')?;
            let after = after.trim_start();
            let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            } else {
                let end = after.find(',').unwrap_or(after.len());
                (&after[..end], &after[end..])
            };
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
            rest = remainder.trim_start_matches([',', ' ']);
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_default()
}

fn is_index(media_type: &str, body: &[u8]) -> Result<bool, OciError> {
    if media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST {
        return Ok(true);
    }
    // Some registries answer with a generic content type
    let value: serde_json::Value = serde_json::from_slice(body)?;
    Ok(value.get("manifests").is_some() && value.get("layers").is_none())
}

/// OCI image manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Manifest list / image index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub manifests: Vec<IndexEntry>,
}

/// One platform entry of a manifest list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

impl ManifestIndex {
    /// Pick the entry for `platform`, ignoring the variant when no exact match exists.
    pub fn select(&self, platform: &Platform) -> Option<&IndexEntry> {
        let same_os_arch = |entry: &&IndexEntry| {
            entry.platform.as_ref().is_some_and(|p| {
                p.os == platform.os && p.architecture == platform.architecture
            })
        };

        self.manifests
            .iter()
            .filter(same_os_arch)
            .find(|entry| {
                entry.platform.as_ref().and_then(|p| p.variant.as_deref())
                    == platform.variant.as_deref()
            })
            .or_else(|| self.manifests.iter().find(same_os_arch))
    }
}

/// Target platform of an image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// Platform of the running host, in OCI naming.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        let variant = (architecture == "arm64").then(|| "v8".to_string());
        Self {
            architecture: architecture.to_string(),
            os: std::env::consts::OS.to_string(),
            variant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(os: &str, arch: &str, variant: Option<&str>) -> Platform {
        Platform {
            architecture: arch.to_string(),
            os: os.to_string(),
            variant: variant.map(str::to_string),
        }
    }

    #[test]
    fn test_manifest_total_size() {
        let manifest = Manifest {
            schema_version: 2,
            media_type: None,
            config: Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                digest: "sha256:config".to_string(),
                size: 1000,
            },
            layers: vec![
                Descriptor {
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                    digest: "sha256:layer1".to_string(),
                    size: 5000,
                },
                Descriptor {
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                    digest: "sha256:layer2".to_string(),
                    size: 3000,
                },
            ],
        };

        assert_eq!(manifest.total_layer_size(), 8000);
    }

    #[test]
    fn test_bearer_challenge_parse() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();

        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn test_bearer_challenge_rejects_basic() {
        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
    }

    #[test]
    fn test_index_selects_platform() {
        let index: ManifestIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {"digest": "sha256:arm", "mediaType": MEDIA_TYPE_OCI_MANIFEST, "size": 1,
                 "platform": {"architecture": "arm", "os": "linux", "variant": "v7"}},
                {"digest": "sha256:arm64", "mediaType": MEDIA_TYPE_OCI_MANIFEST, "size": 1,
                 "platform": {"architecture": "arm64", "os": "linux"}},
                {"digest": "sha256:amd64", "mediaType": MEDIA_TYPE_OCI_MANIFEST, "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}}
            ]
        }))
        .unwrap();

        let amd64 = index.select(&platform("linux", "amd64", None)).unwrap();
        assert_eq!(amd64.digest, "sha256:amd64");

        // Variant falls back to os/arch match
        let arm64 = index.select(&platform("linux", "arm64", Some("v8"))).unwrap();
        assert_eq!(arm64.digest, "sha256:arm64");

        assert!(index.select(&platform("windows", "amd64", None)).is_none());
    }

    #[test]
    fn test_is_index_by_body() {
        let body = br#"{"schemaVersion":2,"manifests":[]}"#;
        assert!(is_index("application/json", body).unwrap());

        let body = br#"{"schemaVersion":2,"config":{},"layers":[]}"#;
        assert!(!is_index(MEDIA_TYPE_DOCKER_MANIFEST, body).unwrap());
    }
}
