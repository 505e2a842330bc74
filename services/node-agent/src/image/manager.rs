//! Image cache manager: deduplicated pulls and layer extraction.
//!
//! A pull runs at most once per reference at a time. Concurrent callers for
//! the same reference wait on the running pull's completion signal and then
//! re-check the store, so a failed pull is simply retried by the next caller.
//!
//! Archive paths are derived from the reference name. When two references
//! sanitize to the same file name, the later one gets a path suffixed with a
//! hash of its cache key. Store calls run on the blocking pool since a put
//! waits for an fsync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::archive::{blob_file_name, unpack, MANIFEST_FILE_NAME};
use super::fetch::{ImageFetcher, PullAuth, PullImageOpts, PullLog};
use super::layers::{is_supported_layer, unpack_layer};
use super::oci::Manifest;
use super::reference::{archive_location, archive_path_from_location, ImageReference};
use super::ImageError;
use crate::state::{ImageRecord, ImageStore, StoreError};

/// Directory under an extraction workdir holding the unpacked archive.
pub const IMAGE_DIR_NAME: &str = "image";
/// Directory under an extraction workdir holding the merged root filesystem.
pub const CONTAINER_DIR_NAME: &str = "container";

/// Configuration for the image manager.
#[derive(Debug, Clone)]
pub struct ImageManagerConfig {
    /// Directory holding pulled image archives.
    pub image_dir: PathBuf,
    /// Directory receiving per-pull log files.
    pub log_dir: PathBuf,
    /// Deadline applied when a pull does not specify one.
    pub default_timeout: Duration,
}

impl ImageManagerConfig {
    pub fn new(image_dir: impl Into<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            image_dir: image_dir.into(),
            log_dir: std::env::temp_dir(),
            default_timeout,
        }
    }
}

/// Pulls images into the local cache and extracts them for containers.
pub struct ImageManager {
    config: ImageManagerConfig,
    store: Arc<ImageStore>,
    fetcher: Arc<dyn ImageFetcher>,
    /// In-flight pulls keyed by cache key.
    sessions: Mutex<HashMap<String, watch::Receiver<bool>>>,
    /// Archive paths written by in-flight pulls, with the key writing them.
    claims: Mutex<HashMap<PathBuf, String>>,
}

/// Registration of an in-flight pull.
///
/// Dropping it (on completion, failure or cancellation) removes the
/// registration and wakes every waiter.
struct PullSession<'a> {
    sessions: &'a Mutex<HashMap<String, watch::Receiver<bool>>>,
    key: String,
    done: watch::Sender<bool>,
}

impl Drop for PullSession<'_> {
    fn drop(&mut self) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.done.send_replace(true);
    }
}

/// Exclusive use of an archive path for the length of a pull.
struct DestClaim<'a> {
    claims: &'a Mutex<HashMap<PathBuf, String>>,
    path: PathBuf,
}

impl Drop for DestClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

enum Session<'a> {
    Owner(PullSession<'a>),
    Wait(watch::Receiver<bool>),
}

impl ImageManager {
    pub fn new(
        config: ImageManagerConfig,
        store: Arc<ImageStore>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            sessions: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ImageManagerConfig {
        &self.config
    }

    /// Ensure an image is in the local cache.
    ///
    /// Returns once a record for the reference is durably stored. The whole
    /// call, including time spent waiting on another caller's pull, is bounded
    /// by the timeout.
    pub async fn pull_image(&self, opts: PullImageOpts) -> Result<(), ImageError> {
        let reference = ImageReference::parse(&opts.image)?;
        let timeout = opts.timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, self.pull_loop(&reference, &opts.auth)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(image = %reference, timeout_secs = timeout.as_secs(), "Image pull timed out");
                Err(ImageError::Timeout {
                    image: reference.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn pull_loop(
        &self,
        reference: &ImageReference,
        auth: &PullAuth,
    ) -> Result<(), ImageError> {
        let key = reference.key();
        loop {
            if self.has_record(key).await? {
                debug!(image = %reference, "Image cache hit");
                return Ok(());
            }

            match self.join_session(key) {
                Session::Wait(mut done) => {
                    debug!(image = %reference, "Image pull in progress, waiting");
                    // An error means the owner is gone, which also ends the wait
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Session::Owner(session) => {
                    // Another pull may have finished between the check and the registration
                    if self.has_record(key).await? {
                        return Ok(());
                    }
                    return self.pull_once(reference, auth, session).await;
                }
            }
        }
    }

    fn join_session(&self, key: &str) -> Session<'_> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = sessions.get(key) {
            return Session::Wait(done.clone());
        }

        let (tx, rx) = watch::channel(false);
        sessions.insert(key.to_string(), rx);
        Session::Owner(PullSession {
            sessions: &self.sessions,
            key: key.to_string(),
            done: tx,
        })
    }

    async fn pull_once(
        &self,
        reference: &ImageReference,
        auth: &PullAuth,
        _session: PullSession<'_>,
    ) -> Result<(), ImageError> {
        let image_dir = &self.config.image_dir;
        tokio::fs::create_dir_all(image_dir)
            .await
            .map_err(|e| ImageError::io(image_dir, e))?;

        let claim = self.claim_dest(reference).await?;
        let dest = claim.path.clone();

        let mut log = PullLog::create(&self.config.log_dir)
            .await
            .map_err(|e| ImageError::io(&self.config.log_dir, e))?;

        info!(
            image = %reference,
            dest = %dest.display(),
            log = %log.path().display(),
            "Pulling image"
        );

        let start = Instant::now();
        let result = self.fetcher.fetch(reference, auth, &dest, &mut log).await;
        log.close().await;

        match result {
            Ok(()) => {
                let key = reference.key().to_string();
                let location = archive_location(&dest);
                self.with_store(move |store| store.put(&key, &location))
                    .await?;
                drop(claim);
                info!(
                    image = %reference,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Image pulled"
                );
                Ok(())
            }
            Err(e) => {
                warn!(image = %reference, error = %e, "Image pull failed");
                Err(e)
            }
        }
    }

    /// Pick the archive path for a pull and hold it until the pull ends.
    async fn claim_dest(&self, reference: &ImageReference) -> Result<DestClaim<'_>, ImageError> {
        let image_dir = &self.config.image_dir;
        let key = reference.key();

        let plain = reference.archive_path(image_dir);
        if let Some(claim) = self.claim(&plain, key) {
            let location = archive_location(&plain);
            let taken = match self.with_store(move |store| store.owner_of(&location)).await? {
                Some(owner) => owner != key,
                // Left by an abandoned pull, which may still be writing it
                None => tokio::fs::try_exists(&plain).await.unwrap_or(false),
            };
            if !taken {
                return Ok(claim);
            }
        }

        let unique = reference.unique_archive_path(image_dir);
        debug!(
            image = %reference,
            taken = %plain.display(),
            dest = %unique.display(),
            "Archive name in use by another image"
        );
        self.claim(&unique, key).ok_or_else(|| {
            ImageError::io(
                &unique,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "archive path in use"),
            )
        })
    }

    fn claim(&self, path: &Path, key: &str) -> Option<DestClaim<'_>> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims.get(path).is_some_and(|owner| owner != key) {
            return None;
        }
        claims.insert(path.to_path_buf(), key.to_string());
        Some(DestClaim {
            claims: &self.claims,
            path: path.to_path_buf(),
        })
    }

    async fn has_record(&self, key: &str) -> Result<bool, ImageError> {
        let key = key.to_string();
        self.with_store(move |store| store.has(&key)).await
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, ImageError>
    where
        T: Send + 'static,
        F: FnOnce(&ImageStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Whether a record exists for an image.
    pub fn is_pulled(&self, image: &str) -> Result<bool, ImageError> {
        let reference = ImageReference::parse(image)?;
        Ok(self.store.has(reference.key())?)
    }

    /// Unpack a cached image into `workdir`.
    ///
    /// The archive lands in `workdir/image` and the layers are applied in
    /// manifest order onto `workdir/container`.
    pub async fn extract_image(&self, image: &str, workdir: &Path) -> Result<(), ImageError> {
        let reference = ImageReference::parse(image)?;
        let key = reference.key().to_string();
        let location = self
            .with_store(move |store| store.get(&key))
            .await?
            .ok_or_else(|| ImageError::NotFound(reference.to_string()))?;
        let archive = archive_path_from_location(&location)?;

        let name = reference.to_string();
        let workdir = workdir.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(&name, &archive, &workdir)).await?
    }

    /// All cached image records.
    pub fn list_images(&self) -> Result<Vec<ImageRecord>, ImageError> {
        Ok(self.store.list()?)
    }

    /// Close the backing store.
    pub fn close(&self) -> Result<(), ImageError> {
        Ok(self.store.close()?)
    }
}

fn extract_blocking(image: &str, archive: &Path, workdir: &Path) -> Result<(), ImageError> {
    if !archive.is_file() {
        return Err(ImageError::NotFound(format!(
            "archive {} for {image}",
            archive.display()
        )));
    }

    let image_dir = workdir.join(IMAGE_DIR_NAME);
    let container_dir = workdir.join(CONTAINER_DIR_NAME);

    match std::fs::remove_dir_all(&image_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ImageError::io(&image_dir, e)),
    }
    unpack(archive, &image_dir).map_err(|e| ImageError::io(&image_dir, e))?;

    let manifest_path = image_dir.join(MANIFEST_FILE_NAME);
    let raw = std::fs::read(&manifest_path).map_err(|e| ImageError::io(&manifest_path, e))?;
    let manifest: Manifest = serde_json::from_slice(&raw)?;

    // Reject before touching the rootfs so a bad image never half-applies
    if let Some(layer) = manifest
        .layers
        .iter()
        .find(|layer| !is_supported_layer(&layer.media_type))
    {
        return Err(ImageError::UnsupportedMediaType {
            image: image.to_string(),
            digest: layer.digest.clone(),
            media_type: layer.media_type.clone(),
        });
    }

    std::fs::create_dir_all(&container_dir).map_err(|e| ImageError::io(&container_dir, e))?;
    for (i, layer) in manifest.layers.iter().enumerate() {
        let name = blob_file_name(&layer.digest).map_err(|e| ImageError::io(&image_dir, e))?;
        let layer_path = image_dir.join(name);
        debug!(image = %image, layer = i, digest = %layer.digest, "Applying layer");
        unpack_layer(&layer_path, &container_dir).map_err(|e| ImageError::io(&layer_path, e))?;
    }

    info!(
        image = %image,
        layers = manifest.layers.len(),
        rootfs = %container_dir.display(),
        "Image extracted"
    );
    Ok(())
}
