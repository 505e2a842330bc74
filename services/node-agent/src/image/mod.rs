//! Image acquisition and extraction.
//!
//! This module handles:
//! - Pulling images from registries into a durable local archive cache
//! - Deduplicating concurrent pulls of the same reference
//! - Extracting an archived image's layers into a container directory

mod archive;
mod fetch;
mod layers;
mod manager;
mod oci;
mod reference;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::StoreError;

pub use archive::{blob_file_name, unpack, ArchiveWriter, MANIFEST_FILE_NAME};
pub use fetch::{ImageFetcher, PullAuth, PullImageOpts, PullLog, RegistryFetcher, PULL_LOG_PREFIX};
pub use layers::{
    is_supported_layer, unpack_layer, MEDIA_TYPE_DOCKER_LAYER_GZIP, MEDIA_TYPE_OCI_LAYER_GZIP,
};
pub use manager::{ImageManager, ImageManagerConfig, CONTAINER_DIR_NAME, IMAGE_DIR_NAME};
pub use oci::{
    Descriptor, Manifest, OciClient, OciConfig, OciError, Platform, RegistryAuth,
};
pub use reference::{
    archive_location, archive_path_from_location, parse_image_ref, sanitize_file_name,
    ImageReference, ARCHIVE_TRANSPORT,
};

/// Errors from image operations.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry error: {0}")]
    Oci(#[from] OciError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("unsupport image {image} layer {digest} media type:{media_type}")]
    UnsupportedMediaType {
        image: String,
        digest: String,
        media_type: String,
    },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Pulling {image} timed out after {timeout:?}")]
    Timeout { image: String, timeout: Duration },

    #[error("Image store error: {0}")]
    Store(#[from] StoreError),

    #[error("Image too large: compressed size {size} bytes exceeds limit {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ImageError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<tokio::task::JoinError> for ImageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
