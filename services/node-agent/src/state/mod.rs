//! Local state persistence for the node agent.
//!
//! This module provides SQLite-based storage for the image cache index:
//! one record per pulled image reference, pointing at the local archive.
//!
//! The store is the sole source of truth for "is this image already pulled"
//! and survives agent restarts.

mod store;

pub use store::{ImageRecord, ImageStore, StoreError, DB_FILE_NAME};
