//! native-kubelet node agent library
//!
//! The agent registers as a virtual node in one cluster (the up cluster) and
//! mirrors every pod scheduled onto it into a second cluster (the down
//! cluster), copying the Secrets and ConfigMaps the pod references first.
//! Container images are pulled into a local cache and unpacked for the local
//! process runtime.
//!
//! ## Modules
//!
//! - `cluster`: Up/down cluster access (kube client and in-memory)
//! - `controller`: Watch loop dispatching pod events
//! - `image`: Image pulls, local archive cache and extraction
//! - `process`: Hand-off of pods to the process runtime
//! - `provider`: Pod mirroring and dependency sync
//! - `state`: Local SQLite image records

pub mod cluster;
pub mod config;
pub mod controller;
pub mod image;
pub mod process;
pub mod provider;
pub mod state;

pub use controller::PodController;
pub use image::{ImageManager, ImageManagerConfig};
pub use provider::{Provider, ProviderError};
pub use state::ImageStore;
