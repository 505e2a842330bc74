//! native-kubelet node agent
//!
//! Registers pods bound to a virtual node in the up cluster and mirrors them
//! into the down cluster.
//!
//! ## Architecture
//!
//! - **Pod Controller**: Watches up-cluster pods bound to the node
//! - **Provider**: Syncs dependencies and mirrors pods downstream
//! - **Image Manager**: Deduplicated pulls into the local archive cache
//! - **Image Preparer**: Unpacks container images for the process runtime

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nk_node_agent::cluster::KubeCluster;
use nk_node_agent::config::{Config, ProviderConfig};
use nk_node_agent::image::{ImageManager, ImageManagerConfig, OciConfig, RegistryFetcher};
use nk_node_agent::process::ImagePreparer;
use nk_node_agent::{ImageStore, PodController, Provider};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins over NK_LOG_LEVEL
    let level = std::env::var("NK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting native-kubelet node agent");

    let config = Config::from_env()?;
    let provider_config = ProviderConfig::load(&config.config_path)?;
    info!(
        node = %config.node_name,
        config_path = %config.config_path.display(),
        work_dir = %provider_config.work_dir.display(),
        log_level = %config.log_level,
        "Configuration loaded"
    );

    let up_client = match &config.up_kubeconfig {
        Some(path) => client_from_kubeconfig(path).await?,
        None => Client::try_default()
            .await
            .context("Failed to infer up cluster config")?,
    };
    let down_client = client_from_kubeconfig(&config.down_kubeconfig).await?;

    let store = Arc::new(ImageStore::open(provider_config.data_dir())?);
    let fetcher = Arc::new(
        RegistryFetcher::new(OciConfig::default())
            .with_plain_http(provider_config.insecure_registries.iter().cloned()),
    );
    let images = Arc::new(ImageManager::new(
        ImageManagerConfig::new(
            provider_config.images_dir(),
            provider_config.default_pull_timeout(),
        ),
        Arc::clone(&store),
        fetcher,
    ));
    let preparer = ImagePreparer::new(Arc::clone(&images), provider_config.pods_dir());

    let provider = Arc::new(Provider::new(
        config.node_name.clone(),
        Arc::new(KubeCluster::new(up_client.clone())),
        Arc::new(KubeCluster::new(down_client)),
        Arc::new(preparer),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = PodController::new(Arc::clone(&provider));
    let mut controller_handle = tokio::spawn(async move {
        controller.run(Api::all(up_client), shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Pod controller task panicked");
            } else {
                info!("Pod controller exited");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !controller_handle.is_finished() {
        info!("Waiting for pod controller to shut down...");
        let _ = controller_handle.await;
    }

    images.close()?;
    info!("Node agent shutdown complete");
    Ok(())
}

async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("Invalid kubeconfig {}", path.display()))?;
    Ok(Client::try_from(config)?)
}
