use crate::config::Config;
use crate::server::{ServerState, router};
use craqfs_core::{BlockCoordinator, ChainManager, HttpTransport, LocalBlockStore, Result, Transport};
use std::sync::Arc;

/// One running replica: local store, chain manager and HTTP surface.
pub struct StorageNode {
    config: Config,
    coordinator: Arc<BlockCoordinator>,
}

impl StorageNode {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(LocalBlockStore::new(
            config.local.data_path.clone(),
            config.capacity_bytes(),
        )?);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
        let chain = Arc::new(ChainManager::new(
            config.node.id.clone(),
            config.chain_settings(),
            store.clone(),
            transport,
        )?);
        for node in config.chain_nodes() {
            chain.add_node(&node.id, &node.address).await?;
        }

        let coordinator = Arc::new(BlockCoordinator::new(store, Some(chain)));
        Ok(Self {
            config,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &Arc<BlockCoordinator> {
        &self.coordinator
    }

    /// Serves until ctrl-c or SIGTERM, then shuts the node down.
    pub async fn start(&self) -> Result<()> {
        self.coordinator.initialize().await?;

        let app = router(Arc::new(ServerState::new(self.coordinator.clone())));
        let listener = tokio::net::TcpListener::bind(&self.config.node.listen_address).await?;
        tracing::info!(
            "Node {} listening on {} (advertised as {})",
            self.config.node.id,
            self.config.node.listen_address,
            self.config.node.effective_address()
        );

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        let stopped = self.stop().await;

        served?;
        stopped
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("Stopping node {}", self.config.node.id);
        self.coordinator.shutdown().await
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {}", error);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
