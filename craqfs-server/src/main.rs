mod config;
mod node;
mod server;

use clap::{Parser, Subcommand};
use crate::config::Config;
use crate::node::StorageNode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "craqfs")]
#[command(about = "CRAQ replicated block storage node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "craqfs=info,craqfs_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Craqfs server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            tracing::info!(
                "Node ID: {}, Bind: {}, Chain: {} nodes, Replication factor: {}",
                cfg.node.id,
                cfg.node.listen_address,
                cfg.chain_nodes().len(),
                cfg.replication.factor
            );

            let node = match StorageNode::new(cfg).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("Failed to build node: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = node.start().await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
