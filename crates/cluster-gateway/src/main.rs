mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::{notifier, Coordinator, GatewayConfig};
use tokio::net::TcpListener;
use tracing::info;

/// Coordination gateway for a pool of bot clusters.
#[derive(Debug, Parser)]
#[command(name = "cluster-gateway", version)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides config and GATEWAY_BIND
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Number of clusters in the pool
    #[arg(long)]
    clusters: Option<usize>,

    /// Total shard count reported to clusters
    #[arg(long)]
    shards: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(clusters) = self.clusters {
            config.clusters = clusters;
        }
        if let Some(shards) = self.shards {
            config.shards = shards;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;

    let notifier = notifier::from_config(config.panic.as_ref())?;
    let bind = config.bind;
    let coordinator = Coordinator::new(config, notifier).shared();

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(
        bind = %bind,
        clusters = coordinator.config().clusters,
        shards = coordinator.config().shards,
        "Cluster gateway listening"
    );

    server::serve(listener, coordinator, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await
}
