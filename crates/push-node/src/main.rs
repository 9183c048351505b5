//! push-node binary.
//!
//! Runs a standalone push node with an in-process backend.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use push_node::{NodeConfig, NodeState, PushServer};
use push_store::{Backends, MemoryBackend};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "push-node")]
#[command(about = "Push notification connection node")]
#[command(version)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, env = "PUSH_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Client websocket bind address
    #[arg(long, env = "PUSH_NODE_BIND")]
    bind: Option<SocketAddr>,

    /// Router HTTP bind address
    #[arg(long, env = "PUSH_NODE_ROUTER_BIND")]
    router_bind: Option<SocketAddr>,

    /// URL peers use to reach this node's router
    #[arg(long, env = "PUSH_NODE_ROUTER_URL")]
    router_url: Option<String>,

    /// Base URL for minted push endpoints
    #[arg(long, env = "PUSH_NODE_ENDPOINT_URL")]
    endpoint_url: Option<String>,
}

impl Cli {
    fn load_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(router_bind) = self.router_bind {
            config = config.with_router_bind_addr(router_bind);
        }
        if let Some(url) = self.router_url {
            config = config.with_router_url(url);
        }
        if let Some(url) = self.endpoint_url {
            config = config.with_endpoint_url(url);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().load_config()?;

    info!("Starting push node");
    info!("  Client websockets: ws://{}/", config.bind_addr);
    info!("  Router:            http://{}/", config.router_bind_addr);
    info!("  Advertised as:     {}", config.router_url);

    let backends = Backends::in_memory(Arc::new(MemoryBackend::new()), &config.endpoint_url);
    let state = Arc::new(NodeState::new(config, backends)?);
    let server = Arc::new(PushServer::new(state));

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            stopper.shutdown();
        }
    });

    server.serve().await?;
    Ok(())
}
