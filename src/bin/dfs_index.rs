use anyhow::{Context, Result};
use dfs_node::config::{config_path, NodeConfig};
use dfs_node::index::IndexServer;
use dfs_node::Terminate;
use dotenv::dotenv;
use log::info;
use std::net::SocketAddr;

/// Central index server for nodes running with `"idx_type": "centralized"`.
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    let path = config_path(std::env::args().nth(1))
        .context("usage: dfs-index <config.json> (or set DFS_CONFIG)")?;
    let config = NodeConfig::load(&path)?;

    env_logger::init_from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str()));

    let addr: SocketAddr = config
        .index_server()?
        .parse()
        .context("index_server must be an ip:port address")?;

    let terminate = Terminate::new();
    let t = terminate.clone();
    ctrlc::set_handler(move || {
        t.trigger();
    })?;

    let server = IndexServer::new(config.replication_factor, config.poll_interval(), terminate.clone());
    let handle = server.start(addr).await?;
    info!(
        "Index server ready on {} (replication factor {}), press Ctrl+C to stop",
        handle.local_addr(),
        config.replication_factor
    );

    terminate.wait().await;
    handle.join().await;
    info!("Index server stopped");
    Ok(())
}
