// src/node.rs
//
// Wires a peer together: file server, optional DHT server, index proxy and client

use anyhow::{Context, Result};
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{IndexType, NodeConfig};
use crate::dht::DhtServer;
use crate::index::{CentralizedIndex, DistributedIndex, IndexProxy};
use crate::networking::{ConnectionCache, ProgressCallback, ServerHandle};
use crate::peer::{FileServer, LocalFiles, PeerClient, PeerStatusMap};
use crate::shutdown::Terminate;
use crate::storage::LocalStore;

/// A running peer.
pub struct Node {
    client: PeerClient,
    file_server: ServerHandle,
    dht_server: Option<ServerHandle>,
    terminate: Terminate,
}

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", address, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", address, port))
}

impl Node {
    /// Start the servers this node runs and announce it to the index.
    ///
    /// `progress` receives the status of every replica pushed to this node.
    pub async fn start(
        config: &NodeConfig,
        terminate: Terminate,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let download_dir = config.ensure_download_dir()?;
        let address = config.local_address()?;
        let peer_id = config.peer_id()?;
        info!("Starting node {} ({:?} index)", peer_id, config.idx_type);

        let connections = || {
            ConnectionCache::new(config.connect_timeout(), config.recheck_interval())
                .with_chunk_size(config.chunk_size)
        };

        let (proxy, dht_server): (Arc<dyn IndexProxy>, Option<ServerHandle>) = match config.idx_type {
            IndexType::Distributed => {
                let cluster = Arc::new(config.cluster()?);
                let store = Arc::new(LocalStore::new());
                let bind = socket_addr(&address, cluster.self_node().idx_server_port)?;
                let dht_server = DhtServer::new(store.clone(), config.poll_interval(), terminate.clone())
                    .start(bind)
                    .await
                    .with_context(|| format!("failed to start DHT server on {}", bind))?;
                info!("Node {} of {} in the DHT", cluster.self_id(), cluster.len());
                let index = DistributedIndex::new(cluster, store, connections(), config.replication_factor);
                (Arc::new(index), Some(dht_server))
            }
            IndexType::Centralized => {
                let index = CentralizedIndex::new(config.index_server()?, connections());
                (Arc::new(index), None)
            }
        };

        let files = LocalFiles::new();
        let statuses = PeerStatusMap::with_recheck(config.recheck_interval());
        let bind = socket_addr(&address, config.file_server_port)?;
        let mut file_server = FileServer::new(
            files.clone(),
            statuses.clone(),
            download_dir.clone(),
            config.poll_interval(),
            terminate.clone(),
        )
        .with_chunk_size(config.chunk_size);
        if let Some(callback) = progress {
            file_server = file_server.with_progress(callback);
        }
        let file_server = file_server
            .start(bind)
            .await
            .with_context(|| format!("failed to start file server on {}", bind))?;

        let client = PeerClient::new(peer_id, proxy, connections(), files, statuses, download_dir);
        if let Err(e) = client.init().await {
            warn!("Could not announce {} to the index: {}", client.peer_id(), e);
        }

        Ok(Self {
            client,
            file_server,
            dht_server,
            terminate,
        })
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    pub fn file_server_addr(&self) -> SocketAddr {
        self.file_server.local_addr()
    }

    pub fn dht_addr(&self) -> Option<SocketAddr> {
        self.dht_server.as_ref().map(|s| s.local_addr())
    }

    /// Say goodbye to peers and the index, then stop every server.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.shutdown().await {
            warn!("Error leaving the index: {}", e);
        }
        self.terminate.trigger();
        self.file_server.join().await;
        if let Some(dht_server) = self.dht_server {
            dht_server.join().await;
        }
        info!("Node {} stopped", self.client.peer_id());
    }
}
