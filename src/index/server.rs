// src/index/server.rs
//
// Central index server used by the centralized indexing strategy

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::protocol::{IndexReply, IndexRequest};
use crate::networking::server::{serve_actions, spawn_listener, ServerHandle};
use crate::shutdown::Terminate;

/// Global file -> owners map plus the set of live peers.
pub struct IndexState {
    file_to_peers: HashMap<String, BTreeSet<String>>,
    live_peers: BTreeSet<String>,
    rng: StdRng,
}

impl Default for IndexState {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl IndexState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            file_to_peers: HashMap::new(),
            live_peers: BTreeSet::new(),
            rng,
        }
    }

    pub fn is_live(&self, peer_id: &str) -> bool {
        self.live_peers.contains(peer_id)
    }

    /// Apply one request. The flag is false when the connection should close
    /// after the reply.
    pub fn apply(&mut self, request: IndexRequest, replication_factor: usize) -> (IndexReply, bool) {
        match request {
            IndexRequest::Init { id } => {
                info!("Peer {} is live", id);
                self.live_peers.insert(id);
                (IndexReply::Ack, true)
            }
            IndexRequest::Close { id } => {
                info!("Peer {} closed, dropping its files", id);
                self.live_peers.remove(&id);
                self.file_to_peers.retain(|_, owners| {
                    owners.remove(&id);
                    !owners.is_empty()
                });
                (IndexReply::Ack, false)
            }
            IndexRequest::List => (
                IndexReply::Files {
                    names: self.file_to_peers.keys().cloned().collect(),
                },
                true,
            ),
            IndexRequest::Register { id, name } => {
                let peers = self
                    .live_peers
                    .iter()
                    .filter(|peer| **peer != id)
                    .cloned()
                    .choose_multiple(&mut self.rng, replication_factor);
                debug!("{} registered {}, replicate to {:?}", id, name, peers);
                self.file_to_peers.entry(name).or_default().insert(id);
                (IndexReply::Targets { peers }, true)
            }
            IndexRequest::RecordReplica { id, name } => {
                self.file_to_peers.entry(name).or_default().insert(id);
                (IndexReply::Ack, true)
            }
            IndexRequest::Search { id, name } => {
                let peers: Vec<String> = self
                    .file_to_peers
                    .get(&name)
                    .map(|owners| owners.iter().filter(|o| **o != id).cloned().collect())
                    .unwrap_or_default();
                (IndexReply::Owners { peers }, true)
            }
        }
    }
}

pub struct IndexServer {
    state: Arc<Mutex<IndexState>>,
    replication_factor: usize,
    poll_interval: Duration,
    terminate: Terminate,
}

impl IndexServer {
    pub fn new(replication_factor: usize, poll_interval: Duration, terminate: Terminate) -> Self {
        Self {
            state: Arc::new(Mutex::new(IndexState::new())),
            replication_factor,
            poll_interval,
            terminate,
        }
    }

    pub fn state(&self) -> Arc<Mutex<IndexState>> {
        self.state.clone()
    }

    pub async fn start(&self, addr: SocketAddr) -> io::Result<ServerHandle> {
        let state = self.state.clone();
        let terminate = self.terminate.clone();
        let poll_interval = self.poll_interval;
        let replication_factor = self.replication_factor;

        spawn_listener("index server", addr, self.terminate.clone(), move |stream, _peer_addr| {
            let state = state.clone();
            let terminate = terminate.clone();
            async move {
                serve_actions(stream, terminate, poll_interval, IndexReply::Unknown, |request: IndexRequest| {
                    let state = state.clone();
                    async move { state.lock().await.apply(request, replication_factor) }
                })
                .await
            }
        })
        .await
    }
}
