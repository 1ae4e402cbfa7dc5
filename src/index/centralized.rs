use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeSet;

use super::protocol::{IndexReply, IndexRequest};
use super::{IndexProxy, Registration, ReplicaState};
use crate::error::{IndexError, IndexResult, TransportError};
use crate::networking::ConnectionCache;

/// Proxy forwarding every operation to one central index server.
pub struct CentralizedIndex {
    server_addr: String,
    connections: ConnectionCache,
}

impl CentralizedIndex {
    pub fn new(server_addr: impl Into<String>, connections: ConnectionCache) -> Self {
        Self {
            server_addr: server_addr.into(),
            connections,
        }
    }

    async fn call(&self, request: IndexRequest) -> IndexResult<IndexReply> {
        debug!("Index request to {}: {:?}", self.server_addr, request);
        match self.connections.request(&self.server_addr, &request).await {
            Ok(IndexReply::Unknown) => Err(IndexError::Rejected(format!("{:?}", request))),
            Ok(reply) => Ok(reply),
            Err(e) if e.is_retriable() => Err(IndexError::ServerUnreachable(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

fn unexpected(reply: IndexReply) -> IndexError {
    TransportError::UnexpectedReply(format!("{:?}", reply)).into()
}

#[async_trait]
impl IndexProxy for CentralizedIndex {
    async fn init(&self, peer_id: &str) -> IndexResult<()> {
        match self.call(IndexRequest::Init { id: peer_id.to_string() }).await? {
            IndexReply::Ack => {
                info!("Registered {} with index server {}", peer_id, self.server_addr);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self, peer_id: &str) -> IndexResult<()> {
        let reply = self.call(IndexRequest::Close { id: peer_id.to_string() }).await;
        // The server hangs up after acknowledging
        self.connections.evict(&self.server_addr).await;
        match reply? {
            IndexReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list(&self) -> IndexResult<BTreeSet<String>> {
        match self.call(IndexRequest::List).await? {
            IndexReply::Files { names } => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn register(&self, peer_id: &str, name: &str) -> IndexResult<Registration> {
        let request = IndexRequest::Register {
            id: peer_id.to_string(),
            name: name.to_string(),
        };
        match self.call(request).await? {
            IndexReply::Targets { peers } => Ok(Registration {
                replicate_to: peers,
                replica: ReplicaState::Synced,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn search(&self, peer_id: &str, name: &str) -> IndexResult<Vec<String>> {
        let request = IndexRequest::Search {
            id: peer_id.to_string(),
            name: name.to_string(),
        };
        match self.call(request).await? {
            IndexReply::Owners { peers } => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    async fn record_replica(&self, holder: &str, name: &str) -> IndexResult<()> {
        let request = IndexRequest::RecordReplica {
            id: holder.to_string(),
            name: name.to_string(),
        };
        match self.call(request).await? {
            IndexReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
