use async_trait::async_trait;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use super::{IndexProxy, Registration, ReplicaState};
use crate::cluster::Cluster;
use crate::dht::{dispatch, DhtReply, DhtRequest};
use crate::error::{IndexError, IndexResult, TransportError, TransportResult};
use crate::networking::ConnectionCache;
use crate::storage::{LocalStore, OwnerList};

/// Index partitioned over the DHT servers of every node.
///
/// A key lives on its primary node `hash(key) mod N` and is mirrored on the
/// next node. Reads go to the primary and fall back to the replica only when
/// the primary is unreachable; writes go to both. Calls whose target is this
/// node go straight to the local store.
pub struct DistributedIndex {
    cluster: Arc<Cluster>,
    store: Arc<LocalStore>,
    connections: ConnectionCache,
    replication_factor: usize,
}

impl DistributedIndex {
    pub fn new(
        cluster: Arc<Cluster>,
        store: Arc<LocalStore>,
        connections: ConnectionCache,
        replication_factor: usize,
    ) -> Self {
        Self {
            cluster,
            store,
            connections,
            replication_factor,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Owner list stored under `key`, trying the replica if the primary is unreachable.
    pub async fn get(&self, key: &str) -> IndexResult<Option<OwnerList>> {
        let primary = self.cluster.primary_for(key);
        let replica = self.cluster.replica_for(key);

        match self.read_at(primary, key).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_retriable() && replica != primary => {
                warn!("Primary node {} unreachable for {} ({}), trying replica {}", primary, key, e, replica);
                match self.read_at(replica, key).await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retriable() => Err(IndexError::Unreachable { primary, replica }),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) if e.is_retriable() => Err(IndexError::Unreachable { primary, replica }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, key: &str, value: OwnerList) -> IndexResult<ReplicaState> {
        self.mirror(key, |node| self.write_at(node, key, value.clone())).await
    }

    pub async fn remove(&self, key: &str) -> IndexResult<ReplicaState> {
        self.mirror(key, |node| self.remove_at(node, key)).await
    }

    /// Run `op` on the primary and the replica of `key`.
    ///
    /// Succeeds if either copy was written; both failing is `Unreachable`
    /// unless the primary failed for a non-connection reason.
    async fn mirror<F, Fut>(&self, key: &str, op: F) -> IndexResult<ReplicaState>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = TransportResult<()>>,
    {
        let primary = self.cluster.primary_for(key);
        let replica = self.cluster.replica_for(key);

        let first = op(primary).await;
        if replica == primary {
            return match first {
                Ok(()) => Ok(ReplicaState::Synced),
                Err(e) if e.is_retriable() => Err(IndexError::Unreachable { primary, replica }),
                Err(e) => Err(e.into()),
            };
        }

        let second = op(replica).await;
        match (first, second) {
            (Ok(()), Ok(())) => Ok(ReplicaState::Synced),
            (Ok(()), Err(e)) => {
                warn!("Replica node {} missed the write for {}: {}", replica, key, e);
                Ok(ReplicaState::Degraded { node: replica })
            }
            (Err(e), Ok(())) => {
                warn!("Primary node {} missed the write for {}: {}", primary, key, e);
                Ok(ReplicaState::Degraded { node: primary })
            }
            (Err(e), Err(_)) if e.is_retriable() => Err(IndexError::Unreachable { primary, replica }),
            (Err(e), Err(_)) => Err(e.into()),
        }
    }

    async fn call(&self, node: usize, request: DhtRequest) -> TransportResult<DhtReply> {
        if node == self.cluster.self_id() {
            return Ok(dispatch(&self.store, request).await);
        }

        let addr = self.cluster.node(node).index_addr();
        debug!("DHT {:?} -> node {} ({})", request, node, addr);
        match self.connections.request(&addr, &request).await? {
            DhtReply::Unknown => Err(TransportError::UnexpectedReply(format!(
                "node {} did not understand {:?}",
                node, request
            ))),
            reply => Ok(reply),
        }
    }

    async fn read_at(&self, node: usize, key: &str) -> TransportResult<Option<OwnerList>> {
        match self.call(node, DhtRequest::Get { key: key.to_string() }).await? {
            DhtReply::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn write_at(&self, node: usize, key: &str, value: OwnerList) -> TransportResult<()> {
        let request = DhtRequest::Put {
            key: key.to_string(),
            value,
        };
        match self.call(node, request).await? {
            DhtReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_at(&self, node: usize, key: &str) -> TransportResult<()> {
        match self.call(node, DhtRequest::Rem { key: key.to_string() }).await? {
            DhtReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn keys_at(&self, node: usize) -> TransportResult<BTreeSet<String>> {
        match self.call(node, DhtRequest::Keys).await? {
            DhtReply::Keys { keys } => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    /// Add `owner` to the list under `key` on `node`.
    async fn append_at(&self, node: usize, key: &str, owner: &str) -> TransportResult<()> {
        if node == self.cluster.self_id() {
            self.store.append_owner(key, owner).await;
            return Ok(());
        }

        let mut owners = self.read_at(node, key).await?.unwrap_or_default();
        if owners.iter().any(|o| o == owner) {
            return Ok(());
        }
        owners.push(owner.to_string());
        self.write_at(node, key, owners).await
    }

    /// Up to `replication_factor` peers to push `name` to.
    ///
    /// Candidates are the nodes following this one around the ring, minus
    /// any currently marked down. Nodes other than the primary and replica
    /// of `name` come first; those two only fill the remaining slots.
    async fn replication_targets(&self, name: &str) -> Vec<String> {
        let primary = self.cluster.primary_for(name);
        let replica = self.cluster.replica_for(name);

        let mut others = Vec::new();
        let mut bookkeeping = Vec::new();
        for node in self.cluster.successors() {
            if self.connections.is_down(&node.index_addr()).await {
                debug!("Skipping node {} as replication target, marked down", node.id);
                continue;
            }
            if node.id == primary || node.id == replica {
                bookkeeping.push(node.peer_id());
            } else {
                others.push(node.peer_id());
            }
        }

        others
            .into_iter()
            .chain(bookkeeping)
            .take(self.replication_factor)
            .collect()
    }
}

fn unexpected(reply: DhtReply) -> TransportError {
    TransportError::UnexpectedReply(format!("{:?}", reply))
}

#[async_trait]
impl IndexProxy for DistributedIndex {
    async fn init(&self, peer_id: &str) -> IndexResult<()> {
        debug!("{} joined the distributed index", peer_id);
        Ok(())
    }

    async fn close(&self, peer_id: &str) -> IndexResult<()> {
        debug!("{} left the distributed index", peer_id);
        Ok(())
    }

    async fn list(&self) -> IndexResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for node in 0..self.cluster.len() {
            match self.keys_at(node).await {
                Ok(keys) => names.extend(keys),
                Err(e) => warn!("Leaving node {} out of the listing: {}", node, e),
            }
        }
        Ok(names)
    }

    async fn register(&self, peer_id: &str, name: &str) -> IndexResult<Registration> {
        let replica = self.mirror(name, |node| self.append_at(node, name, peer_id)).await?;
        Ok(Registration {
            replicate_to: self.replication_targets(name).await,
            replica,
        })
    }

    async fn search(&self, peer_id: &str, name: &str) -> IndexResult<Vec<String>> {
        let owners = self.get(name).await?.unwrap_or_default();
        Ok(owners.into_iter().filter(|owner| owner != peer_id).collect())
    }

    async fn record_replica(&self, holder: &str, name: &str) -> IndexResult<()> {
        self.mirror(name, |node| self.append_at(node, name, holder)).await?;
        Ok(())
    }
}
