//! Indexing strategies.
//!
//! A peer locates files through an [`IndexProxy`]: either one central index
//! server ([`CentralizedIndex`]) or the hash-partitioned DHT spread over
//! every node ([`DistributedIndex`]). The choice is made once at startup.

pub mod centralized;
pub mod distributed;
pub mod protocol;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::IndexResult;

pub use centralized::CentralizedIndex;
pub use distributed::DistributedIndex;
pub use protocol::{IndexReply, IndexRequest};
pub use server::{IndexServer, IndexState};

/// Whether both copies of an index entry were written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    Synced,
    /// The write to `node` failed; the entry lives on one node only.
    Degraded { node: usize },
}

/// Result of registering a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Peers this node should push a copy of the file to
    pub replicate_to: Vec<String>,
    pub replica: ReplicaState,
}

#[async_trait]
pub trait IndexProxy: Send + Sync {
    /// Announce `peer_id` as live.
    async fn init(&self, peer_id: &str) -> IndexResult<()>;

    /// Withdraw `peer_id` and everything it registered.
    async fn close(&self, peer_id: &str) -> IndexResult<()>;

    /// Every file name known to the index.
    async fn list(&self) -> IndexResult<BTreeSet<String>>;

    /// Record `peer_id` as an owner of `name`.
    async fn register(&self, peer_id: &str, name: &str) -> IndexResult<Registration>;

    /// Owners of `name` other than `peer_id`.
    async fn search(&self, peer_id: &str, name: &str) -> IndexResult<Vec<String>>;

    /// Record that `holder` received a pushed copy of `name`.
    async fn record_replica(&self, holder: &str, name: &str) -> IndexResult<()>;
}
