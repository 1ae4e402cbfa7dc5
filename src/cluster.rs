//! Static cluster layout and key placement.
//!
//! The node list is fixed for the lifetime of the process. A key's primary
//! node is `hash(key) mod N` and its replica is the next node in the list.
//! Placement is recomputed on every call and is only meaningful while `N`
//! stays the same.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// One member of the fixed node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: usize,
    pub address: String,
    pub file_server_port: u16,
    pub idx_server_port: u16,
}

impl NodeInfo {
    /// Peer id under which this node registers files (`address:file_port`).
    pub fn peer_id(&self) -> String {
        format!("{}:{}", self.address, self.file_server_port)
    }

    /// Address of this node's DHT server.
    pub fn index_addr(&self) -> String {
        format!("{}:{}", self.address, self.idx_server_port)
    }
}

/// Numeric hash of a key: the first 16 bytes of its SHA-256 digest.
pub fn numeric_hash(key: &str) -> u128 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

#[derive(Debug, Clone)]
pub struct Cluster {
    nodes: Vec<NodeInfo>,
    self_id: usize,
}

impl Cluster {
    pub fn new(nodes: Vec<NodeInfo>, self_id: usize) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList);
        }
        if self_id >= nodes.len() {
            return Err(ConfigError::SelfNotInPeerList(format!("#{}", self_id)));
        }
        Ok(Self { nodes, self_id })
    }

    /// Build a cluster, identifying ourselves by address and file-server port.
    pub fn locate(nodes: Vec<NodeInfo>, address: &str, file_server_port: u16) -> Result<Self, ConfigError> {
        let self_id = nodes
            .iter()
            .position(|n| n.address == address && n.file_server_port == file_server_port)
            .ok_or_else(|| ConfigError::SelfNotInPeerList(format!("{}:{}", address, file_server_port)))?;
        Self::new(nodes, self_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn self_id(&self) -> usize {
        self.self_id
    }

    pub fn self_node(&self) -> &NodeInfo {
        &self.nodes[self.self_id]
    }

    pub fn node(&self, id: usize) -> &NodeInfo {
        &self.nodes[id % self.nodes.len()]
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Node responsible for `key`.
    pub fn primary_for(&self, key: &str) -> usize {
        (numeric_hash(key) % self.nodes.len() as u128) as usize
    }

    /// Successor of the primary; equal to it in a single-node cluster.
    pub fn replica_for(&self, key: &str) -> usize {
        (self.primary_for(key) + 1) % self.nodes.len()
    }

    /// Every other node, walking forward from ourselves.
    pub fn successors(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        let n = self.nodes.len();
        (1..n).map(move |step| &self.nodes[(self.self_id + step) % n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(count: usize) -> Vec<NodeInfo> {
        (0..count)
            .map(|id| NodeInfo {
                id,
                address: "127.0.0.1".to_string(),
                file_server_port: 9000 + id as u16,
                idx_server_port: 9100 + id as u16,
            })
            .collect()
    }

    #[test]
    fn test_hash_is_deterministic_and_in_range() {
        for n in 1..=9 {
            let cluster = Cluster::new(nodes(n), 0).unwrap();
            for i in 0..500 {
                let key = format!("file_{}.txt", i);
                let p = cluster.primary_for(&key);
                assert_eq!(p, cluster.primary_for(&key));
                assert!(p < n, "primary {} out of range for N={}", p, n);
            }
        }
    }

    #[test]
    fn test_replica_is_successor() {
        let cluster = Cluster::new(nodes(3), 1).unwrap();
        for i in 0..100 {
            let key = format!("doc_{}", i);
            assert_eq!(cluster.replica_for(&key), (cluster.primary_for(&key) + 1) % 3);
        }
    }

    #[test]
    fn test_single_node_is_its_own_replica() {
        let cluster = Cluster::new(nodes(1), 0).unwrap();
        assert_eq!(cluster.primary_for("doc.txt"), 0);
        assert_eq!(cluster.replica_for("doc.txt"), 0);
    }

    #[test]
    fn test_keys_spread_over_nodes() {
        let cluster = Cluster::new(nodes(4), 0).unwrap();
        let mut counts = [0usize; 4];
        for i in 0..4000 {
            counts[cluster.primary_for(&format!("book_{}", i))] += 1;
        }
        assert!(counts.iter().all(|&c| c > 500), "skewed distribution: {:?}", counts);
    }

    #[test]
    fn test_locate_self() {
        let cluster = Cluster::locate(nodes(3), "127.0.0.1", 9002).unwrap();
        assert_eq!(cluster.self_id(), 2);
        assert_eq!(cluster.self_node().peer_id(), "127.0.0.1:9002");
        assert_eq!(cluster.self_node().index_addr(), "127.0.0.1:9102");

        let successors: Vec<usize> = cluster.successors().map(|n| n.id).collect();
        assert_eq!(successors, vec![0, 1]);
    }

    #[test]
    fn test_locate_unknown_node_is_config_error() {
        let err = Cluster::locate(nodes(3), "10.0.0.9", 9000).unwrap_err();
        assert!(matches!(err, ConfigError::SelfNotInPeerList(_)));
        assert!(matches!(Cluster::new(vec![], 0), Err(ConfigError::EmptyNodeList)));
    }
}
