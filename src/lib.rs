//! Peer-to-peer file sharing over a framed TCP protocol.
//!
//! Peers register the files they hold with an index, find who holds a file,
//! and fetch it directly from another peer. The index is either a single
//! central server or a DHT partitioned by `hash(name) mod N` over every node,
//! each entry mirrored on the next node.

pub mod cluster;
pub mod config;
pub mod dht;
pub mod error;
pub mod index;
pub mod networking;
pub mod node;
pub mod peer;
pub mod shutdown;
pub mod storage;

pub use config::NodeConfig;
pub use error::{ConfigError, IndexError, TransportError};
pub use node::Node;
pub use shutdown::Terminate;
