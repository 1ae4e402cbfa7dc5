//! Error types shared by the transport, indexing and configuration layers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to a remote socket.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("{0} is marked down, retry suppressed until the recheck interval elapses")]
    PeerDown(String),

    #[error("peer closed the connection mid-frame")]
    Closed,

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u32),

    #[error("file of {0} bytes does not fit a 4-byte size header")]
    FileTooLarge(u64),

    #[error("malformed action: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the target was simply unreachable, meaning another node may be tried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused(_)
                | TransportError::ConnectTimeout(_)
                | TransportError::PeerDown(_)
        )
    }
}

/// Failures of an indexing proxy operation.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index unreachable: primary node {primary} and replica node {replica} both failed")]
    Unreachable { primary: usize, replica: usize },

    #[error("index server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Fatal startup errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("node {0} is not included in the configured node list")]
    SelfNotInPeerList(String),

    #[error("the distributed index needs at least one node")]
    EmptyNodeList,

    #[error("centralized index selected but no index_server configured")]
    MissingIndexServer,

    #[error("download directory {0} does not exist and could not be created")]
    MissingDownloadDir(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not determine the local address: {0}")]
    LocalAddress(String),
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type for indexing operations
pub type IndexResult<T> = std::result::Result<T, IndexError>;
