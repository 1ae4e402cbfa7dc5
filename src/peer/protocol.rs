use serde::{Deserialize, Serialize};

/// Actions a peer sends to another peer's file server. `from` is the
/// sender's peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerAction {
    /// Ask for a file; answered with `exists` plus the file, or `absent`.
    Obtain { name: String, from: String },
    /// A file stream follows; answered with `stored`.
    Replicate { name: String, from: String },
    /// The sender is going away; the connection closes without a reply.
    Exit { from: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "lowercase")]
pub enum PeerReply {
    Exists,
    Absent,
    Stored,
}
