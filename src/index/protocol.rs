use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Requests sent to the central index server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexRequest {
    Init { id: String },
    Close { id: String },
    List,
    Register { id: String, name: String },
    RecordReplica { id: String, name: String },
    Search { id: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum IndexReply {
    Ack,
    Files { names: BTreeSet<String> },
    Targets { peers: Vec<String> },
    Owners { peers: Vec<String> },
    Unknown,
}
