use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::storage::OwnerList;

/// Actions understood by a DHT server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DhtRequest {
    Put { key: String, value: OwnerList },
    Get { key: String },
    Rem { key: String },
    Keys,
}

/// Replies of a DHT server. `Unknown` answers anything it could not decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum DhtReply {
    Done,
    Value { value: Option<OwnerList> },
    Keys { keys: BTreeSet<String> },
    Unknown,
}
