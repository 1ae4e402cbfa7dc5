use log::debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{DhtReply, DhtRequest};
use crate::networking::server::{serve_actions, spawn_listener, ServerHandle};
use crate::shutdown::Terminate;
use crate::storage::LocalStore;

/// Apply one action to `store`.
///
/// Also the local short-circuit path of the distributed index, so a node
/// talking to itself never goes through a socket.
pub async fn dispatch(store: &LocalStore, request: DhtRequest) -> DhtReply {
    match request {
        DhtRequest::Put { key, value } => {
            store.put(&key, value).await;
            DhtReply::Done
        }
        DhtRequest::Get { key } => DhtReply::Value {
            value: store.get(&key).await,
        },
        DhtRequest::Rem { key } => {
            store.remove(&key).await;
            DhtReply::Done
        }
        DhtRequest::Keys => DhtReply::Keys {
            keys: store.keys().await,
        },
    }
}

/// Network front-end of a node's [`LocalStore`].
pub struct DhtServer {
    store: Arc<LocalStore>,
    poll_interval: Duration,
    terminate: Terminate,
}

impl DhtServer {
    pub fn new(store: Arc<LocalStore>, poll_interval: Duration, terminate: Terminate) -> Self {
        Self {
            store,
            poll_interval,
            terminate,
        }
    }

    /// Bind `addr` and serve until `terminate` fires.
    pub async fn start(&self, addr: SocketAddr) -> io::Result<ServerHandle> {
        let store = self.store.clone();
        let terminate = self.terminate.clone();
        let poll_interval = self.poll_interval;

        spawn_listener("DHT server", addr, self.terminate.clone(), move |stream, peer_addr| {
            let store = store.clone();
            let terminate = terminate.clone();
            async move {
                serve_actions(stream, terminate, poll_interval, DhtReply::Unknown, |request: DhtRequest| {
                    let store = store.clone();
                    debug!("DHT request from {}: {:?}", peer_addr, request);
                    async move { (dispatch(&store, request).await, true) }
                })
                .await
            }
        })
        .await
    }
}
