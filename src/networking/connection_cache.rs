use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::framing::{FramedStream, DEFAULT_CHUNK_SIZE};
use crate::error::{TransportError, TransportResult};

/// A memoized connection, locked for the duration of one exchange.
pub type SharedConnection = Arc<Mutex<FramedStream<TcpStream>>>;

enum PeerSlot {
    /// No socket yet (or the last one was dropped)
    Unknown,
    Live(SharedConnection),
    /// Refused or timed out at `since`
    Down { since: Instant },
}

/// One address's state, locked on its own so a slow connect only holds up
/// callers for that address.
type Slot = Arc<Mutex<PeerSlot>>;

/// Address -> connection cache with down-marking and recheck backoff.
///
/// Connections are created lazily and reused. A refused or timed-out
/// connect marks the address down; until `recheck_interval` has elapsed
/// every call fails with [`TransportError::PeerDown`] without touching the
/// network, after which exactly one new attempt is made.
pub struct ConnectionCache {
    slots: Mutex<HashMap<String, Slot>>,
    connect_timeout: Duration,
    recheck_interval: Duration,
    chunk_size: usize,
}

impl ConnectionCache {
    pub fn new(connect_timeout: Duration, recheck_interval: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            connect_timeout,
            recheck_interval,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// The slot for `addr`, created on first use. The map lock is held only here.
    async fn slot(&self, addr: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PeerSlot::Unknown)))
            .clone()
    }

    async fn existing_slot(&self, addr: &str) -> Option<Slot> {
        self.slots.lock().await.get(addr).cloned()
    }

    /// Get the cached connection to `addr` or open one.
    pub async fn connect(&self, addr: &str) -> TransportResult<SharedConnection> {
        self.connect_tracked(addr).await.map(|(conn, _)| conn)
    }

    /// Like [`connect`](Self::connect), also reporting whether the connection was reused.
    ///
    /// Concurrent callers for the same address wait on its slot, so at most
    /// one connect per address is in flight.
    async fn connect_tracked(&self, addr: &str) -> TransportResult<(SharedConnection, bool)> {
        let slot = self.slot(addr).await;
        let mut state = slot.lock().await;

        match &*state {
            PeerSlot::Live(conn) => return Ok((conn.clone(), true)),
            PeerSlot::Down { since } if since.elapsed() < self.recheck_interval => {
                return Err(TransportError::PeerDown(addr.to_string()));
            }
            PeerSlot::Down { .. } => {
                debug!("Recheck interval elapsed for {}, retrying once", addr);
            }
            PeerSlot::Unknown => {}
        }

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                let conn = Arc::new(Mutex::new(
                    FramedStream::new(stream).with_chunk_size(self.chunk_size),
                ));
                *state = PeerSlot::Live(conn.clone());
                info!("Connected to {}", addr);
                Ok((conn, false))
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                warn!("Connection refused by {}, marking it down", addr);
                *state = PeerSlot::Down { since: Instant::now() };
                Err(TransportError::ConnectionRefused(addr.to_string()))
            }
            Ok(Err(e)) => {
                *state = PeerSlot::Unknown;
                Err(e.into())
            }
            Err(_) => {
                warn!("Connection to {} timed out, marking it down", addr);
                *state = PeerSlot::Down { since: Instant::now() };
                Err(TransportError::ConnectTimeout(addr.to_string()))
            }
        }
    }

    /// Drop the cached connection to `addr`, if any.
    pub async fn evict(&self, addr: &str) {
        if let Some(slot) = self.existing_slot(addr).await {
            let mut state = slot.lock().await;
            if let PeerSlot::Live(_) = &*state {
                debug!("Evicting connection to {}", addr);
                *state = PeerSlot::Unknown;
            }
        }
    }

    /// Whether `addr` is down and still inside its backoff window.
    pub async fn is_down(&self, addr: &str) -> bool {
        match self.existing_slot(addr).await {
            Some(slot) => matches!(
                &*slot.lock().await,
                PeerSlot::Down { since } if since.elapsed() < self.recheck_interval
            ),
            None => false,
        }
    }

    /// Snapshot of every live connection.
    pub async fn live_connections(&self) -> Vec<(String, SharedConnection)> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(addr, slot)| (addr.clone(), slot.clone()))
            .collect();

        let mut live = Vec::new();
        for (addr, slot) in slots {
            if let PeerSlot::Live(conn) = &*slot.lock().await {
                live.push((addr, conn.clone()));
            }
        }
        live
    }

    /// Send one action to `addr` and wait for its reply.
    ///
    /// A reused connection that turns out to be dead is replaced once, so a
    /// node that went away is seen as refused rather than as a broken pipe.
    pub async fn request<Req, Resp>(&self, addr: &str, request: &Req) -> TransportResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (conn, reused) = self.connect_tracked(addr).await?;
        match Self::exchange(&conn, request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.evict(addr).await;
                let stale = matches!(e, TransportError::Closed | TransportError::Io(_));
                if !(reused && stale) {
                    return Err(e);
                }

                debug!("Cached connection to {} was stale ({}), reconnecting", addr, e);
                let (conn, _) = self.connect_tracked(addr).await?;
                let result = Self::exchange(&conn, request).await;
                if result.is_err() {
                    self.evict(addr).await;
                }
                result
            }
        }
    }

    async fn exchange<Req, Resp>(conn: &SharedConnection, request: &Req) -> TransportResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut framed = conn.lock().await;
        framed.send_action(request).await?;
        framed.recv_action().await?.ok_or(TransportError::Closed)
    }
}
