use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long an exited peer is left alone unless configured otherwise.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Files this peer can serve: name -> absolute path.
///
/// Shared by the peer client (register) and the file server (obtain, replicate).
#[derive(Clone, Default)]
pub struct LocalFiles {
    inner: Arc<Mutex<HashMap<String, PathBuf>>>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: String, path: PathBuf) {
        self.inner.lock().await.insert(name, path);
    }

    pub async fn get(&self, name: &str) -> Option<PathBuf> {
        self.inner.lock().await.get(name).cloned()
    }

    /// All entries, sorted by name.
    pub async fn entries(&self) -> Vec<(String, PathBuf)> {
        let mut entries: Vec<_> = self
            .inner
            .lock()
            .await
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();
        entries.sort();
        entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected { at: DateTime<Utc> },
}

/// Liveness of the peers that contacted our file server.
///
/// A peer that sent `exit` counts as disconnected for `recheck_interval`,
/// after which it may be contacted again.
#[derive(Clone)]
pub struct PeerStatusMap {
    inner: Arc<Mutex<HashMap<String, PeerStatus>>>,
    recheck_interval: Duration,
}

impl Default for PeerStatusMap {
    fn default() -> Self {
        Self::with_recheck(DEFAULT_RECHECK_INTERVAL)
    }
}

impl PeerStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recheck(recheck_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            recheck_interval,
        }
    }

    pub async fn mark_connected(&self, peer_id: &str) {
        self.inner
            .lock()
            .await
            .insert(peer_id.to_string(), PeerStatus::Connected);
    }

    pub async fn mark_disconnected(&self, peer_id: &str) {
        self.inner
            .lock()
            .await
            .insert(peer_id.to_string(), PeerStatus::Disconnected { at: Utc::now() });
    }

    pub async fn status(&self, peer_id: &str) -> Option<PeerStatus> {
        self.inner.lock().await.get(peer_id).copied()
    }

    /// Whether `peer_id` exited less than `recheck_interval` ago.
    pub async fn is_disconnected(&self, peer_id: &str) -> bool {
        match self.status(peer_id).await {
            Some(PeerStatus::Disconnected { at }) => match (Utc::now() - at).to_std() {
                Ok(elapsed) => elapsed < self.recheck_interval,
                // Clock went backwards; still inside the window
                Err(_) => true,
            },
            _ => false,
        }
    }
}

/// Reduce a file name to its last path component, rejecting `..` and empty names.
pub fn file_name_of(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .map(str::to_string)
}
