use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::files::{file_name_of, LocalFiles, PeerStatusMap};
use super::protocol::{PeerAction, PeerReply};
use crate::error::{IndexError, IndexResult, TransportError, TransportResult};
use crate::index::{IndexProxy, ReplicaState};
use crate::networking::{ConnectionCache, SharedConnection};

/// Outcome of [`PeerClient::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReport {
    pub name: String,
    pub size: u64,
    /// Peers that acknowledged a pushed copy
    pub replicated_to: Vec<String>,
    /// Targets that were down or failed mid-push
    pub skipped: Vec<String>,
    pub replica: ReplicaState,
}

/// Control plane of a peer: talks to the index and to other peers' file servers.
pub struct PeerClient {
    peer_id: String,
    proxy: Arc<dyn IndexProxy>,
    connections: ConnectionCache,
    files: LocalFiles,
    statuses: PeerStatusMap,
    download_dir: PathBuf,
}

impl PeerClient {
    pub fn new(
        peer_id: String,
        proxy: Arc<dyn IndexProxy>,
        connections: ConnectionCache,
        files: LocalFiles,
        statuses: PeerStatusMap,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            peer_id,
            proxy,
            connections,
            files,
            statuses,
            download_dir,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Announce this peer to the index.
    pub async fn init(&self) -> IndexResult<()> {
        self.proxy.init(&self.peer_id).await
    }

    /// Register a local file and push copies to the targets the index picks.
    ///
    /// Fails without touching the network if `path` is not a regular file.
    /// Push failures are logged and reported as skipped.
    pub async fn register(&self, path: &Path) -> Result<RegisterReport> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot register {}", path.display()))?;
        if !metadata.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(file_name_of)
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?;
        let path = tokio::fs::canonicalize(path).await?;
        let size = metadata.len();

        let registration = self
            .proxy
            .register(&self.peer_id, &name)
            .await
            .with_context(|| format!("index rejected registration of {}", name))?;
        if let ReplicaState::Degraded { node } = registration.replica {
            warn!("{} registered, but index node {} missed the update", name, node);
        }
        self.files.insert(name.clone(), path.clone()).await;
        info!("Registered {} ({} bytes)", name, size);

        let mut replicated_to = Vec::new();
        let mut skipped = Vec::new();
        for target in registration.replicate_to {
            if target == self.peer_id {
                continue;
            }
            if self.statuses.is_disconnected(&target).await {
                debug!("Not pushing {} to {}, it has exited", name, target);
                skipped.push(target);
                continue;
            }

            match self.push_replica(&target, &name, &path).await {
                Ok(()) => {
                    info!("Replicated {} to {}", name, target);
                    self.statuses.mark_connected(&target).await;
                    if let Err(e) = self.proxy.record_replica(&target, &name).await {
                        warn!("Failed to record replica of {} on {}: {}", name, target, e);
                    }
                    replicated_to.push(target);
                }
                Err(e) => {
                    warn!("Skipping replica push of {} to {}: {}", name, target, e);
                    skipped.push(target);
                }
            }
        }

        Ok(RegisterReport {
            name,
            size,
            replicated_to,
            skipped,
            replica: registration.replica,
        })
    }

    /// Peers holding `name`, excluding ourselves.
    pub async fn search(&self, name: &str) -> IndexResult<Vec<String>> {
        self.proxy.search(&self.peer_id, name).await
    }

    /// Human-readable rendering of a search result.
    pub fn format_search(name: &str, result: &IndexResult<Vec<String>>) -> String {
        match result {
            Err(IndexError::Unreachable { primary, replica }) => format!(
                "{}: index nodes {} and {} are unreachable, try again later",
                name, primary, replica
            ),
            Err(e) => format!("{}: search failed: {}", name, e),
            Ok(owners) if owners.is_empty() => format!("{}: not available on any peer", name),
            Ok(owners) => {
                let mut out = format!("{} is available on {} peer(s):", name, owners.len());
                for owner in owners {
                    out.push_str("\n  ");
                    out.push_str(owner);
                }
                out
            }
        }
    }

    /// Download `name` from the first owner that still has it.
    ///
    /// Owners are tried one at a time in index order. `None` means no owner
    /// could deliver the file.
    pub async fn lookup(&self, name: &str) -> Result<Option<PathBuf>> {
        let owners = self
            .search(name)
            .await
            .with_context(|| format!("searching for {}", name))?;
        let local_name = file_name_of(name).ok_or_else(|| anyhow!("invalid file name {:?}", name))?;

        for owner in owners {
            match self.fetch_from(&owner, name, &local_name).await {
                Ok(Some(path)) => {
                    info!("Downloaded {} from {} into {}", name, owner, path.display());
                    return Ok(Some(path));
                }
                Ok(None) => debug!("{} no longer has {}", owner, name),
                Err(e) => warn!("Failed to obtain {} from {}: {}", name, owner, e),
            }
        }
        Ok(None)
    }

    /// Every file name in the index.
    pub async fn list(&self) -> IndexResult<BTreeSet<String>> {
        self.proxy.list().await
    }

    /// Files this peer serves, with their current sizes.
    pub async fn local_files(&self) -> Vec<(String, u64)> {
        let mut listing = Vec::new();
        for (name, path) in self.files.entries().await {
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            listing.push((name, size));
        }
        listing
    }

    /// Tell every peer we talk to that we are leaving, then leave the index.
    pub async fn shutdown(&self) -> IndexResult<()> {
        let exit = PeerAction::Exit {
            from: self.peer_id.clone(),
        };
        for (addr, conn) in self.connections.live_connections().await {
            let mut framed = conn.lock().await;
            if let Err(e) = framed.send_action(&exit).await {
                debug!("Could not send exit to {}: {}", addr, e);
            }
            drop(framed);
            self.connections.evict(&addr).await;
        }
        self.proxy.close(&self.peer_id).await
    }

    async fn push_replica(&self, target: &str, name: &str, path: &Path) -> TransportResult<()> {
        let conn = self.connections.connect(target).await?;
        let result = self.send_replica(&conn, name, path).await;
        if result.is_err() {
            self.connections.evict(target).await;
        }
        result
    }

    async fn send_replica(&self, conn: &SharedConnection, name: &str, path: &Path) -> TransportResult<()> {
        let mut framed = conn.lock().await;
        let action = PeerAction::Replicate {
            name: name.to_string(),
            from: self.peer_id.clone(),
        };
        framed.send_action(&action).await?;
        framed.send_file(path).await?;
        match framed.recv_action::<PeerReply>().await? {
            Some(PeerReply::Stored) => Ok(()),
            Some(other) => Err(TransportError::UnexpectedReply(format!("{:?}", other))),
            None => Err(TransportError::Closed),
        }
    }

    async fn fetch_from(&self, owner: &str, name: &str, local_name: &str) -> TransportResult<Option<PathBuf>> {
        let conn = self.connections.connect(owner).await?;
        let result = self.obtain(&conn, name, local_name).await;
        if result.is_err() {
            self.connections.evict(owner).await;
        }
        result
    }

    async fn obtain(&self, conn: &SharedConnection, name: &str, local_name: &str) -> TransportResult<Option<PathBuf>> {
        let mut framed = conn.lock().await;
        let action = PeerAction::Obtain {
            name: name.to_string(),
            from: self.peer_id.clone(),
        };
        framed.send_action(&action).await?;
        match framed.recv_action::<PeerReply>().await? {
            Some(PeerReply::Exists) => {
                let dest = self.download_dir.join(local_name);
                framed.recv_file(&dest).await?;
                Ok(Some(dest))
            }
            Some(PeerReply::Absent) => Ok(None),
            Some(other) => Err(TransportError::UnexpectedReply(format!("{:?}", other))),
            None => Err(TransportError::Closed),
        }
    }
}
