// src/config.rs
//
// Node configuration: a JSON file plus a few environment overrides

use log::debug;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::{Cluster, NodeInfo};
use crate::error::ConfigError;

pub const DEFAULT_FILE_SERVER_PORT: u16 = 7879;
pub const DEFAULT_IDX_SERVER_PORT: u16 = 7880;

/// Which indexing strategy the node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Centralized,
    Distributed,
}

/// One entry of the static node list. Ports default to the top-level ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    #[serde(default)]
    pub file_server_port: Option<u16>,
    #[serde(default)]
    pub idx_server_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub idx_type: IndexType,
    /// Address this node binds and identifies itself by; the local IP if unset
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default = "default_file_server_port")]
    pub file_server_port: u16,
    #[serde(default = "default_idx_server_port")]
    pub idx_server_port: u16,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    /// `address:port` of the central index server
    #[serde(default)]
    pub index_server: Option<String>,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Readiness poll interval of every connection worker
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a refused node stays marked down
    #[serde(default = "default_recheck_secs")]
    pub recheck_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_file_server_port() -> u16 {
    DEFAULT_FILE_SERVER_PORT
}

fn default_idx_server_port() -> u16 {
    DEFAULT_IDX_SERVER_PORT
}

fn default_replication_factor() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    200
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_recheck_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Config file path: the first CLI argument, else `DFS_CONFIG`.
pub fn config_path(arg: Option<String>) -> Option<PathBuf> {
    arg.or_else(|| env::var("DFS_CONFIG").ok()).map(PathBuf::from)
}

impl NodeConfig {
    /// Read, parse and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env_overrides();
        debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply `DFS_LOG_LEVEL`, `DFS_DOWNLOAD_DIR` and `DFS_REPLICATION` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("DFS_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(dir) = lookup("DFS_DOWNLOAD_DIR") {
            self.download_dir = Some(PathBuf::from(dir));
        }
        if let Some(rf) = lookup("DFS_REPLICATION").and_then(|v| v.parse().ok()) {
            self.replication_factor = rf;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_secs)
    }

    /// The address this node binds to and registers under.
    pub fn local_address(&self) -> Result<String, ConfigError> {
        match &self.bind_address {
            Some(address) => Ok(address.clone()),
            None => local_ip_address::local_ip()
                .map(|ip| ip.to_string())
                .map_err(|e| ConfigError::LocalAddress(e.to_string())),
        }
    }

    /// Peer id of this node: `address:file_server_port`.
    pub fn peer_id(&self) -> Result<String, ConfigError> {
        Ok(format!("{}:{}", self.local_address()?, self.file_server_port))
    }

    /// The static node list with ourselves located in it.
    pub fn cluster(&self) -> Result<Cluster, ConfigError> {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(id, entry)| NodeInfo {
                id,
                address: entry.address.clone(),
                file_server_port: entry.file_server_port.unwrap_or(self.file_server_port),
                idx_server_port: entry.idx_server_port.unwrap_or(self.idx_server_port),
            })
            .collect::<Vec<_>>();
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList);
        }
        Cluster::locate(nodes, &self.local_address()?, self.file_server_port)
    }

    pub fn index_server(&self) -> Result<&str, ConfigError> {
        self.index_server.as_deref().ok_or(ConfigError::MissingIndexServer)
    }

    /// Resolve the download directory and create it if needed.
    pub fn ensure_download_dir(&self) -> Result<PathBuf, ConfigError> {
        let dir = match &self.download_dir {
            Some(dir) => dir.clone(),
            None => dirs::download_dir()
                .or_else(dirs::home_dir)
                .map(|d| d.join("dfs"))
                .ok_or_else(|| ConfigError::MissingDownloadDir(PathBuf::from("dfs")))?,
        };
        std::fs::create_dir_all(&dir).map_err(|_| ConfigError::MissingDownloadDir(dir.clone()))?;
        Ok(dir)
    }
}
