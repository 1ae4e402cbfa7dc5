//! Multi-node scenarios over loopback.

use dfs_node::config::{IndexType, NodeConfig, NodeEntry};
use dfs_node::index::IndexServer;
use dfs_node::{IndexError, Node, Terminate};
use std::path::Path;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Ports that were free a moment ago.
async fn free_ports(count: usize) -> Vec<u16> {
    let mut listeners = Vec::new();
    for _ in 0..count {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    listeners.iter().map(|l| l.local_addr().unwrap().port()).collect()
}

fn base_config(idx_type: IndexType, file_port: u16, idx_port: u16, download_dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::from_json(r#"{"idx_type": "distributed"}"#).unwrap();
    config.idx_type = idx_type;
    config.bind_address = Some("127.0.0.1".to_string());
    config.file_server_port = file_port;
    config.idx_server_port = idx_port;
    config.download_dir = Some(download_dir.to_path_buf());
    config.timeout_ms = 20;
    config.connect_timeout_ms = 500;
    config
}

struct TestCluster {
    nodes: Vec<Option<Node>>,
    terminates: Vec<Terminate>,
    dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Start `count` distributed nodes with the given replication factor.
    async fn distributed(count: usize, replication_factor: usize) -> Self {
        let ports = free_ports(count * 2).await;
        let entries: Vec<NodeEntry> = (0..count)
            .map(|i| NodeEntry {
                address: "127.0.0.1".to_string(),
                file_server_port: Some(ports[2 * i]),
                idx_server_port: Some(ports[2 * i + 1]),
            })
            .collect();

        let mut nodes = Vec::new();
        let mut terminates = Vec::new();
        let mut dirs = Vec::new();
        for i in 0..count {
            let dir = tempdir().unwrap();
            let mut config = base_config(IndexType::Distributed, ports[2 * i], ports[2 * i + 1], dir.path());
            config.nodes = entries.clone();
            config.replication_factor = replication_factor;

            let terminate = Terminate::new();
            nodes.push(Some(Node::start(&config, terminate.clone(), None).await.unwrap()));
            terminates.push(terminate);
            dirs.push(dir);
        }
        Self { nodes, terminates, dirs }
    }

    fn node(&self, i: usize) -> &Node {
        self.nodes[i].as_ref().unwrap()
    }

    fn peer_id(&self, i: usize) -> String {
        self.node(i).client().peer_id().to_string()
    }

    /// Stop node `i` abruptly: its servers stop accepting and its workers close.
    async fn kill(&mut self, i: usize) {
        self.terminates[i].trigger();
        self.nodes[i] = None;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn write_file(&self, i: usize, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = self.dirs[i].path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn shutdown(mut self) {
        for node in self.nodes.iter_mut() {
            if let Some(node) = node.take() {
                node.shutdown().await;
            }
        }
    }
}

#[tokio::test]
async fn test_three_nodes_register_search_lookup() {
    init_logging();
    let cluster = TestCluster::distributed(3, 1).await;
    let data = b"the quick brown fox jumps over the lazy dog".repeat(300);
    // Index copies on node 2 and node 0, so node 1 is the push target.
    let name = (0..)
        .map(|i| format!("fox_{}.txt", i))
        .find(|name| primary_of(&cluster, name) == 2)
        .unwrap();
    let src = cluster.write_file(0, &name, &data);

    let report = cluster.node(0).client().register(&src).await.unwrap();
    // With factor 1 the one node holding no index copy gets the file.
    assert_eq!(report.replicated_to, vec![cluster.peer_id(1)]);
    assert!(report.skipped.is_empty());

    // Node 2 sees both holders; the registrant does not see itself.
    let owners = cluster.node(2).client().search(&name).await.unwrap();
    assert_eq!(owners, vec![cluster.peer_id(0), cluster.peer_id(1)]);
    let own_view = cluster.node(0).client().search(&name).await.unwrap();
    assert_eq!(own_view, vec![cluster.peer_id(1)]);

    let downloaded = cluster.node(2).client().lookup(&name).await.unwrap().unwrap();
    assert_eq!(std::fs::read(downloaded).unwrap(), data);

    let listing = cluster.node(1).client().list().await.unwrap();
    assert!(listing.contains(&name));

    assert!(cluster.node(1).client().search("nobody-has-this").await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_register_missing_file_leaves_no_entry() {
    init_logging();
    let cluster = TestCluster::distributed(3, 1).await;
    let missing = cluster.dirs[0].path().join("missing.txt");

    assert!(cluster.node(0).client().register(&missing).await.is_err());
    assert!(cluster.node(1).client().search("missing.txt").await.unwrap().is_empty());
    assert!(cluster.node(2).client().list().await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_search_fails_over_to_replica_then_reports_unreachable() {
    init_logging();
    let mut cluster = TestCluster::distributed(3, 0).await;

    // A name whose primary is node 1 and replica node 2, registered by node 0.
    let name = (0..)
        .map(|i| format!("doc_{}.txt", i))
        .find(|name| primary_of(&cluster, name) == 1)
        .unwrap();
    let src = cluster.write_file(0, &name, b"failover");
    cluster.node(0).client().register(&src).await.unwrap();

    cluster.kill(1).await;
    // Primary down, replica up
    let owners = cluster.node(2).client().search(&name).await.unwrap();
    assert_eq!(owners, vec![cluster.peer_id(0)]);

    cluster.kill(2).await;
    // Both down: a failure, not an empty result
    match cluster.node(0).client().search(&name).await {
        Err(IndexError::Unreachable { primary: 1, replica: 2 }) => {}
        other => panic!("expected Unreachable, got {:?}", other),
    }
    cluster.shutdown().await;
}

fn primary_of(cluster: &TestCluster, name: &str) -> usize {
    (dfs_node::cluster::numeric_hash(name) % cluster.nodes.len() as u128) as usize
}

#[tokio::test]
async fn test_centralized_end_to_end() {
    init_logging();
    let ports = free_ports(3).await;
    let index_addr = format!("127.0.0.1:{}", ports[2]);

    let server_terminate = Terminate::new();
    let server = IndexServer::new(1, Duration::from_millis(20), server_terminate.clone());
    let handle = server.start(index_addr.parse().unwrap()).await.unwrap();

    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for port in &ports[..2] {
        let dir = tempdir().unwrap();
        let mut config = base_config(IndexType::Centralized, *port, 0, dir.path());
        config.index_server = Some(index_addr.clone());
        nodes.push(Node::start(&config, Terminate::new(), None).await.unwrap());
        dirs.push(dir);
    }
    let a = &nodes[0];
    let b = &nodes[1];

    let src = dirs[0].path().join("song.mp3");
    std::fs::write(&src, vec![42u8; 9000]).unwrap();
    let report = a.client().register(&src).await.unwrap();
    // The only other live peer is sampled as the replication target.
    assert_eq!(report.replicated_to, vec![b.client().peer_id().to_string()]);
    assert!(dirs[1].path().join("song.mp3").is_file());

    let owners = b.client().search("song.mp3").await.unwrap();
    assert_eq!(owners, vec![a.client().peer_id().to_string()]);
    assert!(a.client().list().await.unwrap().contains("song.mp3"));

    let state = server.state();
    assert!(state.lock().await.is_live(a.client().peer_id()));

    // Closing drops the leaving peer from the index
    let a_id = a.client().peer_id().to_string();
    let mut nodes = nodes.into_iter();
    let a = nodes.next().unwrap();
    let b = nodes.next().unwrap();
    a.shutdown().await;
    assert!(!state.lock().await.is_live(&a_id));
    assert!(b.client().search("song.mp3").await.unwrap().is_empty());

    b.shutdown().await;
    server_terminate.trigger();
    handle.join().await;
}

#[tokio::test]
async fn test_centralized_server_down_is_an_error() {
    init_logging();
    let ports = free_ports(2).await;
    let dir = tempdir().unwrap();
    let mut config = base_config(IndexType::Centralized, ports[0], 0, dir.path());
    config.index_server = Some(format!("127.0.0.1:{}", ports[1]));

    let node = Node::start(&config, Terminate::new(), None).await.unwrap();
    assert!(matches!(
        node.client().search("anything").await,
        Err(IndexError::ServerUnreachable(_))
    ));
    node.shutdown().await;
}
