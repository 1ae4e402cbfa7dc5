use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

use super::files::{file_name_of, LocalFiles, PeerStatusMap};
use super::protocol::{PeerAction, PeerReply};
use crate::error::TransportError;
use crate::networking::framing::{FramedStream, ProgressCallback, DEFAULT_CHUNK_SIZE};
use crate::networking::server::{spawn_listener, wait_readable, Readiness, ServerHandle};
use crate::shutdown::Terminate;

/// Everything a connection worker needs; cloned into each task.
#[derive(Clone)]
struct FileServerContext {
    files: LocalFiles,
    statuses: PeerStatusMap,
    download_dir: PathBuf,
    poll_interval: Duration,
    chunk_size: usize,
    progress_callback: Option<ProgressCallback>,
    terminate: Terminate,
}

/// Serves this peer's files to other peers and accepts pushed replicas.
pub struct FileServer {
    context: FileServerContext,
}

impl FileServer {
    pub fn new(
        files: LocalFiles,
        statuses: PeerStatusMap,
        download_dir: PathBuf,
        poll_interval: Duration,
        terminate: Terminate,
    ) -> Self {
        Self {
            context: FileServerContext {
                files,
                statuses,
                download_dir,
                poll_interval,
                chunk_size: DEFAULT_CHUNK_SIZE,
                progress_callback: None,
                terminate,
            },
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.context.chunk_size = chunk_size;
        self
    }

    /// Report progress of incoming replicas.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.context.progress_callback = Some(callback);
        self
    }

    pub async fn start(&self, addr: SocketAddr) -> io::Result<ServerHandle> {
        let context = self.context.clone();
        spawn_listener("file server", addr, self.context.terminate.clone(), move |stream, peer_addr| {
            handle_connection(stream, peer_addr, context.clone())
        })
        .await
    }
}

/// Handle actions from one peer until it exits, misbehaves, or hangs up.
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, context: FileServerContext) -> Result<()> {
    let mut framed = FramedStream::new(stream).with_chunk_size(context.chunk_size);
    if let Some(callback) = &context.progress_callback {
        framed = framed.with_progress(callback.clone());
    }

    loop {
        if wait_readable(framed.get_ref(), &context.terminate, context.poll_interval).await?
            == Readiness::Terminated
        {
            debug!("File server worker for {} stopping on terminate", peer_addr);
            break;
        }

        let action = match framed.recv_action::<PeerAction>().await {
            Ok(Some(action)) => action,
            Ok(None) => break,
            Err(TransportError::Codec(e)) => {
                warn!("Unrecognized action from {}, closing: {}", peer_addr, e);
                break;
            }
            Err(e) => return Err(e).context(format!("reading action from {}", peer_addr)),
        };

        match action {
            PeerAction::Obtain { name, from } => {
                context.statuses.mark_connected(&from).await;
                match servable_path(&context.files, &name).await {
                    Some(path) => {
                        info!("Sending {} to {}", name, from);
                        framed.send_action(&PeerReply::Exists).await?;
                        framed
                            .send_file(&path)
                            .await
                            .with_context(|| format!("sending {} to {}", name, from))?;
                    }
                    None => {
                        debug!("{} asked for {}, which we do not have", from, name);
                        framed.send_action(&PeerReply::Absent).await?;
                    }
                }
            }
            PeerAction::Replicate { name, from } => {
                context.statuses.mark_connected(&from).await;
                let name = match file_name_of(&name) {
                    Some(name) => name,
                    None => {
                        warn!("Refusing replica with invalid name {:?} from {}", name, from);
                        break;
                    }
                };
                let dest = context.download_dir.join(&name);
                let size = framed
                    .recv_file(&dest)
                    .await
                    .with_context(|| format!("receiving replica of {} from {}", name, from))?;
                info!("Stored replica of {} ({} bytes) from {}", name, size, from);
                context.files.insert(name, dest).await;
                framed.send_action(&PeerReply::Stored).await?;
            }
            PeerAction::Exit { from } => {
                info!("Peer {} exited", from);
                context.statuses.mark_disconnected(&from).await;
                break;
            }
        }
    }

    Ok(())
}

/// Path of `name` if we hold it and it is still a regular file.
async fn servable_path(files: &LocalFiles, name: &str) -> Option<PathBuf> {
    let path = files.get(name).await?;
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => Some(path),
        _ => {
            warn!("{} is registered but {} is gone", name, path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::files::PeerStatus;
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::tempdir;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Fixture {
        handle: ServerHandle,
        files: LocalFiles,
        statuses: PeerStatusMap,
        terminate: Terminate,
        _dir: tempfile::TempDir,
        download_dir: PathBuf,
    }

    async fn start() -> Fixture {
        init_logging();
        let dir = tempdir().unwrap();
        let download_dir = dir.path().to_path_buf();
        let files = LocalFiles::new();
        let statuses = PeerStatusMap::new();
        let terminate = Terminate::new();
        let handle = FileServer::new(
            files.clone(),
            statuses.clone(),
            download_dir.clone(),
            Duration::from_millis(20),
            terminate.clone(),
        )
        .with_chunk_size(8)
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
        Fixture { handle, files, statuses, terminate, _dir: dir, download_dir }
    }

    async fn connect(fixture: &Fixture) -> FramedStream<TcpStream> {
        let stream = TcpStream::connect(fixture.handle.local_addr()).await.unwrap();
        FramedStream::new(stream).with_chunk_size(8)
    }

    fn obtain(name: &str) -> PeerAction {
        PeerAction::Obtain { name: name.to_string(), from: "127.0.0.1:1".to_string() }
    }

    #[tokio::test]
    async fn test_replicate_then_obtain_is_byte_identical() {
        let fixture = start().await;
        let src_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let mut framed = connect(&fixture).await;

        for (i, size) in [0usize, 1, 8, 9].into_iter().enumerate() {
            let name = format!("blob_{}.bin", i);
            let data: Vec<u8> = (0..size).map(|b| (b * 31 % 251) as u8).collect();
            let src = src_dir.path().join(&name);
            std::fs::write(&src, &data).unwrap();

            let push = PeerAction::Replicate { name: name.clone(), from: "127.0.0.1:1".to_string() };
            framed.send_action(&push).await.unwrap();
            framed.send_file(&src).await.unwrap();
            let reply: PeerReply = framed.recv_action().await.unwrap().unwrap();
            assert_eq!(reply, PeerReply::Stored);
            assert_eq!(std::fs::read(fixture.download_dir.join(&name)).unwrap(), data);

            framed.send_action(&obtain(&name)).await.unwrap();
            let reply: PeerReply = framed.recv_action().await.unwrap().unwrap();
            assert_eq!(reply, PeerReply::Exists);
            let out = out_dir.path().join(&name);
            assert_eq!(framed.recv_file(&out).await.unwrap(), size as u64);
            assert_eq!(std::fs::read(&out).unwrap(), data);
        }

        assert_eq!(fixture.files.entries().await.len(), 4);
        assert_eq!(fixture.statuses.status("127.0.0.1:1").await, Some(PeerStatus::Connected));
        fixture.terminate.trigger();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn test_obtain_unknown_file_is_absent() {
        let fixture = start().await;
        let mut framed = connect(&fixture).await;

        framed.send_action(&obtain("ghost.txt")).await.unwrap();
        let reply: PeerReply = framed.recv_action().await.unwrap().unwrap();
        assert_eq!(reply, PeerReply::Absent);

        // Registered but deleted from disk
        fixture
            .files
            .insert("gone.txt".to_string(), fixture.download_dir.join("gone.txt"))
            .await;
        framed.send_action(&obtain("gone.txt")).await.unwrap();
        let reply: PeerReply = framed.recv_action().await.unwrap().unwrap();
        assert_eq!(reply, PeerReply::Absent);
    }

    #[tokio::test]
    async fn test_exit_marks_peer_disconnected_and_closes() {
        let fixture = start().await;
        let mut framed = connect(&fixture).await;

        framed.send_action(&PeerAction::Exit { from: "10.1.1.1:7879".to_string() }).await.unwrap();
        assert!(matches!(framed.recv().await, Ok(None)));
        assert!(fixture.statuses.is_disconnected("10.1.1.1:7879").await);
    }

    #[tokio::test]
    async fn test_unrecognized_action_closes() {
        let fixture = start().await;
        let mut framed = connect(&fixture).await;

        framed.send(br#"{"type":"echo","msg":"hello"}"#).await.unwrap();
        assert!(matches!(framed.recv().await, Ok(None)));
    }

    #[tokio::test]
    async fn test_replica_progress_is_reported() {
        init_logging();
        let dir = tempdir().unwrap();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let terminate = Terminate::new();
        let handle = FileServer::new(
            LocalFiles::new(),
            PeerStatusMap::new(),
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            terminate.clone(),
        )
        .with_progress(Arc::new(move |status| sink.lock().unwrap().push(format!("{:?}", status))))
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

        let src_dir = tempdir().unwrap();
        let src = src_dir.path().join("p.bin");
        std::fs::write(&src, vec![7u8; 10_000]).unwrap();

        let mut framed = FramedStream::new(TcpStream::connect(handle.local_addr()).await.unwrap());
        let push = PeerAction::Replicate { name: "p.bin".to_string(), from: "x".to_string() };
        framed.send_action(&push).await.unwrap();
        framed.send_file(&src).await.unwrap();
        let reply: PeerReply = framed.recv_action().await.unwrap().unwrap();
        assert_eq!(reply, PeerReply::Stored);

        let events = events.lock().unwrap();
        assert!(events.first().unwrap().starts_with("Started"));
        assert!(events.last().unwrap().starts_with("Completed"));
        drop(events);

        terminate.trigger();
        handle.join().await;
    }
}
