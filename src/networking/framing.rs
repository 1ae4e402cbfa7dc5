use crate::error::{TransportError, TransportResult};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

// Constants for the framed protocol
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;
const SEND_RETRIES: usize = 5;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Status of a file transfer, reported via progress callback
#[derive(Debug, Clone)]
pub enum TransferStatus {
    /// Transfer started
    Started {
        transfer_id: String,
        file_name: String,
        file_size: u64,
    },
    /// Transfer in progress
    Progress {
        transfer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        percent_complete: f32,
    },
    /// Transfer completed successfully
    Completed {
        transfer_id: String,
        bytes_transferred: u64,
        elapsed_seconds: f32,
        throughput_mbps: f32,
    },
    /// Transfer failed
    Failed {
        transfer_id: String,
        error: String,
    },
}

/// Type of progress callback for file transfers
pub type ProgressCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// Length-prefixed message and file streaming over a byte stream.
///
/// Every message is a 4-byte big-endian length followed by the payload.
/// Files are a 4-byte big-endian size header followed by the raw bytes,
/// written in `chunk_size` pieces.
pub struct FramedStream<S> {
    stream: S,
    chunk_size: usize,
    progress_callback: Option<ProgressCallback>,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_callback: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn report(&self, status: TransferStatus) {
        if let Some(callback) = &self.progress_callback {
            callback(status);
        }
    }
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one framed message.
    pub async fn send(&mut self, payload: &[u8]) -> TransportResult<()> {
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        self.write_with_retry(&buf).await
    }

    /// Receive one framed message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly before
    /// sending any byte of a new frame.
    pub async fn recv(&mut self) -> TransportResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.stream.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::Closed);
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len as usize];
        self.read_full(&mut payload).await?;
        Ok(Some(payload))
    }

    /// Serialize an action and send it as one frame.
    pub async fn send_action<T: Serialize>(&mut self, action: &T) -> TransportResult<()> {
        let payload = serde_json::to_vec(action)?;
        self.send(&payload).await
    }

    /// Receive one frame and decode it as an action.
    pub async fn recv_action<T: DeserializeOwned>(&mut self) -> TransportResult<Option<T>> {
        match self.recv().await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }

    /// Stream a file: size header then the contents in chunks.
    pub async fn send_file(&mut self, path: &Path) -> TransportResult<u64> {
        let mut file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let header = u32::try_from(file_size).map_err(|_| TransportError::FileTooLarge(file_size))?;

        debug!("Sending file {} ({} bytes)", path.display(), file_size);
        self.write_with_retry(&header.to_be_bytes()).await?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut position = 0u64;

        while position < file_size {
            let max_bytes = std::cmp::min(self.chunk_size as u64, file_size - position) as usize;
            let n = file.read(&mut buffer[..max_bytes]).await?;

            if n == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("{} shrank while being sent", path.display()),
                )));
            }

            self.write_with_retry(&buffer[..n]).await?;
            position += n as u64;
        }

        Ok(file_size)
    }

    /// Receive a streamed file into `dest`, returning its size.
    ///
    /// A partially received file is removed when the stream breaks.
    pub async fn recv_file(&mut self, dest: &Path) -> TransportResult<u64> {
        let transfer_id = Uuid::new_v4().to_string();

        let mut size_buf = [0u8; 4];
        self.read_full(&mut size_buf).await?;
        let file_size = u32::from_be_bytes(size_buf) as u64;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        debug!("Receiving file {} ({} bytes)", dest.display(), file_size);

        self.report(TransferStatus::Started {
            transfer_id: transfer_id.clone(),
            file_name,
            file_size,
        });

        let start_time = Instant::now();
        match self.copy_body(dest, &transfer_id, file_size).await {
            Ok(()) => {
                let elapsed_secs = start_time.elapsed().as_secs_f32();
                let throughput = if elapsed_secs > 0.0 {
                    (file_size as f32 / elapsed_secs) / (1024.0 * 1024.0)
                } else {
                    0.0
                };
                self.report(TransferStatus::Completed {
                    transfer_id,
                    bytes_transferred: file_size,
                    elapsed_seconds: elapsed_secs,
                    throughput_mbps: throughput,
                });
                Ok(file_size)
            }
            Err(e) => {
                warn!("Transfer into {} failed: {}", dest.display(), e);
                self.report(TransferStatus::Failed {
                    transfer_id,
                    error: e.to_string(),
                });
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    async fn copy_body(&mut self, dest: &Path, transfer_id: &str, file_size: u64) -> TransportResult<()> {
        let mut file = File::create(dest).await?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes_received = 0u64;

        while bytes_received < file_size {
            let max_bytes = std::cmp::min(buffer.len() as u64, file_size - bytes_received) as usize;
            let n = self.stream.read(&mut buffer[..max_bytes]).await?;

            if n == 0 {
                // EOF before expected end
                return Err(TransportError::Closed);
            }

            file.write_all(&buffer[..n]).await?;
            bytes_received += n as u64;

            if self.progress_callback.is_some() {
                let percent = (bytes_received as f32 / file_size as f32) * 100.0;
                self.report(TransferStatus::Progress {
                    transfer_id: transfer_id.to_string(),
                    bytes_transferred: bytes_received,
                    total_bytes: file_size,
                    percent_complete: percent,
                });
            }
        }

        file.flush().await?;
        Ok(())
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            filled += n;
        }
        Ok(())
    }

    async fn write_with_retry(&mut self, buf: &[u8]) -> TransportResult<()> {
        let mut written = 0;
        let mut retries = 0;

        while written < buf.len() {
            match self.stream.write(&buf[written..]).await {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock && retries < SEND_RETRIES => {
                    retries += 1;
                    debug!("Send would block, retry {}/{}", retries, SEND_RETRIES);
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tempfile::tempdir;
    use tokio::io::duplex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    enum Ping {
        Hello { name: String },
        Bye,
    }

    #[tokio::test]
    async fn test_payload_roundtrip() {
        let (a, b) = duplex(1024);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        let large: Vec<u8> = (0..3 * DEFAULT_CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let expected = vec![Vec::new(), vec![7u8], large];
        let to_send = expected.clone();

        let writer = tokio::spawn(async move {
            for payload in &to_send {
                tx.send(payload).await.unwrap();
            }
        });

        for payload in &expected {
            let received = rx.recv().await.unwrap().expect("frame");
            assert_eq!(&received, payload);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_is_no_message() {
        let (a, b) = duplex(64);
        drop(a);
        let mut rx = FramedStream::new(b);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_payload_is_protocol_error() {
        let (mut a, b) = duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let mut rx = FramedStream::new(b);
        assert!(matches!(rx.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_mid_header_is_protocol_error() {
        let (mut a, b) = duplex(64);
        a.write_all(&[0u8, 0]).await.unwrap();
        drop(a);

        let mut rx = FramedStream::new(b);
        assert!(matches!(rx.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();

        let mut rx = FramedStream::new(b);
        assert!(matches!(rx.recv().await, Err(TransportError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_action_roundtrip() {
        let (a, b) = duplex(256);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        tx.send_action(&Ping::Hello { name: "doc.txt".into() }).await.unwrap();
        tx.send_action(&Ping::Bye).await.unwrap();

        let first: Ping = rx.recv_action().await.unwrap().unwrap();
        let second: Ping = rx.recv_action().await.unwrap().unwrap();
        assert_eq!(first, Ping::Hello { name: "doc.txt".into() });
        assert_eq!(second, Ping::Bye);
    }

    #[tokio::test]
    async fn test_file_roundtrip_at_chunk_boundaries() {
        let _ = env_logger::builder().is_test(true).try_init();

        let chunk_size = 64;
        let dir = tempdir().unwrap();

        for size in [0usize, 1, chunk_size, chunk_size + 1] {
            let source = dir.path().join(format!("src_{}.bin", size));
            let dest = dir.path().join(format!("dst_{}.bin", size));
            let contents: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
            std::fs::write(&source, &contents).unwrap();

            let (a, b) = duplex(32);
            let mut tx = FramedStream::new(a).with_chunk_size(chunk_size);
            let mut rx = FramedStream::new(b).with_chunk_size(chunk_size);

            let send_path = source.clone();
            let writer = tokio::spawn(async move { tx.send_file(&send_path).await.unwrap() });

            let received = rx.recv_file(&dest).await.unwrap();
            assert_eq!(writer.await.unwrap(), size as u64);
            assert_eq!(received, size as u64);
            assert_eq!(std::fs::read(&dest).unwrap(), contents);
        }
    }

    #[tokio::test]
    async fn test_recv_file_reports_progress() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("progress.bin");
        std::fs::write(&source, vec![0x55u8; 1000]).unwrap();

        let completed = Arc::new(AtomicBool::new(false));
        let last_bytes = Arc::new(AtomicU64::new(0));
        let c = completed.clone();
        let l = last_bytes.clone();
        let callback: ProgressCallback = Arc::new(move |status| match status {
            TransferStatus::Progress { bytes_transferred, .. } => {
                l.store(bytes_transferred, Ordering::SeqCst);
            }
            TransferStatus::Completed { .. } => c.store(true, Ordering::SeqCst),
            TransferStatus::Failed { error, .. } => panic!("Transfer failed: {}", error),
            TransferStatus::Started { .. } => {}
        });

        let (a, b) = duplex(128);
        let mut tx = FramedStream::new(a).with_chunk_size(100);
        let mut rx = FramedStream::new(b).with_chunk_size(100).with_progress(callback);

        let writer = tokio::spawn(async move { tx.send_file(&source).await.unwrap() });
        rx.recv_file(&dir.path().join("out.bin")).await.unwrap();
        writer.await.unwrap();

        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(last_bytes.load(Ordering::SeqCst), 1000);
    }

    #[tokio::test]
    async fn test_truncated_file_stream_removes_partial_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("partial.bin");

        let (mut a, b) = duplex(64);
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1u8; 10]).await.unwrap();
        drop(a);

        let mut rx = FramedStream::new(b);
        assert!(matches!(rx.recv_file(&dest).await, Err(TransportError::Closed)));
        assert!(!dest.exists());
    }
}
