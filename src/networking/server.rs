use anyhow::Result;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::framing::FramedStream;
use crate::shutdown::Terminate;

/// Outcome of waiting for a connection to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Terminated,
}

/// Wait until `stream` is readable, checking `terminate` on every poll tick.
pub async fn wait_readable(
    stream: &TcpStream,
    terminate: &Terminate,
    poll_interval: Duration,
) -> io::Result<Readiness> {
    loop {
        if terminate.is_set() {
            return Ok(Readiness::Terminated);
        }
        match tokio::time::timeout(poll_interval, stream.readable()).await {
            Ok(Ok(())) => return Ok(Readiness::Readable),
            Ok(Err(e)) => return Err(e),
            Err(_) => continue,
        }
    }
}

/// A running listener task.
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to exit (it does once `terminate` fires).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Server task on {} panicked: {}", self.local_addr, e);
        }
    }
}

/// Bind `addr` and spawn an accept loop handing every connection to its own task.
///
/// The loop stops accepting as soon as `terminate` fires; connection tasks
/// already running are left to notice the flag on their own.
pub async fn spawn_listener<F, Fut>(
    name: &'static str,
    addr: SocketAddr,
    terminate: Terminate,
    handler: F,
) -> io::Result<ServerHandle>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("{} listening on {}", name, local_addr);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                // Accept a new connection
                conn_result = listener.accept() => {
                    match conn_result {
                        Ok((socket, peer_addr)) => {
                            debug!("{}: new connection from {}", name, peer_addr);
                            let fut = handler(socket, peer_addr);
                            tokio::spawn(async move {
                                if let Err(e) = fut.await {
                                    error!("{}: error handling {}: {}", name, peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("{}: error accepting connection: {}", name, e);
                        }
                    }
                }

                // Check for shutdown signal
                _ = terminate.wait() => {
                    info!("Shutting down {}", name);
                    break;
                }
            }
        }
    });

    Ok(ServerHandle { local_addr, task })
}

/// Request/response loop shared by the index-side servers.
///
/// Each readable tick decodes one action, runs `handler`, and writes the
/// reply. Undecodable actions get `unknown` and the connection stays open.
/// The loop ends when the peer closes, `terminate` fires, or `handler`
/// asks to close after replying.
pub async fn serve_actions<Req, Resp, F, Fut>(
    stream: TcpStream,
    terminate: Terminate,
    poll_interval: Duration,
    unknown: Resp,
    mut handler: F,
) -> Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize + Clone,
    F: FnMut(Req) -> Fut,
    Fut: Future<Output = (Resp, bool)>,
{
    let mut framed = FramedStream::new(stream);

    loop {
        if wait_readable(framed.get_ref(), &terminate, poll_interval).await? == Readiness::Terminated {
            debug!("Connection worker stopping on terminate");
            break;
        }

        let payload = match framed.recv().await? {
            Some(payload) => payload,
            None => break,
        };

        let (reply, keep_open) = match serde_json::from_slice::<Req>(&payload) {
            Ok(request) => handler(request).await,
            Err(e) => {
                warn!("Unknown action received: {}", e);
                (unknown.clone(), true)
            }
        };

        framed.send_action(&reply).await?;
        if !keep_open {
            break;
        }
    }

    Ok(())
}
