pub mod connection_cache;
pub mod framing;
pub mod server;

// Re-export key components for easier access
pub use connection_cache::{ConnectionCache, SharedConnection};
pub use framing::{FramedStream, ProgressCallback, TransferStatus};
pub use server::{serve_actions, spawn_listener, wait_readable, Readiness, ServerHandle};
