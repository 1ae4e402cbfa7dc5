pub mod client;
pub mod files;
pub mod protocol;
pub mod server;

pub use client::{PeerClient, RegisterReport};
pub use files::{LocalFiles, PeerStatus, PeerStatusMap};
pub use protocol::{PeerAction, PeerReply};
pub use server::FileServer;
