pub mod protocol;
pub mod server;

pub use protocol::{DhtReply, DhtRequest};
pub use server::{dispatch, DhtServer};
