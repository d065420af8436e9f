//! Wire message types, envelope encoding and dispatch

pub mod constants;
mod messages;
pub mod serde_utils;

pub use messages::{
    ClipboardData, ConnectionRequest, ConnectionResponse, DisconnectNotice, Envelope,
    FileChunkComplete, FileChunkData, FileChunkStart, Heartbeat, Message, MessageType,
};
pub(crate) use messages::{unix_millis, unix_secs};
