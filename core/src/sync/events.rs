//! Events emitted by the session manager

use std::fmt;
use std::net::IpAddr;

use crate::protocol::{ClipboardData, ConnectionRequest, ConnectionResponse, FileChunkStart};
use crate::transfer::{ReceivedFile, TransferError, TransferProgress};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Socket closed or a read/write failed
    ConnectionClosed,
    /// Heartbeat ack or read deadline expired
    TimedOut,
    /// One side called `disconnect`
    UserDisconnected,
    /// The hub shut down
    HubShutdown,
    /// Free-form reason sent by the peer
    Peer(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::ConnectionClosed => "Connection closed",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::UserDisconnected => "User disconnected",
            DisconnectReason::HubShutdown => "Hub shutdown",
            DisconnectReason::Peer(reason) => reason,
        }
    }
}

impl From<String> for DisconnectReason {
    fn from(reason: String) -> Self {
        match reason.as_str() {
            "Connection closed" => DisconnectReason::ConnectionClosed,
            "timed out" => DisconnectReason::TimedOut,
            "User disconnected" => DisconnectReason::UserDisconnected,
            "Hub shutdown" => DisconnectReason::HubShutdown,
            _ => DisconnectReason::Peer(reason),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event from the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer asks to connect; answer with `send_response`
    RequestReceived {
        from: IpAddr,
        request: ConnectionRequest,
    },
    /// A peer answered our request; on acceptance call `connect`
    ResponseReceived {
        from: IpAddr,
        response: ConnectionResponse,
    },
    /// A session is live
    Connected { ip: IpAddr, is_initiator: bool },
    /// A session ended; fired exactly once per session
    Disconnected { ip: IpAddr, reason: DisconnectReason },
    /// Clipboard text from a peer
    ClipboardReceived { from: IpAddr, data: ClipboardData },
    /// A peer started sending a file
    ChunkStart { from: IpAddr, start: FileChunkStart },
    /// One chunk of an inbound file was stored
    ChunkData { from: IpAddr, progress: TransferProgress },
    /// An inbound file finished, verified or discarded
    ChunkComplete {
        from: IpAddr,
        outcome: Result<ReceivedFile, TransferError>,
    },
}
