//! Clipshare Core - LAN clipboard sharing protocol
//!
//! This library discovers peers on the local network with UDP broadcast,
//! negotiates persistent TCP sessions between them, and mirrors clipboard
//! text and files over those sessions using a chunked transfer protocol
//! with whole-file checksums.

pub mod clipboard;
pub mod discovery;
pub mod protocol;
pub mod service;
pub mod sync;
pub mod transfer;

mod error;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{Error, Result};

use protocol::constants;

/// Timing and queueing parameters of live sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Maximum age of the last heartbeat ack before the session is dropped
    pub heartbeat_timeout: Duration,
    /// Maximum silence on the socket before the read side gives up
    pub read_timeout: Duration,
    /// Deadline for writing one envelope
    pub write_timeout: Duration,
    /// Dial and classification deadline for control messages
    pub control_timeout: Duration,
    /// Enqueue deadline per file chunk
    pub chunk_enqueue_timeout: Duration,
    /// Enqueue deadline for transfer start/complete markers
    pub marker_enqueue_timeout: Duration,
    /// Capacity of each session's outbound queue
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: constants::HEARTBEAT_INTERVAL,
            heartbeat_timeout: constants::HEARTBEAT_TIMEOUT,
            read_timeout: constants::READ_TIMEOUT,
            write_timeout: constants::WRITE_TIMEOUT,
            control_timeout: constants::CONTROL_TIMEOUT,
            chunk_enqueue_timeout: constants::CHUNK_ENQUEUE_TIMEOUT,
            marker_enqueue_timeout: constants::MARKER_ENQUEUE_TIMEOUT,
            queue_capacity: constants::OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

/// Configuration for the Clipshare service
#[derive(Debug, Clone)]
pub struct Config {
    /// Name shown to other peers
    pub device_name: String,
    /// Address to bind and dial from; picked automatically when `None`
    pub local_ip: Option<IpAddr>,
    /// TCP port for control messages and sessions
    pub session_port: u16,
    /// UDP port of the discovery responder
    pub discovery_port: u16,
    /// Destination of discovery probes
    pub broadcast_addr: IpAddr,
    /// Interval between automatic discovery rounds
    pub scan_interval: Duration,
    /// Length of one discovery round
    pub scan_window: Duration,
    /// Where received files are written
    pub download_dir: PathBuf,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            local_ip: None,
            session_port: constants::SESSION_PORT,
            discovery_port: constants::DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            scan_interval: constants::SCAN_INTERVAL,
            scan_window: constants::SCAN_WINDOW,
            download_dir: default_download_dir(),
            session: SessionConfig::default(),
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown".to_string())
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Clipshare")
}

// Re-export key types for convenience
pub use discovery::{Device, DeviceRegistry};
pub use protocol::{Message, MessageType};
pub use service::{ClipshareService, ServiceEvent};
pub use sync::{DisconnectReason, SessionEvent, SessionManager};
pub use transfer::{ContentKind, ReceivedFile, TransferError};
