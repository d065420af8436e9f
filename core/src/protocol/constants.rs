//! Centralized protocol constants
//!
//! Timing and sizing values that peers must agree on live here so the
//! session layer, the transfer engine and discovery stay consistent.

use std::time::Duration;

/// TCP port for one-shot control messages and persistent sessions
pub const SESSION_PORT: u16 = 54322;

/// UDP port the discovery responder listens on
pub const DISCOVERY_PORT: u16 = 54323;

/// Size of one file chunk on the wire (512 KiB)
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Interval between heartbeats on a live session
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A session whose last heartbeat ack is older than this is torn down
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum silence on a session socket before the read side gives up
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for writing one envelope to a session socket
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial and first-read deadline for control messages
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Enqueue deadline for a single file chunk onto a peer's queue
pub const CHUNK_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Enqueue deadline for the start/complete markers of a file transfer
pub const MARKER_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Enqueue deadline for clipboard text and the hub shutdown notice
pub const BROADCAST_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a disconnect notice may take to reach the socket
pub const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Enqueue deadline for a heartbeat before the session is considered stuck
pub const HEARTBEAT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of each session's outbound queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Length of one discovery round
pub const SCAN_WINDOW: Duration = Duration::from_secs(3);

/// Gap between discovery probes inside one round
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between automatic discovery rounds
pub const SCAN_INTERVAL: Duration = Duration::from_secs(4);

/// Largest envelope the stream decoder will buffer (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Clipboard polling interval in milliseconds
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 500;
