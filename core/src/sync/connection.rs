//! Live peer sessions and their supervising tasks

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::protocol::constants::HEARTBEAT_ENQUEUE_TIMEOUT;
use crate::protocol::{unix_millis, Heartbeat, Message};
use crate::sync::events::DisconnectReason;
use crate::sync::framing::{write_message, EnvelopeReader};
use crate::sync::server::Shared;
use crate::{Error, Result};

/// An envelope waiting in a session's outbound queue
pub(crate) struct Outbound {
    message: Message,
    /// Signalled once the write task has flushed this message
    flushed: Option<oneshot::Sender<()>>,
}

/// A persistent duplex connection to one peer
pub struct Session {
    ip: IpAddr,
    display_name: String,
    is_initiator: bool,
    last_heartbeat: RwLock<Instant>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        ip: IpAddr,
        display_name: String,
        is_initiator: bool,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let session = Arc::new(Self {
            ip,
            display_name,
            is_initiator,
            last_heartbeat: RwLock::new(Instant::now()),
            outbound: tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (session, rx)
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// True when this side dialed the session
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Time the peer last acknowledged a heartbeat
    pub async fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.read().await
    }

    pub(crate) async fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    /// Queue a message, waiting at most `wait` for room.
    pub async fn enqueue(&self, message: Message, wait: Duration) -> Result<()> {
        self.push(Outbound { message, flushed: None }, wait).await
    }

    /// Queue a message and wait until it has been written to the socket.
    pub async fn enqueue_and_flush(&self, message: Message, wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        let (tx, rx) = oneshot::channel();
        self.push(Outbound { message, flushed: Some(tx) }, wait).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NotConnected(self.ip)),
            Err(_) => Err(Error::Timeout(format!("flush to {}", self.ip))),
        }
    }

    /// Queue without waiting; false if the queue is full or closed.
    pub(crate) fn try_enqueue(&self, message: Message) -> bool {
        self.outbound.try_send(Outbound { message, flushed: None }).is_ok()
    }

    async fn push(&self, item: Outbound, wait: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected(self.ip));
        }
        self.outbound.send_timeout(item, wait).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => {
                Error::Timeout(format!("outbound queue to {} is full", self.ip))
            }
            SendTimeoutError::Closed(_) => Error::NotConnected(self.ip),
        })
    }

    /// Mark the session closed and cancel its tasks.
    /// Returns true only for the first caller.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.cancel.cancel();
        }
        first
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("ip", &self.ip)
            .field("display_name", &self.display_name)
            .field("is_initiator", &self.is_initiator)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Spawn the read, write and heartbeat tasks of a session.
pub(crate) fn spawn_tasks(
    shared: Arc<Shared>,
    session: Arc<Session>,
    reader: EnvelopeReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    outbound: mpsc::Receiver<Outbound>,
) {
    tokio::spawn(read_loop(shared.clone(), session.clone(), reader));
    tokio::spawn(write_loop(shared.clone(), session.clone(), writer, outbound));
    tokio::spawn(heartbeat_loop(shared, session));
}

async fn read_loop(shared: Arc<Shared>, session: Arc<Session>, mut reader: EnvelopeReader<OwnedReadHalf>) {
    let read_timeout = shared.config.read_timeout;

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return,
            next = tokio::time::timeout(read_timeout, reader.next()) => next,
        };

        let envelope = match next {
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => {
                tracing::debug!("{} closed the connection", session.ip);
                break DisconnectReason::ConnectionClosed;
            }
            Ok(Err(e)) => {
                tracing::debug!("read/decode error from {}: {}", session.ip, e);
                break DisconnectReason::ConnectionClosed;
            }
            Err(_) => {
                tracing::debug!("no data from {} within {:?}", session.ip, read_timeout);
                break DisconnectReason::TimedOut;
            }
        };

        match envelope.into_message() {
            Ok(message) => shared.dispatch(&session, message).await,
            Err(e) => tracing::warn!("dropping message from {}: {}", session.ip, e),
        }
    };

    shared.teardown(&session, reason).await;
}

async fn write_loop(
    shared: Arc<Shared>,
    session: Arc<Session>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    let write_timeout = shared.config.write_timeout;

    let failure = loop {
        let item = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break None,
            item = outbound.recv() => item,
        };
        let Some(item) = item else { break None };

        match tokio::time::timeout(write_timeout, write_message(&mut writer, &item.message)).await {
            Ok(Ok(())) => {
                if let Some(flushed) = item.flushed {
                    let _ = flushed.send(());
                }
            }
            Ok(Err(e)) => {
                tracing::debug!("write error to {}: {}", session.ip, e);
                break Some(DisconnectReason::ConnectionClosed);
            }
            Err(_) => {
                tracing::debug!("write to {} exceeded {:?}", session.ip, write_timeout);
                break Some(DisconnectReason::TimedOut);
            }
        }
    };

    let _ = writer.shutdown().await;

    if let Some(reason) = failure {
        shared.teardown(&session, reason).await;
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, session: Arc<Session>) {
    let interval = shared.config.heartbeat_interval;
    let timeout = shared.config.heartbeat_timeout;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let heartbeat = Message::Heartbeat(Heartbeat {
            from_ip: shared.local_ip.to_string(),
            timestamp: unix_millis(),
        });
        if let Err(e) = session.enqueue(heartbeat, HEARTBEAT_ENQUEUE_TIMEOUT).await {
            tracing::debug!("heartbeat to {} not queued: {}", session.ip, e);
            break;
        }

        if session.last_heartbeat().await.elapsed() > timeout {
            tracing::info!("connection to {} timed out", session.ip);
            break;
        }
    }

    shared.teardown(&session, DisconnectReason::TimedOut).await;
}
