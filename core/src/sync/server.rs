//! Session manager: control handshake, inbound listener and session table

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::discovery::DeviceRegistry;
use crate::protocol::constants::{BROADCAST_ENQUEUE_TIMEOUT, DISCONNECT_FLUSH_TIMEOUT};
use crate::protocol::{
    unix_millis, unix_secs, ClipboardData, ConnectionRequest, ConnectionResponse,
    DisconnectNotice, Heartbeat, Message,
};
use crate::sync::connection::{spawn_tasks, Session};
use crate::sync::events::{DisconnectReason, SessionEvent};
use crate::sync::framing::{write_message, EnvelopeReader};
use crate::transfer::{send_file, FileBroadcast, OutgoingFile, TransferTracker};
use crate::{Error, Result, SessionConfig};

#[derive(Default)]
struct SessionTable {
    live: HashMap<IpAddr, Arc<Session>>,
    /// Peers an outbound `connect` is currently dialing
    dialing: HashSet<IpAddr>,
}

/// State shared between the manager handle and the per-session tasks
pub(crate) struct Shared {
    pub(crate) local_ip: IpAddr,
    pub(crate) port: u16,
    pub(crate) config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    table: RwLock<SessionTable>,
    transfers: TransferTracker,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // Nobody listening is not an error for the protocol
        let _ = self.events.send(event);
    }

    async fn session(&self, ip: IpAddr) -> Option<Arc<Session>> {
        self.table.read().await.live.get(&ip).cloned()
    }

    async fn sessions(&self) -> Vec<Arc<Session>> {
        self.table.read().await.live.values().cloned().collect()
    }

    /// Handle one decoded message from a live session.
    pub(crate) async fn dispatch(&self, session: &Arc<Session>, message: Message) {
        let from = session.ip();
        match message {
            Message::Heartbeat(_) => {
                if !session.try_enqueue(Message::HeartbeatAck) {
                    tracing::debug!("outbound queue to {} full, heartbeat ack dropped", from);
                }
            }
            Message::HeartbeatAck => session.touch_heartbeat().await,
            Message::Clipboard(data) => {
                tracing::debug!("clipboard text from {} ({} bytes)", from, data.content.len());
                self.emit(SessionEvent::ClipboardReceived { from, data });
            }
            Message::FileChunkStart(start) => {
                if self.transfers.start(start.clone(), from).await {
                    self.emit(SessionEvent::ChunkStart { from, start });
                }
            }
            Message::FileChunkData(chunk) => {
                if let Some(progress) = self.transfers.chunk(chunk, from).await {
                    self.emit(SessionEvent::ChunkData { from, progress });
                }
            }
            Message::FileChunkComplete(complete) => {
                if let Some(outcome) = self.transfers.complete(complete).await {
                    self.emit(SessionEvent::ChunkComplete { from, outcome });
                }
            }
            Message::Disconnect(notice) => {
                tracing::info!("{} is disconnecting: {}", from, notice.reason);
                self.teardown(session, DisconnectReason::from(notice.reason)).await;
            }
            Message::Shutdown => {
                tracing::info!("hub {} is shutting down", from);
                self.teardown(session, DisconnectReason::HubShutdown).await;
            }
            other @ (Message::Request(_) | Message::Response(_)) => {
                tracing::debug!("ignoring {} on live session with {}", other.message_type(), from);
            }
        }
    }

    /// Single exit path for every session. Only the first call for a
    /// session has any effect, so the disconnect event fires once.
    pub(crate) async fn teardown(&self, session: &Arc<Session>, reason: DisconnectReason) {
        if !session.close() {
            return;
        }

        let ip = session.ip();
        let replaced = {
            let mut table = self.table.write().await;
            if table.live.get(&ip).is_some_and(|s| Arc::ptr_eq(s, session)) {
                table.live.remove(&ip);
            }
            table.live.contains_key(&ip)
        };

        // Transfers are keyed by peer address, so a newer session for the
        // same peer keeps them.
        if !replaced {
            for error in self.transfers.abandon_from(ip).await {
                self.emit(SessionEvent::ChunkComplete { from: ip, outcome: Err(error) });
            }
        }

        tracing::info!("session with {} closed: {}", ip, reason);
        self.emit(SessionEvent::Disconnected { ip, reason });
    }

    /// Claim `ip` for an outbound dial.
    async fn reserve(&self, ip: IpAddr) -> Result<()> {
        let mut table = self.table.write().await;
        if table.live.contains_key(&ip) || !table.dialing.insert(ip) {
            return Err(Error::AlreadyConnected(ip));
        }
        Ok(())
    }

    async fn release(&self, ip: IpAddr) {
        self.table.write().await.dialing.remove(&ip);
    }

    /// Insert a new session, refusing a second one for the same peer.
    async fn register(
        &self,
        ip: IpAddr,
        display_name: String,
        is_initiator: bool,
    ) -> Result<(Arc<Session>, mpsc::Receiver<super::connection::Outbound>)> {
        let mut table = self.table.write().await;
        if is_initiator {
            table.dialing.remove(&ip);
        }
        if table.live.contains_key(&ip) {
            return Err(Error::AlreadyConnected(ip));
        }

        let (session, outbound) =
            Session::new(ip, display_name, is_initiator, self.config.queue_capacity);
        table.live.insert(ip, session.clone());
        Ok((session, outbound))
    }

    async fn dial(&self, ip: IpAddr) -> Result<TcpStream> {
        let socket = if ip.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };

        // Dial from our advertised address so the peer sees the IP it knows us by
        if self.local_ip.is_ipv4() == ip.is_ipv4() && !self.local_ip.is_unspecified() {
            socket.bind(SocketAddr::new(self.local_ip, 0))?;
        }

        let remote = SocketAddr::new(ip, self.port);
        let stream = tokio::time::timeout(self.config.control_timeout, socket.connect(remote))
            .await
            .map_err(|_| Error::Timeout(format!("dial {}", remote)))?
            .map_err(|e| Error::Network(format!("dial {}: {}", remote, e)))?;

        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn send_one_shot(&self, ip: IpAddr, message: &Message) -> Result<()> {
        let mut stream = self.dial(ip).await?;
        tokio::time::timeout(self.config.control_timeout, write_message(&mut stream, message))
            .await
            .map_err(|_| Error::Timeout(format!("send {} to {}", message.message_type(), ip)))??;
        Ok(())
    }

    fn heartbeat(&self) -> Message {
        Message::Heartbeat(Heartbeat {
            from_ip: self.local_ip.to_string(),
            timestamp: unix_millis(),
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!("incoming connection from {}", addr);
                    let _ = stream.set_nodelay(true);
                    let shared = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared.handle_incoming(stream, addr).await {
                            tracing::warn!("connection from {} dropped: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("accept error: {}", e);
                }
            }
        }
        tracing::info!("session listener stopped");
    }

    /// Classify an inbound connection by its first message.
    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ip = addr.ip().to_canonical();
        let (read_half, write_half) = stream.into_split();
        let mut reader = EnvelopeReader::new(read_half);

        let envelope = tokio::time::timeout(self.config.control_timeout, reader.next())
            .await
            .map_err(|_| Error::Timeout(format!("first message from {}", ip)))??;
        let Some(envelope) = envelope else {
            tracing::debug!("{} closed without sending anything", ip);
            return Ok(());
        };

        let first = match envelope.into_message() {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("dropping first message from {}: {}", ip, e);
                None
            }
        };

        match first {
            Some(Message::Request(request)) => {
                tracing::info!("connection request from {} ({})", request.from_name, ip);
                self.emit(SessionEvent::RequestReceived { from: ip, request });
                Ok(())
            }
            Some(Message::Response(response)) => {
                tracing::info!(
                    "connection {} by {}",
                    if response.accept { "accepted" } else { "declined" },
                    ip
                );
                self.emit(SessionEvent::ResponseReceived { from: ip, response });
                Ok(())
            }
            first => {
                let name = self.registry.find_display_name(ip).await.unwrap_or_default();
                let (session, outbound) = self.register(ip, name, false).await.inspect_err(|_| {
                    tracing::debug!("already connected to {}, closing duplicate", ip);
                })?;

                tracing::info!("accepted persistent connection from {}", ip);
                self.emit(SessionEvent::Connected { ip, is_initiator: false });

                if let Some(message) = first {
                    self.dispatch(&session, message).await;
                }
                spawn_tasks(self.clone(), session, reader, write_half, outbound);
                Ok(())
            }
        }
    }
}

/// Handle to the session manager.
///
/// Cloning is cheap; all clones drive the same listener and session table.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Bind the session port on `local_ip` and start accepting connections.
    pub async fn bind(
        local_ip: IpAddr,
        port: u16,
        config: SessionConfig,
        registry: Arc<DeviceRegistry>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let addr = SocketAddr::new(local_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind {}: {}", addr, e)))?;

        let actual_port = listener.local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();

        tracing::info!("session listener on {}:{}", local_ip, actual_port);

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local_ip,
            port: actual_port,
            config,
            registry,
            table: RwLock::new(SessionTable::default()),
            transfers: TransferTracker::new(),
            events: tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(shared.clone().accept_loop(listener));

        Ok((Self { shared }, rx))
    }

    pub fn local_ip(&self) -> IpAddr {
        self.shared.local_ip
    }

    /// Port the listener is bound to (and the port peers are dialed on)
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Ask `to_ip` to approve a connection.
    pub async fn send_request(&self, from_name: &str, to_ip: IpAddr) -> Result<()> {
        let request = Message::Request(ConnectionRequest {
            from_name: from_name.to_string(),
            from_ip: self.shared.local_ip.to_string(),
            from_mac: String::new(),
            to_ip: to_ip.to_string(),
        });
        self.shared.send_one_shot(to_ip, &request).await?;
        tracing::info!("connection request sent to {}", to_ip);
        Ok(())
    }

    /// Answer a connection request from `to_ip`.
    pub async fn send_response(&self, to_ip: IpAddr, accept: bool) -> Result<()> {
        let response = Message::Response(ConnectionResponse {
            from_ip: self.shared.local_ip.to_string(),
            from_mac: String::new(),
            to_ip: to_ip.to_string(),
            accept,
        });
        self.shared.send_one_shot(to_ip, &response).await
    }

    /// Open the persistent session to a peer that accepted our request.
    pub async fn connect(&self, ip: IpAddr, display_name: &str) -> Result<()> {
        self.shared.reserve(ip).await?;

        let stream = match self.shared.dial(ip).await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.release(ip).await;
                return Err(e);
            }
        };

        let (session, outbound) = self.shared
            .register(ip, display_name.to_string(), true)
            .await?;

        // The acceptor classifies the socket by its first message
        session.try_enqueue(self.shared.heartbeat());

        let (read_half, write_half) = stream.into_split();
        spawn_tasks(
            self.shared.clone(),
            session,
            EnvelopeReader::new(read_half),
            write_half,
            outbound,
        );

        tracing::info!("persistent connection to {} established", ip);
        self.shared.emit(SessionEvent::Connected { ip, is_initiator: true });
        Ok(())
    }

    /// Tell the peer we are leaving, then close the session.
    pub async fn disconnect(&self, ip: IpAddr) -> Result<()> {
        let session = self.shared.session(ip).await.ok_or(Error::NotConnected(ip))?;

        let notice = Message::Disconnect(DisconnectNotice {
            from_ip: self.shared.local_ip.to_string(),
            reason: DisconnectReason::UserDisconnected.to_string(),
        });
        if let Err(e) = session.enqueue_and_flush(notice, DISCONNECT_FLUSH_TIMEOUT).await {
            tracing::debug!("disconnect notice to {} not delivered: {}", ip, e);
        }

        self.shared.teardown(&session, DisconnectReason::UserDisconnected).await;
        Ok(())
    }

    /// Disconnect every live session.
    pub async fn disconnect_all(&self) {
        let mut tasks = JoinSet::new();
        for session in self.shared.sessions().await {
            let manager = self.clone();
            tasks.spawn(async move { manager.disconnect(session.ip()).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Ok(Err(e)) = result {
                tracing::debug!("disconnect failed: {}", e);
            }
        }
    }

    /// Notify every peer that this hub is exiting, then close all sessions.
    pub async fn shutdown_as_hub(&self) {
        let sessions = self.shared.sessions().await;
        tracing::info!("shutting down as hub, notifying {} peer(s)", sessions.len());

        let mut tasks = JoinSet::new();
        for session in sessions {
            let shared = self.shared.clone();
            tasks.spawn(async move {
                if let Err(e) = session.enqueue_and_flush(Message::Shutdown, BROADCAST_ENQUEUE_TIMEOUT).await {
                    tracing::debug!("shutdown notice to {} not delivered: {}", session.ip(), e);
                }
                shared.teardown(&session, DisconnectReason::HubShutdown).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Stop accepting new connections. Live sessions are unaffected.
    pub fn stop_listening(&self) {
        self.shared.shutdown.cancel();
    }

    pub async fn is_connected(&self, ip: IpAddr) -> bool {
        self.shared.table.read().await.live.contains_key(&ip)
    }

    pub async fn connected_ips(&self) -> HashSet<IpAddr> {
        self.shared.table.read().await.live.keys().copied().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.shared.table.read().await.live.len()
    }

    /// Inbound file transfers still waiting for their completion message
    pub async fn incoming_transfers(&self) -> usize {
        self.shared.transfers.active_count().await
    }

    /// Display name recorded for a live session
    pub async fn display_name(&self, ip: IpAddr) -> Option<String> {
        self.shared.session(ip).await.map(|s| s.display_name().to_string())
    }

    /// Push clipboard text to every live session.
    ///
    /// Returns the peers whose queue accepted the message.
    pub async fn broadcast_clipboard(&self, content: &str) -> Vec<IpAddr> {
        let message = Message::Clipboard(ClipboardData {
            from_ip: self.shared.local_ip.to_string(),
            content: content.to_string(),
            timestamp: unix_secs(),
        });

        let mut sent_to = Vec::new();
        for session in self.shared.sessions().await {
            match session.enqueue(message.clone(), BROADCAST_ENQUEUE_TIMEOUT).await {
                Ok(()) => sent_to.push(session.ip()),
                Err(e) => tracing::warn!("failed to send clipboard to {}: {}", session.ip(), e),
            }
        }
        sent_to
    }

    /// Send a file to every live session, one task per peer.
    ///
    /// Returns after every per-peer transfer has finished or given up.
    pub async fn broadcast_file(&self, file_name: &str, data: Vec<u8>, checksum: &str) -> FileBroadcast {
        let file = OutgoingFile::new(
            file_name.to_string(),
            data,
            checksum.to_string(),
            self.shared.local_ip.to_string(),
        );
        let sessions = self.shared.sessions().await;

        tracing::info!(
            "broadcasting {} in {} chunks ({} KB) to {} peer(s)",
            file.file_name,
            file.total_chunks(),
            file.data.len() / 1024,
            sessions.len()
        );

        let mut tasks = JoinSet::new();
        for session in sessions {
            let shared = self.shared.clone();
            let file = file.clone();
            tasks.spawn(async move {
                let result = send_file(&session, &file, &shared.config).await;
                (session.ip(), result.is_ok())
            });
        }

        let mut report = FileBroadcast {
            file_id: file.file_id.clone(),
            total_chunks: file.total_chunks(),
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((ip, true)) => report.delivered.push(ip),
                Ok((ip, false)) => report.failed.push(ip),
                Err(e) => tracing::error!("file transfer task failed: {}", e),
            }
        }
        report
    }
}
