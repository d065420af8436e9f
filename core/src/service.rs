//! High-level Clipshare service that coordinates all components

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::clipboard::{self, ClipboardContent, ClipboardManager};
use crate::discovery::{self, Device, DeviceRegistry};
use crate::protocol::constants::CLIPBOARD_POLL_INTERVAL_MS;
use crate::sync::{DisconnectReason, SessionEvent, SessionManager};
use crate::transfer::{checksum, ContentKind, FileBroadcast, TransferError, TransferProgress};
use crate::{Config, Error, Result};

/// Events emitted by the Clipshare service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// The discovered device list changed
    DevicesChanged(Vec<Device>),
    /// A peer asked to connect and we answered
    RequestAnswered { ip: IpAddr, name: String, accepted: bool },
    /// A peer answered our connection request
    ResponseReceived { ip: IpAddr, accepted: bool },
    Connected { ip: IpAddr, name: String, is_initiator: bool },
    Disconnected { ip: IpAddr, name: String, reason: DisconnectReason },
    /// Clipboard text from a peer was applied locally
    ClipboardReceived { from: IpAddr, name: String, text: String },
    /// Our clipboard text was sent to peers
    ClipboardSent { to: Vec<IpAddr> },
    /// A peer started sending a file
    FileIncoming { from: IpAddr, file_name: String, total_size: u64 },
    FileProgress { from: IpAddr, progress: TransferProgress },
    /// A file arrived intact and was saved
    FileReceived { from: IpAddr, file_name: String, path: PathBuf, kind: ContentKind },
    FileFailed { from: IpAddr, error: TransferError },
    /// A copied file was broadcast to peers
    FileSent { file_name: String, report: FileBroadcast },
    /// Error occurred
    Error(String),
}

/// Main Clipshare service
pub struct ClipshareService {
    config: Config,
    local_ip: IpAddr,
    auto_accept: bool,
    registry: Arc<DeviceRegistry>,
    clipboard: Arc<Mutex<ClipboardManager>>,
    manager: Option<SessionManager>,
    cancel: CancellationToken,
}

impl ClipshareService {
    pub fn new(config: Config) -> Self {
        let local_ip = config.local_ip.unwrap_or_else(discovery::preferred_local_ip);
        let registry = Arc::new(DeviceRegistry::from_config(&config));
        let clipboard = Arc::new(Mutex::new(ClipboardManager::new(config.download_dir.clone())));

        Self {
            config,
            local_ip,
            auto_accept: false,
            registry,
            clipboard,
            manager: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Answer incoming connection requests with `accept`
    pub fn with_auto_accept(mut self, accept: bool) -> Self {
        self.auto_accept = accept;
        self
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Session manager, once the service has started
    pub fn manager(&self) -> Option<&SessionManager> {
        self.manager.as_ref()
    }

    fn require_manager(&self) -> Result<&SessionManager> {
        self.manager
            .as_ref()
            .ok_or_else(|| Error::Network("service is not running".to_string()))
    }

    /// Start the service and return event channel
    pub async fn start(&mut self) -> Result<mpsc::Receiver<ServiceEvent>> {
        let (tx, rx) = mpsc::channel(64);

        let (manager, session_rx) = SessionManager::bind(
            self.local_ip,
            self.config.session_port,
            self.config.session.clone(),
            self.registry.clone(),
        )
        .await?;

        // Without a responder we can still scan and accept sessions
        if let Err(e) = discovery::spawn_responder(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.discovery_port),
            self.config.device_name.clone(),
            self.cancel.child_token(),
        )
        .await
        {
            tracing::warn!("other devices will not discover us: {}", e);
        }

        let context = Arc::new(EventContext {
            manager: manager.clone(),
            registry: self.registry.clone(),
            clipboard: self.clipboard.clone(),
            tx: tx.clone(),
            auto_accept: self.auto_accept,
        });

        tokio::spawn(session_event_loop(context, session_rx));
        tokio::spawn(scan_loop(
            self.registry.clone(),
            manager.clone(),
            self.config.device_name.clone(),
            self.config.scan_interval,
            tx.clone(),
            self.cancel.child_token(),
        ));
        tokio::spawn(clipboard_loop(
            self.clipboard.clone(),
            manager.clone(),
            tx,
            self.cancel.child_token(),
        ));

        tracing::info!(
            "clipshare service started as {} on {}:{}",
            self.config.device_name,
            self.local_ip,
            manager.port()
        );
        self.manager = Some(manager);
        Ok(rx)
    }

    /// Ask the device at `ip` to connect
    pub async fn request_connection(&self, ip: IpAddr) -> Result<()> {
        self.require_manager()?
            .send_request(&self.config.device_name, ip)
            .await
    }

    pub async fn disconnect(&self, ip: IpAddr) -> Result<()> {
        self.require_manager()?.disconnect(ip).await
    }

    /// Run one discovery round now
    pub async fn scan_now(&self) -> Result<bool> {
        self.registry.scan(&self.config.device_name).await
    }

    /// One page of discovered devices with their connection state
    pub async fn device_page(&self, page: usize, size: usize) -> Vec<Device> {
        let connected = match &self.manager {
            Some(manager) => manager.connected_ips().await,
            None => HashSet::new(),
        };
        mark_connected(self.registry.get_page(page, size).await, &connected)
    }

    /// Stop background tasks and tell connected peers we are leaving.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(manager) = &self.manager {
            manager.stop_listening();
            if manager.session_count().await > 0 {
                manager.shutdown_as_hub().await;
            }
        }
        tracing::info!("clipshare service stopped");
    }
}

fn mark_connected(mut devices: Vec<Device>, connected: &HashSet<IpAddr>) -> Vec<Device> {
    for device in &mut devices {
        device.connected = connected.contains(&device.ip);
    }
    devices
}

/// Everything the session event handler needs
struct EventContext {
    manager: SessionManager,
    registry: Arc<DeviceRegistry>,
    clipboard: Arc<Mutex<ClipboardManager>>,
    tx: mpsc::Sender<ServiceEvent>,
    auto_accept: bool,
}

impl EventContext {
    async fn name_of(&self, ip: IpAddr) -> String {
        if let Some(name) = self.manager.display_name(ip).await.filter(|n| !n.is_empty()) {
            return name;
        }
        self.registry
            .find_display_name(ip)
            .await
            .unwrap_or_else(|| ip.to_string())
    }

    async fn emit(&self, event: ServiceEvent) {
        let _ = self.tx.send(event).await;
    }
}

async fn session_event_loop(context: Arc<EventContext>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        handle_session_event(&context, event).await;
    }
    tracing::debug!("session event stream ended");
}

async fn handle_session_event(context: &Arc<EventContext>, event: SessionEvent) {
    match event {
        SessionEvent::RequestReceived { from, request } => {
            let accepted = context.auto_accept;
            tracing::info!(
                "{} connection request from {} ({})",
                if accepted { "accepting" } else { "declining" },
                request.from_name,
                from
            );

            match context.manager.send_response(from, accepted).await {
                Ok(()) => {
                    context
                        .emit(ServiceEvent::RequestAnswered { ip: from, name: request.from_name, accepted })
                        .await;
                }
                Err(e) => {
                    context
                        .emit(ServiceEvent::Error(format!("failed to answer {}: {}", from, e)))
                        .await;
                }
            }
        }
        SessionEvent::ResponseReceived { from, response } => {
            context
                .emit(ServiceEvent::ResponseReceived { ip: from, accepted: response.accept })
                .await;

            if response.accept {
                // Dialing can take up to the control timeout; keep events flowing
                let context = context.clone();
                tokio::spawn(async move {
                    let name = context.name_of(from).await;
                    if let Err(e) = context.manager.connect(from, &name).await {
                        context
                            .emit(ServiceEvent::Error(format!("failed to connect to {}: {}", name, e)))
                            .await;
                    }
                });
            }
        }
        SessionEvent::Connected { ip, is_initiator } => {
            let name = context.name_of(ip).await;
            context
                .emit(ServiceEvent::Connected { ip, name, is_initiator })
                .await;
        }
        SessionEvent::Disconnected { ip, reason } => {
            let name = context.name_of(ip).await;
            context
                .emit(ServiceEvent::Disconnected { ip, name, reason })
                .await;
        }
        SessionEvent::ClipboardReceived { from, data } => {
            if let Err(e) = context.clipboard.lock().await.apply_text(&data.content) {
                tracing::warn!("failed to apply clipboard from {}: {}", from, e);
            }
            let name = context.name_of(from).await;
            context
                .emit(ServiceEvent::ClipboardReceived { from, name, text: data.content })
                .await;
        }
        SessionEvent::ChunkStart { from, start } => {
            context
                .emit(ServiceEvent::FileIncoming {
                    from,
                    file_name: start.file_name,
                    total_size: start.total_size,
                })
                .await;
        }
        SessionEvent::ChunkData { from, progress } => {
            context.emit(ServiceEvent::FileProgress { from, progress }).await;
        }
        SessionEvent::ChunkComplete { from, outcome } => match outcome {
            Ok(file) => {
                let saved = context.clipboard.lock().await.apply_file(&file);
                match saved {
                    Ok(path) => {
                        context
                            .emit(ServiceEvent::FileReceived {
                                from,
                                file_name: file.file_name,
                                path,
                                kind: file.kind,
                            })
                            .await;
                    }
                    Err(e) => {
                        context
                            .emit(ServiceEvent::Error(format!("failed to save {}: {}", file.file_name, e)))
                            .await;
                    }
                }
            }
            Err(error) => {
                tracing::warn!("transfer from {} failed: {}", from, error);
                context.emit(ServiceEvent::FileFailed { from, error }).await;
            }
        },
    }
}

async fn scan_loop(
    registry: Arc<DeviceRegistry>,
    manager: SessionManager,
    device_name: String,
    interval: Duration,
    tx: mpsc::Sender<ServiceEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match registry.scan(&device_name).await {
            Ok(true) => {
                let connected = manager.connected_ips().await;
                let devices = mark_connected(registry.devices().await, &connected);
                if tx.send(ServiceEvent::DevicesChanged(devices)).await.is_err() {
                    break;
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("discovery scan failed: {}", e),
        }
    }
}

async fn clipboard_loop(
    clipboard: Arc<Mutex<ClipboardManager>>,
    manager: SessionManager,
    tx: mpsc::Sender<ServiceEvent>,
    cancel: CancellationToken,
) {
    let (mut changes, _handle) = clipboard::start_monitor(
        clipboard,
        Duration::from_millis(CLIPBOARD_POLL_INTERVAL_MS),
        cancel,
    );

    while let Some(content) = changes.recv().await {
        if manager.session_count().await == 0 {
            continue;
        }

        let event = match content {
            ClipboardContent::Text(text) => {
                let to = manager.broadcast_clipboard(&text).await;
                ServiceEvent::ClipboardSent { to }
            }
            ClipboardContent::File { file_name, data, .. }
            | ClipboardContent::Image { file_name, data } => {
                let sum = checksum(&data);
                let report = manager.broadcast_file(&file_name, data, &sum).await;
                ServiceEvent::FileSent { file_name, report }
            }
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }
}
