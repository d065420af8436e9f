//! UDP broadcast discovery of peers on the local network

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::constants::{DISCOVERY_PORT, PROBE_INTERVAL, SCAN_WINDOW};
use crate::{Config, Error, Result};

/// Largest probe or reply we accept; names are short
const MAX_DATAGRAM: usize = 1024;

/// A peer seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub ip: IpAddr,
    pub mac: Option<String>,
    /// Whether a live session exists; filled in by the reader of a page
    pub connected: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
            mac: None,
            connected: false,
        }
    }
}

/// Ordered list of peers found by the latest discovery round.
///
/// Entries keep the order in which they were first seen. No two entries
/// share an IP.
pub struct DeviceRegistry {
    devices: RwLock<Vec<Device>>,
    probe_target: SocketAddr,
    /// Local address probes are sent from; unspecified by default
    bind_ip: Option<IpAddr>,
    scan_window: Duration,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
            SCAN_WINDOW,
        )
    }
}

impl DeviceRegistry {
    pub fn new(probe_target: SocketAddr, scan_window: Duration) -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            probe_target,
            bind_ip: None,
            scan_window,
        }
    }

    /// Send probes from `ip` instead of the unspecified address.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SocketAddr::new(config.broadcast_addr, config.discovery_port),
            config.scan_window,
        )
    }

    /// Run one discovery round and merge the replies.
    ///
    /// Returns whether the visible device list changed.
    pub async fn scan(&self, local_name: &str) -> Result<bool> {
        let found = self.probe(local_name).await?;
        tracing::debug!("discovery round found {} peer(s)", found.len());
        Ok(self.merge(found).await)
    }

    async fn probe(&self, local_name: &str) -> Result<Vec<Device>> {
        let bind_ip = self.bind_ip.unwrap_or(if self.probe_target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        });
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|e| Error::Discovery(format!("failed to bind probe socket: {}", e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::Discovery(format!("failed to enable broadcast: {}", e)))?;

        let own = local_ips();
        let deadline = tokio::time::Instant::now() + self.scan_window;
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        let mut found: Vec<Device> = Vec::new();
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(local_name.as_bytes(), self.probe_target).await {
                        tracing::warn!("discovery probe to {} failed: {}", self.probe_target, e);
                    }
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let ip = from.ip().to_canonical();
                        if is_ignored_ip(ip) || own.contains(&ip) {
                            continue;
                        }
                        let name = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                        tracing::debug!("discovery reply from {} ({})", name, ip);
                        found.push(Device::new(name, ip));
                    }
                    Err(e) => tracing::debug!("discovery receive error: {}", e),
                }
            }
        }

        let arp = arp_table().await;
        for device in &mut found {
            device.mac = arp.get(&device.ip).cloned();
        }
        Ok(found)
    }

    /// Fold one round of discovery results into the registry.
    ///
    /// Known IPs get their name and MAC refreshed, new IPs are appended and
    /// IPs missing from this round are removed.
    pub async fn merge(&self, found: Vec<Device>) -> bool {
        let mut devices = self.devices.write().await;
        let mut changed = false;
        let mut seen = Vec::with_capacity(found.len());

        for device in found {
            seen.push(device.ip);
            match devices.iter_mut().find(|d| d.ip == device.ip) {
                Some(existing) => {
                    if existing.name != device.name || existing.mac != device.mac {
                        existing.name = device.name;
                        existing.mac = device.mac;
                        changed = true;
                    }
                }
                None => {
                    tracing::info!("discovered {} at {}", device.name, device.ip);
                    devices.push(Device { connected: false, ..device });
                    changed = true;
                }
            }
        }

        let before = devices.len();
        devices.retain(|d| {
            let keep = seen.contains(&d.ip);
            if !keep {
                tracing::info!("{} at {} is gone", d.name, d.ip);
            }
            keep
        });
        changed |= devices.len() != before;

        changed
    }

    /// One page of the device list. Out-of-range pages are empty.
    pub async fn get_page(&self, page: usize, size: usize) -> Vec<Device> {
        let devices = self.devices.read().await;
        if size == 0 {
            return Vec::new();
        }
        let start = page.saturating_mul(size);
        if start >= devices.len() {
            return Vec::new();
        }
        let end = start.saturating_add(size).min(devices.len());
        devices[start..end].to_vec()
    }

    pub async fn page_count(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        self.devices.read().await.len().div_ceil(size)
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Name advertised by the device at `ip`
    pub async fn find_display_name(&self, ip: IpAddr) -> Option<String> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.ip == ip)
            .map(|d| d.name.clone())
    }
}

/// Answer discovery probes arriving at `bind` with our display name until
/// cancelled. Returns the bound address alongside the task.
pub async fn spawn_responder(
    bind: SocketAddr,
    local_name: String,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| Error::Discovery(format!("failed to bind discovery socket {}: {}", bind, e)))?;
    let local_addr = socket
        .local_addr()
        .map_err(|e| Error::Discovery(format!("discovery socket has no address: {}", e)))?;

    tracing::info!("discovery responder on udp {}", local_addr);

    let task = tokio::spawn(async move {
        let own = local_ips();
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            let from = match received {
                Ok((_, from)) => from,
                Err(e) => {
                    tracing::debug!("discovery responder receive error: {}", e);
                    continue;
                }
            };

            if own.contains(&from.ip().to_canonical()) {
                continue;
            }

            if let Err(e) = socket.send_to(local_name.as_bytes(), from).await {
                tracing::debug!("discovery reply to {} failed: {}", from, e);
            }
        }
        tracing::info!("discovery responder stopped");
    });
    Ok((local_addr, task))
}

/// Loopback, host-only and container bridge ranges never count as peers
pub fn is_ignored_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4 == Ipv4Addr::LOCALHOST
                || (a == 192 && b == 168 && c == 56)
                || (a == 169 && b == 254)
                || (a == 172 && (b == 17 || b == 18))
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// All addresses assigned to this host
pub fn local_ips() -> Vec<IpAddr> {
    get_if_addrs::get_if_addrs()
        .map(|ifaces| ifaces.iter().map(|iface| iface.ip()).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InterfaceKind {
    Ethernet,
    Wifi,
    Other,
}

fn interface_kind(name: &str) -> Option<InterfaceKind> {
    let name = name.to_lowercase();
    let virtual_adapter = ["vbox", "virtual", "vm", "docker", "veth"]
        .iter()
        .any(|pattern| name.contains(pattern));
    if virtual_adapter {
        return None;
    }

    if name.contains("eth") || name.contains("en") {
        Some(InterfaceKind::Ethernet)
    } else if name.contains("wlan") || name.contains("wi") {
        Some(InterfaceKind::Wifi)
    } else {
        Some(InterfaceKind::Other)
    }
}

/// Pick the IPv4 address peers should reach us on.
///
/// Ethernet beats Wi-Fi beats anything else; virtual adapters and ignored
/// ranges are skipped.
pub fn preferred_local_ip() -> IpAddr {
    let mut best: Option<(InterfaceKind, IpAddr)> = None;

    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            let ip = iface.ip();
            if iface.is_loopback() || !ip.is_ipv4() || is_ignored_ip(ip) {
                continue;
            }
            let Some(kind) = interface_kind(&iface.name) else {
                continue;
            };
            if best.map_or(true, |(current, _)| kind < current) {
                best = Some((kind, ip));
            }
        }
    }

    if let Some((kind, ip)) = best {
        tracing::info!("selected {:?} address {}", kind, ip);
        return ip;
    }

    match outbound_ip() {
        Some(ip) => {
            tracing::info!("selected fallback address {}", ip);
            ip
        }
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Source address the OS would use for an outbound route. No packet is sent.
fn outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// IP to MAC mapping from the kernel ARP cache
#[cfg(target_os = "linux")]
async fn arp_table() -> HashMap<IpAddr, String> {
    match tokio::fs::read_to_string("/proc/net/arp").await {
        Ok(contents) => parse_arp_table(&contents),
        Err(e) => {
            tracing::debug!("arp cache unavailable: {}", e);
            HashMap::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn arp_table() -> HashMap<IpAddr, String> {
    HashMap::new()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_arp_table(contents: &str) -> HashMap<IpAddr, String> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let ip = fields.first()?.parse::<IpAddr>().ok()?;
            let mac = *fields.get(3)?;
            (mac != "00:00:00:00:00:00").then(|| (ip, mac.to_string()))
        })
        .collect()
}
