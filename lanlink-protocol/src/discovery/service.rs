//! Async Discovery and Listener Service
//!
//! Owns the UDP announce socket and the TCP control listener. Broadcasts the
//! local identity, turns received identities into outbound channels and
//! accepts inbound channels, attaching each to its device.
//!
//! Connection attempts are tracked per `(host, direction)`. A newer inbound
//! attempt from a host cancels the older one. When an inbound attempt meets
//! our own outbound attempt to the same host, the connection dialed by the
//! device with the greater id is kept on both sides.

use super::events::ServiceEvent;
use crate::channel::{Channel, Direction, IncomingChannel};
use crate::device::{Device, DeviceRegistry, PacketRouter};
use crate::identity::{self, DeviceInfo};
use crate::tls::TlsContext;
use crate::transfer::Transfer;
use crate::{Packet, ProtocolError, Result};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Default broadcast interval (5 seconds)
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Largest UDP payload
const MAX_DATAGRAM_SIZE: usize = 65_507;

const EVENT_CAPACITY: usize = 64;

/// Configuration for the discovery service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address both sockets bind to
    pub bind_address: IpAddr,

    /// UDP announce port
    pub udp_port: u16,

    /// TCP control port
    pub tcp_port: u16,

    /// Target of undirected broadcasts
    pub broadcast_address: SocketAddr,

    /// Hosts that are also announced to directly on every interval
    pub broadcast_to: Vec<SocketAddr>,

    /// Ports scanned by transfer uploads
    pub transfer_ports: RangeInclusive<u16>,

    /// Advertised control ports we are willing to dial
    pub dial_ports: RangeInclusive<u16>,

    /// Period of the announce loop; zero disables it
    pub broadcast_interval: Duration,

    /// Whether unknown devices may be admitted
    pub discoverable: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: crate::DISCOVERY_PORT,
            tcp_port: crate::CONTROL_PORT,
            broadcast_address: SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), crate::DISCOVERY_PORT),
            broadcast_to: Vec::new(),
            transfer_ports: crate::TRANSFER_PORT_START..=crate::TRANSFER_PORT_END,
            dial_ports: crate::CONTROL_PORT..=crate::TRANSFER_PORT_END,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            discoverable: true,
        }
    }
}

struct Attempt {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    local: DeviceInfo,
    config: ServiceConfig,
    udp: UdpSocket,
    udp_port: u16,
    tcp_port: u16,
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<DeviceRegistry>,
    tls: Arc<TlsContext>,
    router: Arc<dyn PacketRouter>,
    discoverable: AtomicBool,
    network_available: AtomicBool,
    allowed: Mutex<HashSet<IpAddr>>,
    in_flight: Mutex<HashMap<(IpAddr, Direction), Attempt>>,
    next_attempt: AtomicU64,
    shutdown: CancellationToken,
    events: broadcast::Sender<ServiceEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Discovery and listener service
///
/// Cheap to clone; clones share the same sockets and state. Runs three
/// concurrent tasks once started:
/// - UDP listener: receives identity packets
/// - TCP listener: accepts inbound channels
/// - Broadcaster: announces the local identity at regular intervals, then
///   redials paired devices and prunes stale unpaired ones
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl DiscoveryService {
    /// Bind the UDP and TCP sockets
    ///
    /// The local identity advertises the TCP port actually bound. If the TCP
    /// bind fails the UDP socket is released before the error is returned.
    pub async fn bind(
        config: ServiceConfig,
        local: DeviceInfo,
        registry: Arc<DeviceRegistry>,
        tls: Arc<TlsContext>,
        router: Arc<dyn PacketRouter>,
    ) -> Result<Self> {
        let udp_addr = SocketAddr::new(config.bind_address, config.udp_port);
        let udp = UdpSocket::bind(udp_addr).await.map_err(|source| {
            error!("Failed to bind UDP port {}: {}", config.udp_port, source);
            ProtocolError::Bind {
                protocol: "UDP",
                port: config.udp_port,
                source,
            }
        })?;
        udp.set_broadcast(true)?;
        let udp_port = udp.local_addr()?.port();

        let tcp_addr = SocketAddr::new(config.bind_address, config.tcp_port);
        let listener = match TcpListener::bind(tcp_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!("Failed to bind TCP port {}: {}", config.tcp_port, source);
                drop(udp);
                return Err(ProtocolError::Bind {
                    protocol: "TCP",
                    port: config.tcp_port,
                    source,
                });
            }
        };
        let tcp_port = listener.local_addr()?.port();
        info!("Bound UDP port {} and TCP port {}", udp_port, tcp_port);

        let local = DeviceInfo {
            tcp_port,
            tcp_host: None,
            ..local
        }
        .with_capabilities_from(registry.plugins());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                local,
                discoverable: AtomicBool::new(config.discoverable),
                config,
                udp,
                udp_port,
                tcp_port,
                listener: Mutex::new(Some(listener)),
                registry,
                tls,
                router,
                network_available: AtomicBool::new(true),
                allowed: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                events,
            }),
        })
    }

    /// Spawn the listener and broadcaster tasks
    pub async fn start(&self) -> Result<()> {
        let listener = lock(&self.inner.listener).take().ok_or_else(|| {
            ProtocolError::InvalidState("discovery service already started".to_string())
        })?;

        for target in &self.inner.config.broadcast_to {
            self.allow_host(target.ip());
        }

        tokio::spawn(self.clone().run_udp_listener());
        tokio::spawn(self.clone().run_tcp_listener(listener));

        let period = self.inner.config.broadcast_interval;
        if period.is_zero() {
            debug!("Periodic broadcast disabled");
        } else {
            tokio::spawn(self.clone().run_broadcaster(period));
        }

        info!(
            "Discovery service started (UDP {}, TCP {})",
            self.inner.udp_port, self.inner.tcp_port
        );
        self.emit(ServiceEvent::Started {
            udp_port: self.inner.udp_port,
            tcp_port: self.inner.tcp_port,
        });
        Ok(())
    }

    /// Stop every task and close every channel
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        info!("Discovery service stopped");
        self.emit(ServiceEvent::Stopped);
    }

    /// Subscribe to service events
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Local identity, advertising the bound TCP port
    pub fn local_identity(&self) -> &DeviceInfo {
        &self.inner.local
    }

    pub fn udp_port(&self) -> u16 {
        self.inner.udp_port
    }

    pub fn tcp_port(&self) -> u16 {
        self.inner.tcp_port
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn tls(&self) -> &Arc<TlsContext> {
        &self.inner.tls
    }

    pub fn is_discoverable(&self) -> bool {
        self.inner.discoverable.load(Ordering::SeqCst)
    }

    pub fn set_discoverable(&self, discoverable: bool) {
        if self.inner.discoverable.swap(discoverable, Ordering::SeqCst) != discoverable {
            info!("Discoverable: {}", discoverable);
        }
    }

    /// Whether inbound connections from `host` are accepted while not discoverable
    pub fn is_allowed(&self, host: IpAddr) -> bool {
        lock(&self.inner.allowed).contains(&host)
    }

    fn allow_host(&self, host: IpAddr) {
        if lock(&self.inner.allowed).insert(host) {
            debug!("Allowing connections from {}", host);
        }
    }

    pub fn is_network_available(&self) -> bool {
        self.inner.network_available.load(Ordering::SeqCst)
    }

    /// Network monitor input
    ///
    /// Becoming available triggers a broadcast.
    pub async fn set_network_available(&self, available: bool) -> Result<()> {
        let was = self.inner.network_available.swap(available, Ordering::SeqCst);
        if available && !was {
            info!("Network available, announcing");
            self.broadcast(None).await?;
        } else if !available && was {
            info!("Network unavailable");
        }
        Ok(())
    }

    /// Number of connection attempts in flight
    pub fn pending_connections(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    fn identity_packet(&self) -> Packet {
        identity::build(&self.inner.local, self.inner.registry.plugins())
    }

    /// Send the local identity
    ///
    /// Without a target the identity goes to the broadcast address. A
    /// directed broadcast also allows later inbound connections from that
    /// host. No-op while the network is unavailable.
    pub async fn broadcast(&self, target: Option<SocketAddr>) -> Result<()> {
        if !self.is_network_available() {
            warn!("Network unavailable, not broadcasting identity");
            return Ok(());
        }

        let addr = match target {
            Some(addr) => {
                self.allow_host(addr.ip());
                addr
            }
            None => self.inner.config.broadcast_address,
        };

        let bytes = self.identity_packet().to_bytes()?;
        let sent = self.inner.udp.send_to(&bytes, addr).await?;
        debug!("Sent identity ({} bytes) to {}", sent, addr);
        Ok(())
    }

    /// Queue a packet for a known device
    pub async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        let device = self
            .inner
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        device.send_packet(packet).await
    }

    /// Create a transfer for `device` using this service's port range
    pub fn create_transfer(&self, device: &Arc<Device>, size: u64, checksum: Option<String>) -> Transfer {
        let transfer = Transfer::new(Arc::clone(device), Arc::clone(&self.inner.tls), size)
            .with_port_range(self.inner.config.transfer_ports.clone())
            .with_bind_address(self.inner.config.bind_address);
        match checksum {
            Some(checksum) => transfer.with_checksum(checksum),
            None => transfer,
        }
    }

    /// Redial paired devices and forget stale unpaired ones
    ///
    /// A disconnected paired device gets our identity sent directly to its
    /// last known host, which prompts it to dial back. A disconnected
    /// unpaired device with no channel and no attempt in flight is removed
    /// once it has not been seen for a broadcast period.
    pub async fn reconnect(&self) {
        let stale_after =
            i64::try_from(self.inner.config.broadcast_interval.as_millis()).unwrap_or(i64::MAX);
        let now = crate::current_timestamp();

        for device in self.inner.registry.devices().await {
            if device.is_connected().await || device.channel_id().await.is_some() {
                continue;
            }
            let host = device.host().await;

            if device.is_paired().await {
                let Some(host) = host else {
                    debug!("No known address for paired device {}", device.id());
                    continue;
                };
                let target = SocketAddr::new(host, self.inner.config.broadcast_address.port());
                if let Err(e) = self.broadcast(Some(target)).await {
                    warn!("Failed to send identity to {}: {}", target, e);
                }
                continue;
            }

            if host.is_some_and(|host| self.is_attempting(host)) {
                continue;
            }
            if now.saturating_sub(device.last_seen().await) < stale_after {
                continue;
            }
            debug!("Pruning disconnected device {}", device.id());
            self.inner.registry.remove(device.id()).await;
        }
    }

    /// Existing device, or a new one if this peer may be admitted
    async fn admit(&self, info: &DeviceInfo, host: IpAddr) -> Result<Arc<Device>> {
        if let Some(device) = self.inner.registry.get(&info.device_id).await {
            return Ok(device);
        }

        if !self.is_discoverable() && !self.is_allowed(host) {
            warn!(
                "Ignoring unsolicited device '{}' ({}) at {}: not discoverable",
                info.device_name, info.device_id, host
            );
            return Err(ProtocolError::DeviceNotAllowed(info.device_name.clone()));
        }

        let (device, created) = self.inner.registry.get_or_create(info.clone()).await;
        if created {
            self.emit(ServiceEvent::DeviceDiscovered {
                device_id: info.device_id.clone(),
                device_name: info.device_name.clone(),
                host,
            });
        }
        Ok(device)
    }

    /// Handle an identity received over UDP from `source`
    ///
    /// Connected devices only get their identity refreshed; otherwise an
    /// outbound channel is opened in the background.
    pub async fn on_identity(&self, mut packet: Packet, source: SocketAddr) -> Result<()> {
        let host = source.ip();
        identity::stamp_host(&mut packet, host);
        let info = identity::validate(&packet)?;

        if info.device_id == self.inner.local.device_id {
            debug!("Ignoring our own identity from {}", source);
            return Ok(());
        }

        let device = self.admit(&info, host).await?;
        device.handle_identity(info.clone()).await;

        if device.is_connected().await {
            debug!("{} already connected, identity refreshed", info.device_name);
            return Ok(());
        }

        if info.tcp_port == 0 {
            return Err(ProtocolError::InvalidIdentity(format!(
                "{} advertises no tcpPort",
                info.device_name
            )));
        }
        if !self.inner.config.dial_ports.contains(&info.tcp_port) {
            return Err(ProtocolError::InvalidIdentity(format!(
                "{} advertises tcpPort {} outside {:?}",
                info.device_name, info.tcp_port, self.inner.config.dial_ports
            )));
        }

        let Some((attempt, cancel)) = self.begin_outbound(host) else {
            debug!("Connection with {} already in progress", host);
            return Ok(());
        };

        let addr = SocketAddr::new(host, info.tcp_port);
        let service = self.clone();
        tokio::spawn(async move {
            let result = service.dial(addr, info, &device, cancel).await;
            service.end_attempt(host, Direction::Outbound, attempt);
            if let Err(e) = result {
                service.report(&e, host);
            }
        });
        Ok(())
    }

    async fn dial(
        &self,
        addr: SocketAddr,
        info: DeviceInfo,
        device: &Arc<Device>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!("Connecting to {} at {}", info.device_name, addr);
        let channel = Channel::open(addr, info, &self.identity_packet(), &self.inner.tls, cancel).await?;
        self.attach(channel, device).await
    }

    /// Handle an accepted TCP connection
    ///
    /// Cancels any older inbound attempt from the same host, runs the inbound
    /// handshake, then attaches the channel to the existing or newly admitted
    /// device.
    pub async fn on_incoming_connection(&self, tcp: TcpStream, addr: SocketAddr) -> Result<()> {
        let host = addr.ip();
        let (attempt, cancel) = self.begin_inbound(host);

        let result = self.accept(tcp, host, cancel).await;
        self.end_attempt(host, Direction::Inbound, attempt);
        result
    }

    async fn accept(&self, tcp: TcpStream, host: IpAddr, cancel: CancellationToken) -> Result<()> {
        let incoming = IncomingChannel::receive_identity(tcp, cancel).await?;
        let peer = incoming.peer().clone();

        if peer.device_id == self.inner.local.device_id {
            incoming.close();
            return Err(ProtocolError::InvalidIdentity(
                "connection from our own device id".to_string(),
            ));
        }

        if !self.inbound_wins(&peer, host).await {
            debug!(
                "Keeping our own connection to {}, dropping theirs",
                peer.device_name
            );
            incoming.close();
            return Err(ProtocolError::Cancelled(format!(
                "simultaneous connection from {}",
                host
            )));
        }

        let channel = incoming.secure(&self.inner.tls).await?;
        let device = match self.admit(channel.peer(), host).await {
            Ok(device) => device,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        self.attach(channel, &device).await
    }

    /// Decide whether an inbound connection replaces our own dial
    ///
    /// Our pending or attached outbound connection to the same peer loses
    /// only when the peer's device id is greater than ours.
    async fn inbound_wins(&self, peer: &DeviceInfo, host: IpAddr) -> bool {
        let peer_wins = peer.device_id.as_str() > self.inner.local.device_id.as_str();

        {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(outbound) = in_flight.get(&(host, Direction::Outbound)) {
                if !peer_wins {
                    return false;
                }
                info!(
                    "Simultaneous connection with {}: cancelling attempt {}",
                    peer.device_name, outbound.id
                );
                outbound.cancel.cancel();
                in_flight.remove(&(host, Direction::Outbound));
            }
        }

        if peer_wins {
            return true;
        }

        match self.inner.registry.get(&peer.device_id).await {
            Some(device) => device.channel_direction().await != Some(Direction::Outbound),
            None => true,
        }
    }

    async fn attach(&self, channel: Channel, device: &Arc<Device>) -> Result<()> {
        let channel_id = channel.id();
        let direction = channel.direction();
        channel.attach(device, Arc::clone(&self.inner.router)).await?;

        self.emit(ServiceEvent::ChannelAttached {
            device_id: device.id().to_string(),
            channel_id,
            direction,
        });
        Ok(())
    }

    /// Register an outbound attempt unless the host already has one
    fn begin_outbound(&self, host: IpAddr) -> Option<(u64, CancellationToken)> {
        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.contains_key(&(host, Direction::Outbound))
            || in_flight.contains_key(&(host, Direction::Inbound))
        {
            return None;
        }

        let id = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        in_flight.insert(
            (host, Direction::Outbound),
            Attempt {
                id,
                cancel: cancel.clone(),
            },
        );
        Some((id, cancel))
    }

    /// Register an inbound attempt, cancelling the previous one from the host
    fn begin_inbound(&self, host: IpAddr) -> (u64, CancellationToken) {
        let id = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();

        let previous = lock(&self.inner.in_flight).insert(
            (host, Direction::Inbound),
            Attempt {
                id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(
                "Newer connection from {}: cancelling attempt {}",
                host, previous.id
            );
            previous.cancel.cancel();
        }
        (id, cancel)
    }

    fn is_attempting(&self, host: IpAddr) -> bool {
        let in_flight = lock(&self.inner.in_flight);
        in_flight.contains_key(&(host, Direction::Outbound))
            || in_flight.contains_key(&(host, Direction::Inbound))
    }

    /// Remove an attempt unless a newer one took its slot
    fn end_attempt(&self, host: IpAddr, direction: Direction, id: u64) {
        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.get(&(host, direction)).map(|a| a.id) == Some(id) {
            in_flight.remove(&(host, direction));
        }
    }

    fn report(&self, error: &ProtocolError, host: IpAddr) {
        if let Some(event) = ServiceEvent::from_error(error) {
            self.emit(event);
            return;
        }
        match error {
            ProtocolError::Cancelled(_) | ProtocolError::DeviceNotAllowed(_) => {
                debug!("Connection attempt with {} ended: {}", host, error)
            }
            _ => warn!("Connection attempt with {} failed: {}", host, error),
        }
    }

    async fn run_udp_listener(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.cancelled() => None,
                received = self.inner.udp.recv_from(&mut buf) => Some(received),
            };
            let Some(received) = received else { break };

            let (len, source) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    continue;
                }
            };

            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Ignoring datagram from {}: {}", source, e);
                    continue;
                }
            };

            if let Err(e) = self.on_identity(packet, source).await {
                debug!("Identity from {} not acted on: {}", source, e);
            }
        }

        debug!("UDP listener stopped");
    }

    async fn run_tcp_listener(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };
            let Some(accepted) = accepted else { break };

            match accepted {
                Ok((tcp, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.on_incoming_connection(tcp, addr).await {
                            service.report(&e, addr.ip());
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }

        debug!("TCP listener stopped");
    }

    async fn run_broadcaster(self, period: Duration) {
        let mut ticker = interval(period);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.broadcast(None).await {
                warn!("Failed to broadcast identity: {}", e);
            }
            for target in &self.inner.config.broadcast_to {
                if let Err(e) = self.broadcast(Some(*target)).await {
                    warn!("Failed to send identity to {}: {}", target, e);
                }
            }
            self.reconnect().await;
        }

        debug!("Broadcaster stopped");
    }
}
