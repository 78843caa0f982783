//! End-to-end tests over loopback UDP, TCP and TLS
//!
//! Every node binds 127.0.0.1 on ephemeral ports with the periodic
//! broadcaster disabled; announcements are sent directly to the other node.

use async_trait::async_trait;
use lanlink_protocol::capability::builtin_manifest;
use lanlink_protocol::trust::fingerprint;
use lanlink_protocol::{
    Channel, Device, DeviceInfo, DeviceRegistry, DeviceType, DiscoveryService, Packet,
    PacketRouter, PluginRegistry, ProtocolError, Result, ServiceConfig, ServiceEvent, TlsContext,
    TrustStore,
};
use serde_json::json;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct ChannelRouter(mpsc::UnboundedSender<(String, Packet)>);

#[async_trait]
impl PacketRouter for ChannelRouter {
    async fn route(&self, device_id: &str, packet: Packet) -> Result<()> {
        let _ = self.0.send((device_id.to_string(), packet));
        Ok(())
    }
}

struct Node {
    _dir: TempDir,
    service: DiscoveryService,
    packets: mpsc::UnboundedReceiver<(String, Packet)>,
}

impl Node {
    fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(LOCALHOST, self.service.udp_port())
    }

    fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(LOCALHOST, self.service.tcp_port())
    }

    async fn device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.service.registry().get(device_id).await
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        match self.device(device_id).await {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }

    async fn next_packet(&mut self) -> (String, Packet) {
        timeout(Duration::from_secs(10), self.packets.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("router closed")
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn plugins(names: &[&str]) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for name in names {
        registry.register(builtin_manifest(name).unwrap()).unwrap();
    }
    registry
}

async fn node(device_id: &str, discoverable: bool, plugins: PluginRegistry) -> Node {
    init_logging();
    let dir = TempDir::new().unwrap();
    let trust = Arc::new(TrustStore::open(dir.path().join("certs"), device_id).unwrap());
    let tls = Arc::new(TlsContext::new(Arc::clone(&trust)).unwrap());
    let registry = Arc::new(DeviceRegistry::new(Arc::new(plugins), trust));
    let (tx, packets) = mpsc::unbounded_channel();

    let config = ServiceConfig {
        bind_address: LOCALHOST,
        udp_port: 0,
        tcp_port: 0,
        broadcast_address: SocketAddr::new(LOCALHOST, 9),
        transfer_ports: 0..=0,
        dial_ports: 1..=u16::MAX,
        broadcast_interval: Duration::ZERO,
        discoverable,
        ..ServiceConfig::default()
    };
    let local = DeviceInfo::with_id(device_id, device_id.to_uppercase(), DeviceType::Desktop, 0);

    let service = DiscoveryService::bind(config, local, registry, tls, Arc::new(ChannelRouter(tx)))
        .await
        .unwrap();
    service.start().await.unwrap();

    Node {
        _dir: dir,
        service,
        packets,
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

async fn connect_pair(x: &Node, y: &Node) {
    x.service.broadcast(Some(y.udp_addr())).await.unwrap();
    wait_for("x1 connected on y", || y.is_connected("x1")).await;
    wait_for("y1 connected on x", || x.is_connected("y1")).await;
}

#[test]
fn test_packet_round_trip() {
    let packets = vec![
        Packet::new("kdeconnect.ping", json!({})),
        Packet::new("kdeconnect.ping", json!({ "message": "hello\nworld" })),
        Packet::new("kdeconnect.battery", json!({ "currentCharge": 42, "isCharging": true })),
        Packet::new("kdeconnect.share.request", json!({ "filename": "a.txt" }))
            .with_payload(1024, json!({ "port": 1739 }).as_object().unwrap().clone()),
    ];

    for packet in packets {
        let line = packet.serialize().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(Packet::parse(&line).unwrap(), packet);
    }
}

#[tokio::test]
async fn test_identity_without_device_id_is_rejected() {
    let y = node("y1", true, PluginRegistry::with_builtins()).await;

    // Over TCP: the socket is closed, nothing is registered
    let mut tcp = TcpStream::connect(y.tcp_addr()).await.unwrap();
    let nameless = Packet::new(
        "kdeconnect.identity",
        json!({ "deviceName": "Nameless", "tcpPort": 1716, "protocolVersion": 7 }),
    );
    tcp.write_all(&nameless.to_bytes().unwrap()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), tcp.read(&mut buf)).await.unwrap();
    assert_eq!(read.unwrap_or(0), 0);

    // Over UDP: ignored
    let udp = tokio::net::UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    udp.send_to(&nameless.to_bytes().unwrap(), y.udp_addr()).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(y.service.registry().is_empty().await);
    assert_eq!(y.service.pending_connections(), 0);
}

#[tokio::test]
async fn test_own_broadcast_loopback_is_ignored() {
    let x = node("x1", true, PluginRegistry::with_builtins()).await;

    x.service.broadcast(Some(x.udp_addr())).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert!(x.service.registry().is_empty().await);
    assert_eq!(x.service.pending_connections(), 0);
}

#[tokio::test]
async fn test_discoverable_peer_connects_on_broadcast() {
    let mut x = node("x1", true, PluginRegistry::with_builtins()).await;
    let y = node("y1", true, PluginRegistry::with_builtins()).await;
    let mut y_events = y.service.subscribe();

    connect_pair(&x, &y).await;

    let y_view = y.device("x1").await.unwrap();
    let x_view = x.device("y1").await.unwrap();
    assert_eq!(y_view.name().await, "X1");
    assert_eq!(x_view.info().await.tcp_host, Some(LOCALHOST));

    let enabled = y_view.action_states().await.enabled();
    assert!(!enabled.is_empty());
    assert_eq!(enabled, x_view.action_states().await.enabled());

    let (mut discovered, mut attached) = (false, false);
    while !(discovered && attached) {
        let event = timeout(Duration::from_secs(5), y_events.recv())
            .await
            .unwrap()
            .unwrap();
        discovered |= event.is_device_discovered();
        attached |= event.is_channel_attached();
    }

    // Packets flow over the attached channel
    y.service
        .send_packet("x1", Packet::new("kdeconnect.ping", json!({ "message": "hi" })))
        .await
        .unwrap();
    let (from, packet) = x.next_packet().await;
    assert_eq!(from, "y1");
    assert_eq!(packet.packet_type, "kdeconnect.ping");
    assert_eq!(packet.get_body_field::<String>("message").as_deref(), Some("hi"));
}

/// Log sink shared between a test and its subscriber
#[derive(Clone, Default)]
struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_non_discoverable_peer_ignores_broadcast() {
    // Current-thread runtime: spawned service tasks log through this subscriber
    let logs = CapturedLogs::default();
    let subscriber = {
        let logs = logs.clone();
        tracing_subscriber::fmt()
            .with_writer(move || logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish()
    };
    let _guard = tracing::subscriber::set_default(subscriber);

    let x = node("x1", true, PluginRegistry::with_builtins()).await;
    let y = node("y1", false, PluginRegistry::with_builtins()).await;

    x.service.broadcast(Some(y.udp_addr())).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert!(y.service.registry().is_empty().await);
    assert_eq!(y.service.pending_connections(), 0);
    assert!(x.service.registry().is_empty().await);

    let logs = logs.contents();
    assert!(logs.contains("Ignoring unsolicited device 'X1'"), "{}", logs);
    assert!(logs.contains("not discoverable"), "{}", logs);
}

#[tokio::test]
async fn test_simultaneous_dial_leaves_one_channel() {
    let mut x = node("x1", true, PluginRegistry::with_builtins()).await;
    let mut y = node("y1", true, PluginRegistry::with_builtins()).await;

    let (a, b) = tokio::join!(
        x.service.broadcast(Some(y.udp_addr())),
        y.service.broadcast(Some(x.udp_addr())),
    );
    a.unwrap();
    b.unwrap();

    wait_for("x1 connected on y", || y.is_connected("x1")).await;
    wait_for("y1 connected on x", || x.is_connected("y1")).await;
    wait_for("no pending attempts", || async {
        x.service.pending_connections() == 0 && y.service.pending_connections() == 0
    })
    .await;

    // Settled: still connected over one and the same connection
    sleep(Duration::from_millis(300)).await;
    assert!(x.is_connected("y1").await);
    assert!(y.is_connected("x1").await);
    assert_eq!(x.service.registry().len().await, 1);
    assert_eq!(y.service.registry().len().await, 1);

    let x_dir = x.device("y1").await.unwrap().channel_direction().await.unwrap();
    let y_dir = y.device("x1").await.unwrap().channel_direction().await.unwrap();
    assert_ne!(x_dir, y_dir);

    x.service
        .send_packet("y1", Packet::new("kdeconnect.ping", json!({})))
        .await
        .unwrap();
    assert_eq!(y.next_packet().await.0, "x1");
    y.service
        .send_packet("x1", Packet::new("kdeconnect.ping", json!({})))
        .await
        .unwrap();
    assert_eq!(x.next_packet().await.0, "y1");
}

#[tokio::test]
async fn test_newer_inbound_from_same_host_wins() {
    let y = node("y1", true, PluginRegistry::with_builtins()).await;

    // A bare peer dialing twice from the same host
    let dir = TempDir::new().unwrap();
    let trust = Arc::new(TrustStore::open(dir.path(), "p1").unwrap());
    let tls = TlsContext::new(Arc::clone(&trust)).unwrap();
    let peer_identity = DeviceInfo::with_id("p1", "Peer", DeviceType::Phone, 0).to_identity_packet();
    let y_info = DeviceInfo::with_id("y1", "Y1", DeviceType::Desktop, y.service.tcp_port());

    let (first, second) = tokio::join!(
        Channel::open(y.tcp_addr(), y_info.clone(), &peer_identity, &tls, CancellationToken::new()),
        Channel::open(y.tcp_addr(), y_info.clone(), &peer_identity, &tls, CancellationToken::new()),
    );

    // Attach whatever the peer got to separate peer-side devices
    let (tx, _rx) = mpsc::unbounded_channel();
    let router: Arc<dyn PacketRouter> = Arc::new(ChannelRouter(tx));
    let mut peer_side = Vec::new();
    for channel in [first, second].into_iter().flatten() {
        let device = Device::new(y_info.clone(), Arc::new(PluginRegistry::new()), Arc::clone(&trust));
        channel.attach(&device, Arc::clone(&router)).await.unwrap();
        peer_side.push(device);
    }
    assert!(!peer_side.is_empty());

    wait_for("p1 connected on y", || y.is_connected("p1")).await;
    sleep(Duration::from_millis(300)).await;

    assert!(y.is_connected("p1").await);
    assert_eq!(y.service.pending_connections(), 0);

    let mut live = 0;
    for device in &peer_side {
        if device.is_connected().await {
            live += 1;
        }
    }
    assert_eq!(live, 1);
}

#[tokio::test]
async fn test_capability_refresh_enables_action_without_reconnect() {
    let x = node("x1", true, plugins(&["ping", "battery"])).await;
    let y = node("y1", true, plugins(&["ping"])).await;

    connect_pair(&x, &y).await;

    let y_view = x.device("y1").await.unwrap();
    let channel = y_view.channel_id().await;
    assert!(y_view.is_action_enabled("ping", "ping").await);
    assert!(!y_view.is_action_enabled("battery", "requestBattery").await);

    // y re-announces with battery support
    let refreshed = DeviceInfo::with_id("y1", "Y1", DeviceType::Desktop, y.service.tcp_port())
        .with_capabilities_from(&plugins(&["ping", "battery"]));
    x.service
        .on_identity(refreshed.to_identity_packet(), y.udp_addr())
        .await
        .unwrap();

    assert!(y_view.is_action_enabled("battery", "requestBattery").await);
    assert!(y_view.is_action_enabled("ping", "ping").await);
    assert!(y_view.is_connected().await);
    assert_eq!(y_view.channel_id().await, channel);
}

#[tokio::test]
async fn test_pinned_device_with_new_certificate_is_refused() {
    let x = node("x1", true, PluginRegistry::with_builtins()).await;
    let y = node("y1", true, PluginRegistry::with_builtins()).await;

    // First contact is trusted on first use
    connect_pair(&x, &y).await;
    let y_view = x.device("y1").await.unwrap();
    y_view.set_paired(true).await.unwrap();
    assert!(y_view.is_paired().await);

    y.service.stop();
    wait_for("y1 disconnected on x", || async { !x.is_connected("y1").await }).await;

    // Same device id, fresh certificate
    let impostor = node("y1", true, PluginRegistry::with_builtins()).await;
    let impostor_fp = fingerprint(&impostor.service.tls().trust().self_certificate().certificate);
    let mut events = x.service.subscribe();

    impostor.service.broadcast(Some(x.udp_addr())).await.unwrap();

    let event = timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if event.is_authentication_failure() => break event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap();

    match event {
        ServiceEvent::AuthenticationFailed {
            device_id,
            remote_fingerprint,
            local_fingerprint,
            ..
        } => {
            assert_eq!(device_id, "y1");
            assert_eq!(remote_fingerprint, impostor_fp);
            assert_eq!(
                local_fingerprint,
                x.service.tls().trust().self_certificate().fingerprint
            );
        }
        other => panic!("unexpected event {:?}", other),
    }

    sleep(Duration::from_millis(200)).await;
    assert!(!x.is_connected("y1").await);
    assert!(!impostor.is_connected("x1").await);
}

#[tokio::test]
async fn test_transfer_size_integrity() {
    let x = node("x1", true, PluginRegistry::with_builtins()).await;
    let mut y = node("y1", true, PluginRegistry::with_builtins()).await;
    connect_pair(&x, &y).await;

    let y_view = x.device("y1").await.unwrap();
    let x_view = y.device("x1").await.unwrap();

    for (payload, declared) in [(vec![3u8; 70_000], 70_000u64), (vec![3u8; 500], 2_000u64)] {
        let upload = x
            .service
            .create_transfer(&y_view, declared, Some("deadbeef".to_string()));
        let request = Packet::new("kdeconnect.share.request", json!({ "filename": "f.bin" }));
        let uploading = tokio::spawn(async move { upload.upload(request, &payload[..]).await });

        let (_, packet) = y.next_packet().await;
        assert_eq!(packet.payload_size, Some(declared as i64));
        assert_eq!(
            packet.get_body_field::<String>("payloadHash").as_deref(),
            Some("deadbeef")
        );

        let mut sink = Vec::new();
        let download = y.service.create_transfer(&x_view, declared, None);
        assert_eq!(x_view.transfer_ids().len(), 1);
        let downloaded = download.download(&packet, &mut sink).await;
        let uploaded = uploading.await.unwrap();

        if declared == 70_000 {
            assert_eq!(uploaded.unwrap(), declared);
            assert_eq!(downloaded.unwrap(), declared);
            assert_eq!(sink.len(), 70_000);
        } else {
            assert!(matches!(uploaded, Err(ProtocolError::IncompleteTransfer { .. })));
            assert!(matches!(
                downloaded,
                Err(ProtocolError::IncompleteTransfer { expected: 2_000, received: 500 })
            ));
        }

        assert!(y_view.transfer_ids().is_empty());
        assert!(x_view.transfer_ids().is_empty());
    }

    // Control channel unaffected
    assert!(x.is_connected("y1").await);
    x.service
        .send_packet("y1", Packet::new("kdeconnect.ping", json!({})))
        .await
        .unwrap();
    assert_eq!(y.next_packet().await.1.packet_type, "kdeconnect.ping");
}
