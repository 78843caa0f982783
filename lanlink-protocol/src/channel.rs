//! Control Channel
//!
//! A channel is one TCP connection that carried an identity exchange and a
//! TLS handshake. Once attached to a [`Device`] it carries the newline
//! delimited packet stream in both directions.
//!
//! ## Handshake
//!
//! ```text
//! outbound (dialer)                       inbound (acceptor)
//! ------------------                      ------------------
//! connect, keepalive                      accept, keepalive
//! send identity line   ---- plaintext --> read identity line, reject if no deviceId
//! TLS client           <----- TLS ------> TLS server (any client cert)
//! trust check                             trust check
//! ```
//!
//! ## States
//!
//! `Unconnected → SocketEstablished → IdentityExchanged → TlsNegotiating →
//! Authenticated → Attached → Closed`; `Closed` is reachable from every state.
//!
//! ## Cancellation
//!
//! Every channel carries a [`CancellationToken`]. Cancelling it aborts the
//! handshake, the read loop and pending writes. Cancelling twice is a no-op.

use crate::device::{ChannelHandle, Device, PacketRouter};
use crate::identity::{self, DeviceInfo};
use crate::tls::{TlsContext, HANDSHAKE_TIMEOUT};
use crate::{Packet, ProtocolError, Result};
use futures::StreamExt;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum packet size (10MB - supports file transfer metadata)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Idle time before the first keepalive packet
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);

/// Interval between keepalive packets
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Unanswered keepalives before the connection is considered dead
pub const KEEPALIVE_RETRIES: u32 = 3;

/// Upper bound on a graceful TLS shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    SocketEstablished,
    IdentityExchanged,
    TlsNegotiating,
    Authenticated,
    Attached,
    Closed,
}

/// Which side dialed the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Configure TCP keepalive probing on a socket
///
/// Liveness of idle channels is left entirely to the kernel.
pub fn configure_keepalive(stream: &TcpStream) -> Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "windows"
    ))]
    let keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd"
    ))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);

    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

fn transition(id: u64, state: &mut ChannelState, next: ChannelState) {
    debug!("Channel {}: {:?} -> {:?}", id, state, next);
    *state = next;
}

/// Read one `\n` terminated line without buffering past it
///
/// The bytes after the identity line belong to the TLS handshake, so a
/// buffered reader must not be used here.
async fn read_identity_line(stream: &mut TcpStream) -> Result<Packet> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::NetworkError(
                "connection closed before identity".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), MAX_PACKET_SIZE));
        }
    }

    Packet::from_bytes(&line)
}

/// Await `fut` unless `cancel` fires first
async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

/// An authenticated channel that is not yet attached to a device
pub struct Channel {
    id: u64,
    direction: Direction,
    state: ChannelState,
    host: IpAddr,
    peer: DeviceInfo,
    certificate: Vec<u8>,
    stream: Option<TlsStream<TcpStream>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("host", &self.host)
            .field("device_id", &self.peer.device_id)
            .finish()
    }
}

impl Channel {
    /// Actively open a channel to a peer that announced itself
    ///
    /// `peer` is the identity received over UDP; `local_identity` is sent as
    /// the first plaintext line.
    pub async fn open(
        addr: SocketAddr,
        peer: DeviceInfo,
        local_identity: &Packet,
        tls: &TlsContext,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let mut state = ChannelState::Unconnected;

        let result = cancellable(
            &cancel,
            "outbound handshake",
            Self::handshake_outbound(id, &mut state, addr, &peer, local_identity, tls),
        )
        .await;

        match result {
            Ok((stream, certificate)) => {
                info!(
                    "Channel {} to {} ({}) authenticated",
                    id, peer.device_name, addr
                );
                Ok(Self {
                    id,
                    direction: Direction::Outbound,
                    state,
                    host: addr.ip(),
                    peer,
                    certificate,
                    stream: Some(stream),
                    cancel,
                })
            }
            Err(e) => {
                transition(id, &mut state, ChannelState::Closed);
                cancel.cancel();
                Err(e)
            }
        }
    }

    async fn handshake_outbound(
        id: u64,
        state: &mut ChannelState,
        addr: SocketAddr,
        peer: &DeviceInfo,
        local_identity: &Packet,
        tls: &TlsContext,
    ) -> Result<(TlsStream<TcpStream>, Vec<u8>)> {
        let mut tcp = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting to device"))?;
        configure_keepalive(&tcp)?;
        transition(id, state, ChannelState::SocketEstablished);

        tcp.write_all(&local_identity.to_bytes()?).await?;
        tcp.flush().await?;
        transition(id, state, ChannelState::IdentityExchanged);

        transition(id, state, ChannelState::TlsNegotiating);
        let (stream, certificate) = tls.connect(tcp, addr.ip()).await?;

        tls.trust().authenticate(
            &peer.device_id,
            &peer.device_name,
            &addr.ip().to_string(),
            &certificate,
        )?;
        transition(id, state, ChannelState::Authenticated);

        Ok((stream, certificate))
    }

    /// Passively accept a channel: identity first, then TLS
    pub async fn accept(tcp: TcpStream, tls: &TlsContext, cancel: CancellationToken) -> Result<Self> {
        IncomingChannel::receive_identity(tcp, cancel)
            .await?
            .secure(tls)
            .await
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Identity the peer presented during the handshake
    pub fn peer(&self) -> &DeviceInfo {
        &self.peer
    }

    /// DER certificate the peer presented during the handshake
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close a channel that was never attached
    ///
    /// Never fails; shutdown errors are discarded.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.state = ChannelState::Closed;
        if let Some(mut stream) = self.stream.take() {
            let _ = timeout(CLOSE_TIMEOUT, stream.shutdown()).await;
        }
        debug!("Channel {} closed before attach", self.id);
    }

    /// Attach to a device and start the packet loop
    ///
    /// Any other channel the device holds is closed first. Inbound packets are
    /// delivered to `router` in wire order. Fails with `Cancelled` if this
    /// channel was superseded while its handshake was running.
    pub async fn attach(mut self, device: &Arc<Device>, router: Arc<dyn PacketRouter>) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.close().await;
            return Err(ProtocolError::Cancelled(
                "channel superseded before attach".to_string(),
            ));
        }

        let Some(stream) = self.stream.take() else {
            return Err(ProtocolError::InvalidState(format!(
                "channel {} has no stream",
                self.id
            )));
        };

        transition(self.id, &mut self.state, ChannelState::Attached);

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(
            self.id,
            self.direction,
            self.host,
            self.certificate.clone(),
            self.cancel.clone(),
            sender,
        );

        // The stream is dropped (closed) if the handle was cancelled meanwhile
        device.attach_channel(handle).await?;
        device.handle_identity(self.peer.clone()).await;

        tokio::spawn(run_packet_loop(
            self.id,
            stream,
            receiver,
            self.cancel.clone(),
            device.id().to_string(),
            router,
        ));

        device.set_connected(self.id).await;

        info!(
            "Channel {} attached to {} ({})",
            self.id,
            device.name().await,
            self.host
        );
        Ok(())
    }
}

/// Inbound channel whose identity line has been read but not yet secured
///
/// Lets the caller inspect the peer identity (for connection races) before
/// the TLS handshake starts.
pub struct IncomingChannel {
    id: u64,
    state: ChannelState,
    tcp: TcpStream,
    host: IpAddr,
    peer: DeviceInfo,
    cancel: CancellationToken,
}

impl IncomingChannel {
    /// Configure the socket and read the peer's identity line
    ///
    /// Rejects with `MissingDeviceId` when the identity has no device id; the
    /// socket is dropped (closed) on every error.
    pub async fn receive_identity(tcp: TcpStream, cancel: CancellationToken) -> Result<Self> {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let mut state = ChannelState::Unconnected;

        let result = cancellable(&cancel, "inbound identity", async {
            let mut tcp = tcp;
            let host = tcp.peer_addr()?.ip();
            configure_keepalive(&tcp)?;
            transition(id, &mut state, ChannelState::SocketEstablished);

            let mut packet = timeout(HANDSHAKE_TIMEOUT, read_identity_line(&mut tcp))
                .await
                .map_err(|_| ProtocolError::Timeout(format!("identity from {}", host)))??;
            identity::stamp_host(&mut packet, host);

            let peer = match identity::validate(&packet) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(
                        "Rejecting connection from {} ({}): {}",
                        host,
                        identity::display_name(&packet),
                        e
                    );
                    return Err(e);
                }
            };
            transition(id, &mut state, ChannelState::IdentityExchanged);

            Ok((tcp, host, peer))
        })
        .await;

        match result {
            Ok((tcp, host, peer)) => Ok(Self {
                id,
                state,
                tcp,
                host,
                peer,
                cancel,
            }),
            Err(e) => {
                transition(id, &mut state, ChannelState::Closed);
                Err(e)
            }
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn peer(&self) -> &DeviceInfo {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Run the TLS server handshake and the trust check
    pub async fn secure(self, tls: &TlsContext) -> Result<Channel> {
        let IncomingChannel {
            id,
            mut state,
            tcp,
            host,
            peer,
            cancel,
        } = self;

        let result = cancellable(&cancel, "inbound handshake", async {
            transition(id, &mut state, ChannelState::TlsNegotiating);
            let (stream, certificate) = tls.accept(tcp).await?;

            tls.trust().authenticate(
                &peer.device_id,
                &peer.device_name,
                &host.to_string(),
                &certificate,
            )?;
            transition(id, &mut state, ChannelState::Authenticated);
            Ok((stream, certificate))
        })
        .await;

        match result {
            Ok((stream, certificate)) => {
                info!(
                    "Channel {} from {} ({}) authenticated",
                    id, peer.device_name, host
                );
                Ok(Channel {
                    id,
                    direction: Direction::Inbound,
                    state,
                    host,
                    peer,
                    certificate,
                    stream: Some(stream),
                    cancel,
                })
            }
            Err(e) => {
                transition(id, &mut state, ChannelState::Closed);
                cancel.cancel();
                Err(e)
            }
        }
    }

    /// Drop the connection without a handshake
    pub fn close(self) {
        self.cancel.cancel();
        debug!("Channel {} from {} closed before TLS", self.id, self.host);
    }
}

async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketSizeExceeded(bytes.len(), MAX_PACKET_SIZE));
    }

    // One complete line per write
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and write loop of an attached channel
///
/// Ends on EOF, a read error, an unparsable line, a write error or
/// cancellation. Always leaves the token cancelled.
async fn run_packet_loop<S>(
    id: u64,
    stream: S,
    mut outgoing: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
    device_id: String,
    router: Arc<dyn PacketRouter>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_PACKET_SIZE));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Channel {} cancelled", id);
                break;
            }

            packet = outgoing.recv() => {
                let Some(packet) = packet else { break };
                debug!("Channel {} sending '{}'", id, packet.packet_type);
                // A peer that stops reading must not outlive cancellation
                let written = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Channel {} cancelled during write", id);
                        break;
                    }
                    written = write_packet(&mut writer, &packet) => written,
                };
                if let Err(e) = written {
                    warn!("Channel {}: write failed: {}", id, e);
                    break;
                }
            }

            line = lines.next() => {
                match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Packet::parse(&line) {
                            Ok(packet) => {
                                debug!("Channel {} received '{}'", id, packet.packet_type);
                                if let Err(e) = router.route(&device_id, packet).await {
                                    warn!("Channel {}: packet handler failed: {}", id, e);
                                }
                            }
                            Err(e) => {
                                warn!("Channel {}: {}", id, e);
                                break;
                            }
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(
                            "Channel {}: {}",
                            id,
                            ProtocolError::PacketSizeExceeded(MAX_PACKET_SIZE + 1, MAX_PACKET_SIZE)
                        );
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        debug!("Channel {}: read failed: {}", id, e);
                        break;
                    }
                    None => {
                        debug!("Channel {}: peer closed the connection", id);
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = timeout(CLOSE_TIMEOUT, writer.shutdown()).await;
    info!("Channel {} to device {} closed", id, device_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct NullRouter;

    #[async_trait]
    impl PacketRouter for NullRouter {
        async fn route(&self, _device_id: &str, _packet: Packet) -> Result<()> {
            Ok(())
        }
    }

    fn context(dir: &TempDir, device_id: &str) -> TlsContext {
        let trust = TrustStore::open(dir.path().join(device_id), device_id).unwrap();
        TlsContext::new(Arc::new(trust)).unwrap()
    }

    #[tokio::test]
    async fn test_open_and_accept_exchange_identities() {
        let dir = TempDir::new().unwrap();
        let accept_ctx = Arc::new(context(&dir, "acceptor"));
        let open_ctx = context(&dir, "dialer");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = {
            let accept_ctx = Arc::clone(&accept_ctx);
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                Channel::accept(tcp, &accept_ctx, CancellationToken::new()).await
            })
        };

        let local = DeviceInfo::with_id("dialer", "Dialer", identity::DeviceType::Laptop, 1716);
        let remote = DeviceInfo::with_id("acceptor", "Acceptor", identity::DeviceType::Desktop, addr.port());

        let outbound = Channel::open(
            addr,
            remote,
            &local.to_identity_packet(),
            &open_ctx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let inbound = acceptor.await.unwrap().unwrap();

        assert_eq!(outbound.state(), ChannelState::Authenticated);
        assert_eq!(outbound.direction(), Direction::Outbound);
        assert_eq!(inbound.state(), ChannelState::Authenticated);
        assert_eq!(inbound.direction(), Direction::Inbound);

        assert_eq!(inbound.peer().device_id, "dialer");
        assert_eq!(inbound.peer().tcp_host, Some(addr.ip()));
        assert_eq!(
            inbound.certificate(),
            open_ctx.trust().self_certificate().certificate.as_slice()
        );
        assert_eq!(
            outbound.certificate(),
            accept_ctx.trust().self_certificate().certificate.as_slice()
        );

        outbound.close().await;
        inbound.close().await;
    }

    #[tokio::test]
    async fn test_accept_rejects_identity_without_device_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            IncomingChannel::receive_identity(tcp, CancellationToken::new()).await
        });

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        let packet = Packet::new("kdeconnect.identity", json!({ "deviceName": "Nameless" }));
        tcp.write_all(&packet.to_bytes().unwrap()).await.unwrap();

        let result = acceptor.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::MissingDeviceId)));

        // The acceptor dropped the socket
        let mut buf = [0u8; 1];
        assert_eq!(tcp.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let acceptor = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                IncomingChannel::receive_identity(tcp, cancel).await
            })
        };

        // Connect but never send an identity
        let _tcp = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        cancel.cancel();

        let result = acceptor.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_keepalive_configuration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        configure_keepalive(&tcp).unwrap();
        assert!(socket2::SockRef::from(&tcp).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_cancel_ends_write_to_stalled_peer() {
        // The peer end is held open but never read
        let (local, _peer) = tokio::io::duplex(64);
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let packet_loop = tokio::spawn(run_packet_loop(
            1,
            local,
            receiver,
            cancel.clone(),
            "stalled".to_string(),
            Arc::new(NullRouter),
        ));

        let body = json!({ "message": "x".repeat(64 * 1024) });
        sender.send(Packet::new("kdeconnect.ping", body)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!packet_loop.is_finished());

        cancel.cancel();
        timeout(Duration::from_secs(2), packet_loop)
            .await
            .expect("packet loop outlived cancellation")
            .unwrap();
    }
}
