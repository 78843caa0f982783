//! Payload Transfer Channel
//!
//! Moves one payload's raw bytes over a dedicated TLS connection, separate
//! from the control channel.
//!
//! ## Protocol
//!
//! 1. Uploader binds the first free port in the transfer range (1739+)
//! 2. Uploader sends the packet with `payloadSize` and
//!    `payloadTransferInfo = {port}` over the control channel
//! 3. Downloader connects to the uploader's address on that port
//! 4. TLS handshake: the uploader is the server, the downloader the client;
//!    the peer certificate is checked against the trust store
//! 5. Exactly `payloadSize` raw bytes are streamed, then the socket closes
//!
//! A transfer is registered in its device's transfer map from creation until
//! it is dropped, whichever way it ends.

use crate::device::{Device, TransferEntry};
use crate::tls::TlsContext;
use crate::{Packet, ProtocolError, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timeout for the peer to connect / for our connect to complete
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single read or write
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer size for payload streaming (64KB)
const BUFFER_SIZE: usize = 65536;

/// Progress callback for transfers
///
/// Receives `(bytes_transferred, total_bytes)`. Return `false` to cancel.
pub type ProgressCallback = Box<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// One payload transfer
pub struct Transfer {
    uuid: Uuid,
    device: Arc<Device>,
    tls: Arc<TlsContext>,
    size: u64,
    checksum: Option<String>,
    port_range: RangeInclusive<u16>,
    bind_address: IpAddr,
    port: Option<u16>,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("uuid", &self.uuid)
            .field("device_id", &self.device.id())
            .field("size", &self.size)
            .field("port", &self.port)
            .finish()
    }
}

impl Transfer {
    /// Create a transfer of `size` bytes and register it with `device`
    pub fn new(device: Arc<Device>, tls: Arc<TlsContext>, size: u64) -> Self {
        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();
        device.register_transfer(
            uuid,
            TransferEntry {
                size,
                cancel: cancel.clone(),
            },
        );
        debug!("Transfer {} of {} bytes for {}", uuid, size, device.id());

        Self {
            uuid,
            device,
            tls,
            size,
            checksum: None,
            port_range: crate::TRANSFER_PORT_START..=crate::TRANSFER_PORT_END,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            cancel,
            progress: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Ports scanned by [`upload`](Self::upload)
    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Set a progress callback
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Port bound by an upload, once bound
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Cancelling aborts the transfer at its next await point
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn bind(&self) -> Result<TcpListener> {
        for port in self.port_range.clone() {
            match TcpListener::bind(SocketAddr::new(self.bind_address, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("Transfer port {} unavailable: {}", port, e),
            }
        }

        Err(ProtocolError::PortRangeExhausted {
            start: *self.port_range.start(),
            end: *self.port_range.end(),
        })
    }

    /// Serve the payload from `source`
    ///
    /// Announces the bound port inside `packet`, sends it on the device's
    /// control channel and streams exactly `size` bytes to the one peer that
    /// connects. Returns the number of bytes sent.
    pub async fn upload<R>(mut self, packet: Packet, mut source: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let listener = self.bind().await?;
        let port = listener.local_addr()?.port();
        self.port = Some(port);
        info!("Transfer {} listening on port {}", self.uuid, port);

        let mut transfer_info = Map::new();
        transfer_info.insert("port".to_string(), Value::from(port));
        let mut packet = packet.with_payload(self.size as i64, transfer_info);
        if let Some(checksum) = &self.checksum {
            packet.set_body_field("payloadHash", checksum.clone());
        }
        self.device.send_packet(packet).await?;

        let (tcp, remote) = self
            .guard("waiting for transfer connection", async {
                timeout(CONNECTION_TIMEOUT, listener.accept())
                    .await
                    .map_err(|_| ProtocolError::Timeout("transfer connection".to_string()))?
                    .map_err(ProtocolError::from)
            })
            .await?;
        drop(listener);
        debug!("Transfer {} accepted connection from {}", self.uuid, remote);

        let (mut stream, certificate) = self.guard("transfer handshake", self.tls.accept(tcp)).await?;
        self.authenticate(remote.ip(), &certificate).await?;

        let result = self.copy(&mut source, &mut stream).await;
        let _ = stream.shutdown().await;
        self.finish(result)
    }

    /// Receive the payload announced by `packet` into `sink`
    ///
    /// Connects to the device's address on the advertised port. Returns the
    /// number of bytes received.
    pub async fn download<W>(self, packet: &Packet, mut sink: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let port = packet.transfer_port().ok_or_else(|| {
            ProtocolError::MalformedPacket("missing payloadTransferInfo.port".to_string())
        })?;
        let host = self
            .device
            .host()
            .await
            .ok_or_else(|| ProtocolError::NotConnected(self.device.id().to_string()))?;
        let addr = SocketAddr::new(host, port);
        info!("Transfer {} connecting to {}", self.uuid, addr);

        let tcp = self
            .guard("connecting for transfer", async {
                timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
                    .map_err(|e| ProtocolError::from_io_error(e, "transfer connect"))
            })
            .await?;

        let (mut stream, certificate) = self.guard("transfer handshake", self.tls.connect(tcp, host)).await?;
        self.authenticate(host, &certificate).await?;

        let result = self.copy(&mut stream, &mut sink).await;
        let _ = stream.shutdown().await;
        self.finish(result)
    }

    async fn authenticate(&self, host: IpAddr, certificate: &[u8]) -> Result<()> {
        self.tls.trust().authenticate(
            self.device.id(),
            &self.device.name().await,
            &host.to_string(),
            certificate,
        )
    }

    async fn guard<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled(what.to_string())),
            result = fut => result,
        }
    }

    /// Move up to `size` bytes and require all of them
    async fn copy<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut transferred = 0u64;

        while transferred < self.size {
            let want = (self.size - transferred).min(BUFFER_SIZE as u64) as usize;

            let read = self
                .guard("transfer", async {
                    match timeout(TRANSFER_TIMEOUT, reader.read(&mut buffer[..want])).await {
                        Err(_) => Err(ProtocolError::Timeout("transfer read".to_string())),
                        // Peer closed without close_notify
                        Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Ok(0),
                        Ok(result) => result.map_err(ProtocolError::from),
                    }
                })
                .await?;
            if read == 0 {
                break;
            }

            self.guard("transfer", async {
                timeout(TRANSFER_TIMEOUT, writer.write_all(&buffer[..read]))
                    .await
                    .map_err(|_| ProtocolError::Timeout("transfer write".to_string()))?
                    .map_err(ProtocolError::from)
            })
            .await?;

            transferred += read as u64;

            if let Some(callback) = &self.progress {
                if !callback(transferred, self.size) {
                    info!("Transfer {} cancelled by progress callback", self.uuid);
                    return Err(ProtocolError::Cancelled("transfer".to_string()));
                }
            }
        }

        writer.flush().await?;

        if transferred != self.size {
            return Err(ProtocolError::IncompleteTransfer {
                expected: self.size,
                received: transferred,
            });
        }
        Ok(transferred)
    }

    fn finish(&self, result: Result<u64>) -> Result<u64> {
        match &result {
            Ok(bytes) => info!("Transfer {} complete: {} bytes", self.uuid, bytes),
            Err(e) => warn!("Transfer {} failed: {}", self.uuid, e),
        }
        result
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.device.unregister_transfer(&self.uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PluginRegistry;
    use crate::channel::Direction;
    use crate::device::ChannelHandle;
    use crate::identity::{DeviceInfo, DeviceType};
    use crate::trust::TrustStore;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Side {
        tls: Arc<TlsContext>,
        /// The other side as seen from here
        peer: Arc<Device>,
    }

    fn side(dir: &TempDir, local_id: &str, peer_id: &str) -> Side {
        let trust = Arc::new(TrustStore::open(dir.path().join(local_id), local_id).unwrap());
        let tls = Arc::new(TlsContext::new(Arc::clone(&trust)).unwrap());
        let mut info = DeviceInfo::with_id(peer_id, peer_id, DeviceType::Desktop, 1716);
        info.tcp_host = Some(LOCALHOST);
        let peer = Device::new(info, Arc::new(PluginRegistry::new()), trust);
        Side { tls, peer }
    }

    async fn control_channel(device: &Arc<Device>) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(42, Direction::Outbound, LOCALHOST, Vec::new(), CancellationToken::new(), tx);
        device.attach_channel(handle).await.unwrap();
        rx
    }

    async fn run(payload: Vec<u8>, declared: u64) -> (Result<u64>, Result<u64>, Vec<u8>, Side, Side) {
        let dir = TempDir::new().unwrap();
        let a = side(&dir, "device_a", "device_b");
        let b = side(&dir, "device_b", "device_a");
        let mut control = control_channel(&a.peer).await;

        let upload = Transfer::new(Arc::clone(&a.peer), Arc::clone(&a.tls), declared)
            .with_checksum("abc123")
            .with_bind_address(LOCALHOST)
            .with_port_range(0..=0);
        assert_eq!(a.peer.transfer_ids().len(), 1);

        let upload_task = tokio::spawn(async move {
            upload
                .upload(Packet::new("kdeconnect.share.request", serde_json::json!({"filename": "a.bin"})), &payload[..])
                .await
        });

        let packet = control.recv().await.unwrap();
        assert_eq!(packet.payload_size, Some(declared as i64));
        assert_eq!(packet.get_body_field::<String>("payloadHash").as_deref(), Some("abc123"));
        assert!(packet.transfer_port().is_some());

        let mut sink = Vec::new();
        let download = Transfer::new(Arc::clone(&b.peer), Arc::clone(&b.tls), declared);
        let downloaded = download.download(&packet, &mut sink).await;
        let uploaded = upload_task.await.unwrap();

        (uploaded, downloaded, sink, a, b)
    }

    #[tokio::test]
    async fn test_exact_size_transfer_succeeds() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let (uploaded, downloaded, sink, a, b) = run(payload.clone(), payload.len() as u64).await;

        assert_eq!(uploaded.unwrap(), payload.len() as u64);
        assert_eq!(downloaded.unwrap(), payload.len() as u64);
        assert_eq!(sink, payload);
        assert!(a.peer.transfer_ids().is_empty());
        assert!(b.peer.transfer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_short_transfer_fails_on_both_ends() {
        let (uploaded, downloaded, sink, a, b) = run(vec![7u8; 1000], 4096).await;

        assert!(matches!(
            uploaded,
            Err(ProtocolError::IncompleteTransfer { expected: 4096, received: 1000 })
        ));
        assert!(matches!(
            downloaded,
            Err(ProtocolError::IncompleteTransfer { expected: 4096, received: 1000 })
        ));
        assert_eq!(sink.len(), 1000);
        assert!(a.peer.transfer_ids().is_empty());
        assert!(b.peer.transfer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_port_range_exhausted() {
        let dir = TempDir::new().unwrap();
        let a = side(&dir, "device_a", "device_b");
        let _control = control_channel(&a.peer).await;

        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = Transfer::new(Arc::clone(&a.peer), Arc::clone(&a.tls), 10)
            .with_bind_address(LOCALHOST)
            .with_port_range(port..=port)
            .upload(Packet::new("kdeconnect.share.request", serde_json::json!({})), &b"0123456789"[..])
            .await;

        assert!(matches!(result, Err(ProtocolError::PortRangeExhausted { .. })));
        assert!(a.peer.transfer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reports_and_cancels() {
        let dir = TempDir::new().unwrap();
        let a = side(&dir, "device_a", "device_b");
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);

        let transfer = Transfer::new(Arc::clone(&a.peer), Arc::clone(&a.tls), 100).with_progress(Box::new(
            move |done, total| {
                assert_eq!(total, 100);
                seen_cb.store(done, Ordering::SeqCst);
                false
            },
        ));

        let mut sink = Vec::new();
        let result = transfer.copy(&mut &[1u8; 100][..], &mut sink).await;

        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }
}
