//! TLS Layer
//!
//! Wraps established TCP sockets in TLS using each side's self-signed
//! certificate.
//!
//! ## Security Model
//!
//! - **Trust-On-First-Use (TOFU)**: the TLS layer accepts any certificate,
//!   including expired ones; trust is decided afterwards by the
//!   [`TrustStore`](crate::trust::TrustStore) by comparing certificate bytes
//! - **Proof of possession**: handshake signatures are verified against the
//!   presented certificate, so a copied certificate is useless without its key
//! - **Mutual TLS**: both sides present certificates; client auth is mandatory
//!
//! ## TLS Roles
//!
//! The side that dialed the TCP connection is the TLS **client**; the side
//! that accepted it is the TLS **server**. The same holds for transfer
//! channels: the uploader accepts and serves, the downloader dials.

use crate::trust::{CertificateInfo, TrustStore};
use crate::{ProtocolError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::{ClientConfig, ServerConfig};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

/// Upper bound on a TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Signature algorithms of the ring provider
///
/// Handshake signatures are always verified, so a peer replaying someone
/// else's certificate without the matching private key fails the handshake.
fn signature_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Trust-On-First-Use server certificate verifier
///
/// Accepts any certificate regardless of issuer, name or validity period,
/// but checks that the server signed the handshake with its key.
#[derive(Debug)]
struct TofuCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for TofuCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Trust-On-First-Use client certificate verifier
#[derive(Debug)]
struct TofuClientCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl rustls::server::danger::ClientCertVerifier for TofuClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Client and server TLS configurations plus the trust store deciding on peers
pub struct TlsContext {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
    trust: Arc<TrustStore>,
}

impl TlsContext {
    /// Build both configurations from the store's self certificate
    pub fn new(trust: Arc<TrustStore>) -> Result<Self> {
        let (client_config, server_config) = build_configs(trust.self_certificate())?;
        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
            trust,
        })
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Run the TLS client handshake over an established socket
    ///
    /// Returns the stream and the DER certificate the server presented.
    pub async fn connect(
        &self,
        tcp: TcpStream,
        host: IpAddr,
    ) -> Result<(TlsStream<TcpStream>, Vec<u8>)> {
        debug!("Starting TLS client handshake with {}", host);

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let server_name = ServerName::IpAddress(host.into());

        let stream = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {}", host)))?
            .map_err(|e| ProtocolError::from_io_error(e, "TLS client handshake"))?;

        let certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .ok_or_else(|| {
                ProtocolError::InvalidCertificate("server presented no certificate".to_string())
            })?;

        debug!("TLS client handshake with {} complete", host);
        Ok((TlsStream::Client(stream), certificate))
    }

    /// Run the TLS server handshake over an accepted socket
    ///
    /// Returns the stream and the DER certificate the client presented.
    pub async fn accept(&self, tcp: TcpStream) -> Result<(TlsStream<TcpStream>, Vec<u8>)> {
        let peer = tcp.peer_addr()?;
        debug!("Starting TLS server handshake with {}", peer);

        let acceptor = TlsAcceptor::from(Arc::clone(&self.server_config));

        let stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {}", peer)))?
            .map_err(|e| ProtocolError::from_io_error(e, "TLS server handshake"))?;

        let certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .ok_or_else(|| {
                ProtocolError::InvalidCertificate("client presented no certificate".to_string())
            })?;

        debug!("TLS server handshake with {} complete", peer);
        Ok((TlsStream::Server(stream), certificate))
    }
}

fn build_configs(cert_info: &CertificateInfo) -> Result<(ClientConfig, ServerConfig)> {
    debug!("Creating TLS config for device {}", cert_info.device_id);

    let cert_der = CertificateDer::from(cert_info.certificate.clone());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert_info.private_key.clone()));

    let client_config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TofuCertVerifier {
            algorithms: signature_algorithms(),
        }))
        .with_client_auth_cert(vec![cert_der.clone()], key_der.clone_key())?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(TofuClientCertVerifier {
            algorithms: signature_algorithms(),
        }))
        .with_single_cert(vec![cert_der], key_der)?;

    Ok((client_config, server_config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context(dir: &TempDir, device_id: &str) -> TlsContext {
        let trust = TrustStore::open(dir.path().join(device_id), device_id).unwrap();
        TlsContext::new(Arc::new(trust)).unwrap()
    }

    #[tokio::test]
    async fn test_mutual_handshake_exchanges_certificates() {
        let dir = TempDir::new().unwrap();
        let server_ctx = Arc::new(context(&dir, "server"));
        let client_ctx = context(&dir, "client");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = {
            let server_ctx = Arc::clone(&server_ctx);
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                let (mut stream, peer_cert) = server_ctx.accept(tcp).await.unwrap();
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).await.unwrap();
                (peer_cert, buf)
            })
        };

        let tcp = TcpStream::connect(addr).await.unwrap();
        let (mut stream, server_cert) = client_ctx.connect(tcp, addr.ip()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let (client_cert, buf) = server_task.await.unwrap();

        assert_eq!(&buf, b"hello");
        assert_eq!(server_cert, server_ctx.trust().self_certificate().certificate);
        assert_eq!(client_cert, client_ctx.trust().self_certificate().certificate);
    }
    /// Certificate of `genuine` paired with the private key of `attacker`
    fn copied_identity(genuine: &CertificateInfo, attacker: &CertificateInfo) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        (
            CertificateDer::from(genuine.certificate.clone()),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(attacker.private_key.clone())),
        )
    }

    #[tokio::test]
    async fn test_client_with_copied_certificate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let victim = Arc::new(context(&dir, "victim"));
        let genuine = CertificateInfo::generate("paired_peer").unwrap();
        let attacker = CertificateInfo::generate("attacker").unwrap();

        // The victim trusts the genuine certificate
        victim.trust().pin("paired_peer", &genuine.certificate).unwrap();

        let (cert, key) = copied_identity(&genuine, &attacker);
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TofuCertVerifier {
                algorithms: signature_algorithms(),
            }))
            .with_client_auth_cert(vec![cert], key)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let attacking = tokio::spawn(async move {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::IpAddress(addr.ip().into());
            if let Ok(mut stream) = connector.connect(server_name, tcp).await {
                let _ = stream.write_all(b"hello").await;
                let mut buf = [0u8; 1];
                let _ = stream.read(&mut buf).await;
            }
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let result = victim.accept(tcp).await;
        assert!(result.is_err());

        attacking.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_with_copied_certificate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let victim = context(&dir, "victim");
        let genuine = CertificateInfo::generate("paired_peer").unwrap();
        let attacker = CertificateInfo::generate("attacker").unwrap();

        let (cert, key) = copied_identity(&genuine, &attacker);
        let config = ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(TofuClientCertVerifier {
                algorithms: signature_algorithms(),
            }))
            .with_single_cert(vec![cert], key)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = TlsAcceptor::from(Arc::new(config)).accept(tcp).await;
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let result = victim.connect(tcp, addr.ip()).await;
        assert!(result.is_err());

        serving.await.unwrap();
    }
}
