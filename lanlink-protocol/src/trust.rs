//! Certificate and Trust Store
//!
//! Holds this device's long-lived self-signed TLS identity and the
//! certificates pinned for paired peers.
//!
//! ## Security Model
//!
//! - **Self certificate**: generated once with `rcgen` (ECDSA P-256, CN = device id)
//!   and persisted as PEM; reused across restarts
//! - **Trust-On-First-Use**: a device without a pinned certificate is accepted at
//!   the transport level; the pairing layer decides whether to pin it
//! - **Pinning by content**: once pinned, only a byte-identical certificate is
//!   accepted. Expiry is never checked, so long-lived pairings survive the
//!   certificate's `notAfter`
//!
//! ## Layout
//!
//! ```text
//! <dir>/device.crt          self certificate (PEM)
//! <dir>/device.key          self private key (PKCS#8 PEM)
//! <dir>/trusted/<id>.pem    pinned peer certificates
//! ```

use crate::{ProtocolError, Result};
use chrono::{Datelike, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Organization name in certificate DN
const CERT_ORG: &str = "LANLink";

/// Organizational unit in certificate DN
const CERT_ORG_UNIT: &str = "LANLink";

/// Certificate validity in years
const CERT_VALIDITY_YEARS: i32 = 10;

const CERT_FILE: &str = "device.crt";
const KEY_FILE: &str = "device.key";
const TRUSTED_DIR: &str = "trusted";

/// Device certificate information
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device ID (Common Name of the certificate)
    pub device_id: String,

    /// DER-encoded X.509 certificate
    pub certificate: Vec<u8>,

    /// DER-encoded PKCS#8 private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint (colon separated, uppercase)
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate
    ///
    /// # Examples
    ///
    /// ```
    /// use lanlink_protocol::trust::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// assert_eq!(cert_info.fingerprint.len(), 95);
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        info!("Generating certificate for device: {}", device_id);

        let mut params = CertificateParams::new(vec![device_id.clone()]);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CERT_ORG);
        dn.push(DnType::OrganizationalUnitName, CERT_ORG_UNIT);
        dn.push(DnType::CommonName, device_id.clone());
        params.distinguished_name = dn;

        // Backdated a year to tolerate peers with skewed clocks
        let year = Utc::now().year();
        params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
        params.not_after = rcgen::date_time_ymd(year + CERT_VALIDITY_YEARS, 1, 1);

        params.is_ca = rcgen::IsCa::NoCa;
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyAgreement,
        ];

        let cert = rcgen::Certificate::from_params(params)?;
        let certificate = cert.serialize_der()?;
        let private_key = cert.serialize_private_key_der();
        let fingerprint = fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Save certificate and private key as PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(cert_path, encode_certificate(&self.certificate))?;
        fs::write(
            key_path,
            pem::encode(&pem::Pem::new("PRIVATE KEY", self.private_key.clone())),
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
        }

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        device_id: impl Into<String>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let device_id = device_id.into();
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let certificate = decode_pem(&fs::read(cert_path)?, &["CERTIFICATE"])?;
        let private_key = decode_pem(&fs::read(key_path)?, &["PRIVATE KEY"])?;
        let fingerprint = fingerprint(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }
}

/// Calculate SHA256 fingerprint of a DER certificate
///
/// Returns fingerprint in format: XX:XX:XX:...:XX
pub fn fingerprint(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    hash.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<String>>()
        .join(":")
}

fn encode_certificate(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

fn decode_pem(data: &[u8], tags: &[&str]) -> Result<Vec<u8>> {
    let parsed = pem::parse(data)
        .map_err(|e| ProtocolError::InvalidCertificate(format!("Failed to parse PEM: {}", e)))?;

    if !tags.contains(&parsed.tag()) {
        return Err(ProtocolError::InvalidCertificate(format!(
            "Expected {} tag, got {}",
            tags.join(" or "),
            parsed.tag()
        )));
    }

    Ok(parsed.contents().to_vec())
}

/// Persistent store of the local identity and pinned peer certificates
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    certificate: CertificateInfo,
}

impl TrustStore {
    /// Open the store, generating and persisting the self certificate on first run
    pub fn open(dir: impl Into<PathBuf>, device_id: &str) -> Result<Self> {
        let dir = dir.into();
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        let certificate = if cert_path.exists() && key_path.exists() {
            CertificateInfo::load_from_files(device_id, &cert_path, &key_path)?
        } else {
            let generated = CertificateInfo::generate(device_id)?;
            generated.save_to_files(&cert_path, &key_path)?;
            generated
        };

        fs::create_dir_all(dir.join(TRUSTED_DIR))?;

        Ok(Self { dir, certificate })
    }

    /// This device's certificate
    pub fn self_certificate(&self) -> &CertificateInfo {
        &self.certificate
    }

    fn pinned_path(&self, device_id: &str) -> PathBuf {
        let file_name: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(TRUSTED_DIR).join(format!("{}.pem", file_name))
    }

    /// Pinned certificate of a device, if it is paired
    pub fn pinned_certificate(&self, device_id: &str) -> Option<Vec<u8>> {
        let path = self.pinned_path(device_id);
        let data = fs::read(&path).ok()?;
        match decode_pem(&data, &["CERTIFICATE"]) {
            Ok(der) => Some(der),
            Err(e) => {
                error!("Ignoring unreadable pinned certificate {:?}: {}", path, e);
                None
            }
        }
    }

    /// Pin a device's certificate after successful pairing
    pub fn pin(&self, device_id: &str, certificate: &[u8]) -> Result<()> {
        let path = self.pinned_path(device_id);
        fs::write(&path, encode_certificate(certificate))?;
        info!(
            "Pinned certificate {} for device {}",
            fingerprint(certificate),
            device_id
        );
        Ok(())
    }

    /// Forget a device's certificate (unpair)
    pub fn unpin(&self, device_id: &str) -> Result<()> {
        let path = self.pinned_path(device_id);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Removed pinned certificate for device {}", device_id);
        }
        Ok(())
    }

    /// Check a presented certificate
    ///
    /// Unpinned devices are trusted (TOFU); pinned devices must present a
    /// byte-identical certificate.
    pub fn verify(&self, device_id: &str, certificate: &[u8]) -> bool {
        match self.pinned_certificate(device_id) {
            None => true,
            Some(pinned) => pinned == certificate,
        }
    }

    /// Like [`verify`](Self::verify), but produces the user-facing error
    ///
    /// The error carries the remote and local fingerprints so the user can
    /// compare them out of band.
    pub fn authenticate(
        &self,
        device_id: &str,
        device_name: &str,
        host: &str,
        certificate: &[u8],
    ) -> Result<()> {
        if self.verify(device_id, certificate) {
            return Ok(());
        }

        let error = ProtocolError::AuthenticationFailed {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            host: host.to_string(),
            remote_fingerprint: fingerprint(certificate),
            local_fingerprint: self.certificate.fingerprint.clone(),
        };
        error!("{}", error);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_format() {
        let cert = CertificateInfo::generate("test").unwrap();

        // SHA256 = 32 bytes = 64 hex chars + 31 colons = 95 chars
        assert_eq!(cert.fingerprint.len(), 95);
        assert_eq!(cert.fingerprint.matches(':').count(), 31);
        assert_eq!(cert.fingerprint, fingerprint(&cert.certificate));
    }

    #[test]
    fn test_save_and_load_files() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("cert.pem");
        let key_path = temp_dir.path().join("key.pem");

        let original = CertificateInfo::generate("test_device").unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateInfo::load_from_files("test_device", &cert_path, &key_path).unwrap();
        assert_eq!(loaded.certificate, original.certificate);
        assert_eq!(loaded.private_key, original.private_key);
        assert_eq!(loaded.fingerprint, original.fingerprint);
    }

    #[test]
    fn test_self_certificate_is_stable_across_opens() {
        let temp_dir = TempDir::new().unwrap();

        let first = TrustStore::open(temp_dir.path(), "local_device").unwrap();
        let fingerprint = first.self_certificate().fingerprint.clone();
        drop(first);

        let second = TrustStore::open(temp_dir.path(), "local_device").unwrap();
        assert_eq!(second.self_certificate().fingerprint, fingerprint);
    }

    #[test]
    fn test_verify_is_tofu_until_pinned() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path(), "local").unwrap();

        let peer = CertificateInfo::generate("peer").unwrap();
        let impostor = CertificateInfo::generate("peer").unwrap();

        assert!(store.pinned_certificate("peer").is_none());
        assert!(store.verify("peer", &peer.certificate));
        assert!(store.verify("peer", &impostor.certificate));

        store.pin("peer", &peer.certificate).unwrap();
        assert_eq!(store.pinned_certificate("peer"), Some(peer.certificate.clone()));
        assert!(store.verify("peer", &peer.certificate));
        assert!(!store.verify("peer", &impostor.certificate));

        store.unpin("peer").unwrap();
        assert!(store.verify("peer", &impostor.certificate));
    }

    #[test]
    fn test_authenticate_reports_both_fingerprints() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path(), "local").unwrap();

        let peer = CertificateInfo::generate("peer").unwrap();
        let impostor = CertificateInfo::generate("peer").unwrap();
        store.pin("peer", &peer.certificate).unwrap();

        let err = store
            .authenticate("peer", "Phone", "10.0.0.7", &impostor.certificate)
            .unwrap_err();

        match err {
            ProtocolError::AuthenticationFailed {
                device_name,
                host,
                remote_fingerprint,
                local_fingerprint,
                ..
            } => {
                assert_eq!(device_name, "Phone");
                assert_eq!(host, "10.0.0.7");
                assert_eq!(remote_fingerprint, impostor.fingerprint);
                assert_eq!(local_fingerprint, store.self_certificate().fingerprint);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pinned_path_is_sanitized() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path(), "local").unwrap();

        let peer = CertificateInfo::generate("peer").unwrap();
        store.pin("../escape", &peer.certificate).unwrap();

        assert!(temp_dir.path().join(TRUSTED_DIR).join("___escape.pem").exists());
        assert!(store.pinned_certificate("../escape").is_some());
    }
}
