//! Error handling for the LAN protocol core
//!
//! This module provides a single error type for every protocol operation.
//! Errors are automatically converted from underlying library errors using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Error Propagation
//!
//! Use `?` operator for automatic error propagation:
//!
//! ```rust,no_run
//! use lanlink_protocol::{Packet, Result};
//!
//! fn process_line(line: &str) -> Result<Packet> {
//!     let packet = Packet::parse(line)?;
//!     Ok(packet)
//! }
//! ```
//!
//! ### Error Matching
//!
//! Match on specific error variants for custom handling:
//!
//! ```rust
//! use lanlink_protocol::ProtocolError;
//!
//! fn describe(error: &ProtocolError) -> &'static str {
//!     match error {
//!         ProtocolError::AuthenticationFailed { .. } => "possible impersonation",
//!         ProtocolError::MissingDeviceId => "peer ignored",
//!         _ => "transient",
//!     }
//! }
//! ```
//!
//! ## Error Categories
//!
//! ### Per-attempt errors
//! Malformed packets, identities without a device id, peers that are not
//! allowed, failed handshakes and short transfers. These close the one socket
//! involved and never stop a service loop.
//!
//! ### Authentication errors
//! A pinned certificate that differs from the presented one. Surfaced to the
//! user together with both fingerprints.
//!
//! ### Resource errors
//! Socket bind failures at service construction and an exhausted transfer
//! port range. Propagated to the caller.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Automatic Conversions
///
/// - `std::io::Error` → `ProtocolError::Io`
/// - `serde_json::Error` → `ProtocolError::Json`
/// - `rustls::Error` → `ProtocolError::Tls`
/// - `rcgen::Error` → `ProtocolError::Certificate`
///
/// # Examples
///
/// ```rust
/// use lanlink_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::MalformedPacket("missing type field".to_string());
/// assert_eq!(error.to_string(), "Malformed packet: missing type field");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or record layer error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error
    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Certificate or key material could not be loaded
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Line could not be decoded into a packet
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lanlink_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::MalformedPacket("expected value".to_string());
    /// assert_eq!(error.to_string(), "Malformed packet: expected value");
    /// ```
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Identity packet is structurally wrong (wrong type, bad field types)
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Identity packet carries no `deviceId`
    #[error("Identity packet is missing deviceId")]
    MissingDeviceId,

    /// Unsolicited peer while the service is not discoverable
    #[error("Device not allowed: {0}")]
    DeviceNotAllowed(String),

    /// Presented certificate differs from the one pinned for this device
    ///
    /// Both fingerprints are carried so the user can compare them.
    #[error(
        "Authentication failed for {device_name} ({host}): \
         remote certificate {remote_fingerprint} does not match pinned certificate \
         (local certificate {local_fingerprint})"
    )]
    AuthenticationFailed {
        device_id: String,
        device_name: String,
        host: String,
        remote_fingerprint: String,
        local_fingerprint: String,
    },

    /// Transfer moved fewer (or more) bytes than declared
    #[error("Incomplete transfer: received {received} of {expected} bytes")]
    IncompleteTransfer { expected: u64, received: u64 },

    /// Every port of the transfer range is in use
    #[error("No free transfer port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    /// Service socket could not be bound
    #[error("Failed to bind {protocol} port {port}: {source}")]
    Bind {
        protocol: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Device not found in registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device has no attached channel
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Network unreachable
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation cancelled
    ///
    /// Returned by handshakes and transfers whose cancellation token fired.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Packet size exceeded
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lanlink_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is recoverable (transient error that can be retried)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lanlink_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::Timeout("connection timeout".to_string());
    /// assert!(error.is_recoverable());
    ///
    /// let error = ProtocolError::MissingDeviceId;
    /// assert!(!error.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::IncompleteTransfer { .. }
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error must be shown to the user
    ///
    /// Only authentication mismatches and local misconfiguration qualify;
    /// everything else is discovery noise and is logged only.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailed { .. }
                | ProtocolError::InvalidCertificate(_)
                | ProtocolError::Configuration(_)
        )
    }

    /// Get a user-friendly error message suitable for display in UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::AuthenticationFailed {
                device_name,
                host,
                remote_fingerprint,
                local_fingerprint,
                ..
            } => format!(
                "Authentication failure with \"{}\" ({}). The device presented a different \
                 certificate than the one it was paired with.\n\nRemote: {}\nLocal: {}",
                device_name, host, remote_fingerprint, local_fingerprint
            ),
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' not found. Check if the device is connected.", id)
            }
            ProtocolError::NotConnected(id) => format!("Device '{}' is not connected.", id),
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check if the service is running on the device.".to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "Network unreachable. Check if both devices are on the same network.".to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("Network error: {}. Connection may be unstable.", msg)
            }
            ProtocolError::IncompleteTransfer { expected, received } => format!(
                "Transfer incomplete ({} of {} bytes). Try again.",
                received, expected
            ),
            ProtocolError::PortRangeExhausted { start, end } => format!(
                "No free transfer port between {} and {}. Close other transfers and retry.",
                start, end
            ),
            ProtocolError::Bind { protocol, port, .. } => format!(
                "Could not listen on {} port {}. Another instance may be running.",
                protocol, port
            ),
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::InvalidCertificate(msg) => {
                format!("Certificate error: {}. You may need to re-pair.", msg)
            }
            ProtocolError::Certificate(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
            ProtocolError::PacketSizeExceeded(size, max) => {
                format!("Packet too large ({} bytes, max {} bytes).", size, max)
            }
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::Tls(e) => format!("Secure connection error: {}.", e),
            other => other.to_string(),
        }
    }
}
