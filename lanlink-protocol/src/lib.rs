//! LAN Link Protocol Implementation
//!
//! Discovery, pairing and secure transport for KDE Connect compatible
//! devices: UDP identity broadcast, TLS control channels with
//! trust-on-first-use certificate pinning, and per-payload transfer channels.

pub mod capability;
pub mod channel;
pub mod device;
pub mod discovery;
pub mod identity;
pub mod packet;
pub mod tls;
pub mod transfer;
pub mod trust;

mod error;

pub use capability::{ActionRequirements, ActionStates, PeerCapabilities, PluginManifest, PluginRegistry};
pub use channel::{Channel, ChannelState, Direction, IncomingChannel};
pub use device::{Device, DeviceEvent, DeviceRegistry, PacketRouter, RegistryEvent};
pub use discovery::{DiscoveryService, ServiceConfig, ServiceEvent};
pub use error::{ProtocolError, Result};
pub use identity::{DeviceInfo, DeviceType};
pub use packet::{current_timestamp, Packet};
pub use tls::TlsContext;
pub use transfer::{ProgressCallback, Transfer};
pub use trust::{CertificateInfo, TrustStore};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;

/// UDP port identities are announced on
pub const DISCOVERY_PORT: u16 = 1716;

/// TCP port of the control channel listener
pub const CONTROL_PORT: u16 = 1716;

/// Port range for transfer channels
pub const TRANSFER_PORT_START: u16 = 1739;
pub const TRANSFER_PORT_END: u16 = 1764;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 7);
    }
}
