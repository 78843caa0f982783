//! Discovery Event System
//!
//! Events emitted by the discovery service to external collaborators.

use crate::channel::Direction;
use crate::ProtocolError;
use std::net::IpAddr;

/// Events emitted by the discovery service
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// Sockets are bound and the service loops are running
    Started {
        /// UDP announce port
        udp_port: u16,
        /// TCP control port
        tcp_port: u16,
    },

    /// A device entry was created from an identity
    DeviceDiscovered {
        device_id: String,
        device_name: String,
        host: IpAddr,
    },

    /// A channel was attached to a device
    ChannelAttached {
        device_id: String,
        channel_id: u64,
        direction: Direction,
    },

    /// A pinned device presented a different certificate
    ///
    /// This is the security notice for the user; both fingerprints are
    /// included for out-of-band comparison.
    AuthenticationFailed {
        device_id: String,
        device_name: String,
        host: String,
        remote_fingerprint: String,
        local_fingerprint: String,
    },

    /// The service was stopped
    Stopped,
}

impl ServiceEvent {
    /// Security notice for an authentication error, if it is one
    pub fn from_error(error: &ProtocolError) -> Option<Self> {
        match error {
            ProtocolError::AuthenticationFailed {
                device_id,
                device_name,
                host,
                remote_fingerprint,
                local_fingerprint,
            } => Some(ServiceEvent::AuthenticationFailed {
                device_id: device_id.clone(),
                device_name: device_name.clone(),
                host: host.clone(),
                remote_fingerprint: remote_fingerprint.clone(),
                local_fingerprint: local_fingerprint.clone(),
            }),
            _ => None,
        }
    }

    /// Check if this is a device discovered event
    pub fn is_device_discovered(&self) -> bool {
        matches!(self, ServiceEvent::DeviceDiscovered { .. })
    }

    pub fn is_channel_attached(&self) -> bool {
        matches!(self, ServiceEvent::ChannelAttached { .. })
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, ServiceEvent::AuthenticationFailed { .. })
    }

    /// Get device ID if this event is device-related
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ServiceEvent::DeviceDiscovered { device_id, .. }
            | ServiceEvent::ChannelAttached { device_id, .. }
            | ServiceEvent::AuthenticationFailed { device_id, .. } => Some(device_id),
            _ => None,
        }
    }
}
