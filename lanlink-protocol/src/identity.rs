//! Device Identity
//!
//! Devices announce themselves with `kdeconnect.identity` packets, both as UDP
//! broadcasts and as the first plaintext line of every TCP connection.
//!
//! ## Identity Packet Format
//!
//! - `deviceId`: UUIDv4 with underscores (e.g., `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: human readable name
//! - `deviceType`: desktop, laptop, phone, tablet, tv or unknown
//! - `protocolVersion`: protocol version (currently 7)
//! - `incomingCapabilities`: packet types this device can receive
//! - `outgoingCapabilities`: packet types this device can send
//! - `tcpPort`: TCP port of the control channel listener
//!
//! Receivers stamp the address they observed the packet from into
//! `body.tcpHost`; whatever the sender put there is overwritten.

use crate::capability::{PeerCapabilities, PluginRegistry};
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use tracing::warn;
use uuid::Uuid;

/// Packet type of identity packets
pub const IDENTITY_PACKET_TYPE: &str = "kdeconnect.identity";

/// Device types advertised in identity packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
    Unknown,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Parse a device type, mapping anything unrecognised to `Unknown`
    pub fn from_name(name: &str) -> Self {
        match name {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" | "smartphone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Unknown,
        }
    }
}

/// Device identity information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version (currently 7)
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port of the control channel (0 when not advertised)
    pub tcp_port: u16,

    /// Address the identity was observed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_host: Option<IpAddr>,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with a freshly generated device id
    ///
    /// # Examples
    ///
    /// ```
    /// use lanlink_protocol::identity::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("My Computer", DeviceType::Desktop, 1716);
    /// assert!(!info.device_id.contains('-'));
    /// ```
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        Self::with_id(generate_device_id(), device_name, device_type, tcp_port)
    }

    /// Create a DeviceInfo with explicit device ID
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
            tcp_host: None,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Replace both capability lists with the union over a registry
    pub fn with_capabilities_from(mut self, registry: &PluginRegistry) -> Self {
        self.incoming_capabilities = registry.incoming_capabilities();
        self.outgoing_capabilities = registry.outgoing_capabilities();
        self
    }

    /// Capability sets as used for action gating
    pub fn capabilities(&self) -> PeerCapabilities {
        PeerCapabilities::new(
            self.incoming_capabilities.iter().cloned(),
            self.outgoing_capabilities.iter().cloned(),
        )
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            IDENTITY_PACKET_TYPE,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    ///
    /// Equivalent to [`validate`].
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        validate(packet)
    }
}

/// Generate a UUIDv4 device ID with underscores
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

/// Build the local identity packet
///
/// Capability lists are the union across every manifest in `registry`.
pub fn build(local: &DeviceInfo, registry: &PluginRegistry) -> Packet {
    local
        .clone()
        .with_capabilities_from(registry)
        .to_identity_packet()
}

/// Validate an identity packet and extract the device information
///
/// # Errors
///
/// - `MissingDeviceId` when `deviceId` is absent, not a string or empty
/// - `InvalidIdentity` when the packet is not an identity packet
pub fn validate(packet: &Packet) -> Result<DeviceInfo> {
    if !packet.is_type(IDENTITY_PACKET_TYPE) {
        return Err(ProtocolError::InvalidIdentity(format!(
            "unexpected packet type {}",
            packet.packet_type
        )));
    }

    let device_id = match packet.body.get("deviceId") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        _ => return Err(ProtocolError::MissingDeviceId),
    };

    let device_name = packet
        .get_body_field::<String>("deviceName")
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| device_id.clone());

    let device_type = packet
        .get_body_field::<String>("deviceType")
        .map(|t| DeviceType::from_name(&t))
        .unwrap_or(DeviceType::Unknown);

    let protocol_version = packet
        .get_body_field::<u32>("protocolVersion")
        .unwrap_or(PROTOCOL_VERSION);

    if protocol_version != PROTOCOL_VERSION {
        warn!(
            "Device {} speaks protocol version {} (we speak {})",
            device_name, protocol_version, PROTOCOL_VERSION
        );
    }

    let tcp_port = packet.get_body_field::<u16>("tcpPort").unwrap_or(0);

    let tcp_host = packet
        .get_body_field::<String>("tcpHost")
        .and_then(|host| host.parse().ok());

    Ok(DeviceInfo {
        device_id,
        device_name,
        device_type,
        protocol_version,
        incoming_capabilities: packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap_or_default(),
        outgoing_capabilities: packet
            .get_body_field::<Vec<String>>("outgoingCapabilities")
            .unwrap_or_default(),
        tcp_port,
        tcp_host,
    })
}

/// Stamp the observed sender address into `body.tcpHost`
pub fn stamp_host(packet: &mut Packet, host: IpAddr) {
    packet.set_body_field("tcpHost", host.to_string());
}

/// Device name carried by an identity, for diagnostics on rejected packets
pub fn display_name(packet: &Packet) -> String {
    packet
        .get_body_field::<String>("deviceName")
        .unwrap_or_else(|| "unknown device".to_string())
}
