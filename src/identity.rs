//! Device identity records.
//!
//! [`LocalDevice`] describes this side of the protocol and builds the identity
//! greeting; [`DiscoveredDevice`] is the immutable record a discovery
//! collaborator hands to the [`DeviceManager`](crate::device::DeviceManager)
//! for every identity broadcast it sees.

use crate::packet::{Packet, PACKET_TYPE_IDENTITY};
use crate::{ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use tracing::warn;
use uuid::Uuid;

/// Default TCP port peers listen on.
pub const DEFAULT_TCP_PORT: u16 = 1714;

/// Device types advertised in identity packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse an identity-packet tag. Unknown tags degrade to `desktop` so a
    /// peer with a newer tag set stays visible.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            other => {
                warn!("unknown device type tag '{other}', treating as desktop");
                DeviceType::Desktop
            }
        }
    }
}

/// This side's identity, advertised in the plain greeting on every connection.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub tcp_port: u16,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
}

impl LocalDevice {
    /// Create a local identity with a freshly generated device id.
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        Self::with_id(generate_device_id(), device_name, device_type, tcp_port)
    }

    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.len() > 32 {
            warn!("device name should be 1-32 characters, got: {device_name}");
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            tcp_port,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
        }
    }

    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = dedup_preserving_order(capabilities);
        self
    }

    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = dedup_preserving_order(capabilities);
        self
    }

    /// Build the `kdeconnect.identity` greeting.
    pub fn identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "tcpPort": self.tcp_port,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
            }),
        )
    }
}

/// UUIDv4 with underscores, the id format KDE Connect peers use.
fn generate_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

/// Immutable descriptor of a peer as seen by discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub tcp_port: u16,
    pub host: IpAddr,
    pub outgoing_capabilities: Vec<String>,
    pub incoming_capabilities: Vec<String>,
}

impl DiscoveredDevice {
    /// Parse a received identity packet into a descriptor.
    ///
    /// `protocolVersion` defaults to 7 and `tcpPort` to 1714; capability
    /// lists tolerate duplicates on input and are deduplicated preserving
    /// insertion order.
    pub fn from_identity_packet(packet: &Packet, host: IpAddr) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::MalformedPacket("identity missing deviceId".into()))?;
        let device_name = packet
            .body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::MalformedPacket("identity missing deviceName".into()))?;
        let device_type = packet
            .body_field::<String>("deviceType")
            .map(|tag| DeviceType::from_tag(&tag))
            .unwrap_or(DeviceType::Desktop);
        let protocol_version = packet
            .body_field::<u32>("protocolVersion")
            .unwrap_or(PROTOCOL_VERSION);
        let tcp_port = packet
            .body_field::<u16>("tcpPort")
            .unwrap_or(DEFAULT_TCP_PORT);
        let outgoing_capabilities = dedup_preserving_order(
            packet
                .body_field::<Vec<String>>("outgoingCapabilities")
                .unwrap_or_default(),
        );
        let incoming_capabilities = dedup_preserving_order(
            packet
                .body_field::<Vec<String>>("incomingCapabilities")
                .unwrap_or_default(),
        );

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            tcp_port,
            host,
            outgoing_capabilities,
            incoming_capabilities,
        })
    }
}

/// Drop duplicate capability strings, keeping first occurrences in order.
pub(crate) fn dedup_preserving_order(capabilities: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(capabilities.len());
    for cap in capabilities {
        if !seen.contains(&cap) {
            seen.push(cap);
        }
    }
    seen
}
