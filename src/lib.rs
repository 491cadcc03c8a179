//! Peer-side device core for the KDE Connect protocol.
//!
//! Discovers peers through an external discovery collaborator, opens
//! authenticated TLS channels to them, runs the mutual pairing handshake,
//! and dispatches typed application packets to capability handlers.

pub mod cache;
pub mod certificate;
pub mod device;
pub mod handlers;
pub mod identity;
pub mod packet;
pub mod transport;

mod error;

pub use cache::{CacheEntry, DeviceCache};
pub use certificate::{fingerprint, CertificateInfo, CertificateStore};
pub use device::{
    ConnectionState, Device, DeviceConfig, DeviceContext, DeviceEvent, DeviceManager,
    DeviceSignal, PairState,
};
pub use error::{ProtocolError, Result};
pub use handlers::{CapabilityHandler, HandlerFactory, HandlerRegistry};
pub use identity::{DeviceType, DiscoveredDevice, LocalDevice, DEFAULT_TCP_PORT};
pub use packet::{current_timestamp, Packet};

/// Protocol version this core implements and advertises.
pub const PROTOCOL_VERSION: u32 = 7;
