//! Capability handler surface.
//!
//! A handler claims one packet type (`kdeconnect.battery`, …) on a device and
//! receives that device's inbound packets of the type. Handlers hold no
//! owning reference to their device; [`CapabilityHandler::use_device`] and
//! [`CapabilityHandler::release_device`] bracket the attachment, and
//! outbound packets go through [`Device::send`](crate::device::Device::send),
//! which is available at any time.
//!
//! The [`HandlerRegistry`] is a process-wide set of factories keyed by
//! packet-type string; devices instantiate handlers from it for the
//! capabilities a peer actually advertises.

use crate::device::Device;
use crate::packet::Packet;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// The packet type this handler consumes.
    fn packet_type_filter(&self) -> String;

    /// Called once when the handler is attached to a device.
    async fn use_device(&mut self, device: &Device) -> Result<()>;

    /// Called exactly once when the handler is detached, either because the
    /// capability disappeared or the device is being destroyed.
    async fn release_device(&mut self, device: &Device) -> Result<()>;

    /// An inbound packet matching the filter arrived on a ready channel.
    async fn message(&mut self, device: &Device, packet: &Packet) -> Result<()>;
}

/// Creates handler instances for one packet type.
pub trait HandlerFactory: Send + Sync {
    fn packet_type(&self) -> String;
    fn create(&self) -> Box<dyn CapabilityHandler>;
}

/// Process-wide registry of handler factories, initialized once.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. At most one factory per packet type.
    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) -> Result<()> {
        let packet_type = factory.packet_type();
        if self.factories.contains_key(&packet_type) {
            return Err(ProtocolError::Handler(format!(
                "capability {packet_type} already has a factory"
            )));
        }
        info!("registered handler factory for {packet_type}");
        self.factories.insert(packet_type, factory);
        Ok(())
    }

    pub fn factory_for(&self, packet_type: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.factories.get(packet_type).cloned()
    }

    /// Packet types a factory exists for.
    pub fn capabilities(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }
}
