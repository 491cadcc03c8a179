//! Canonical device registry.
//!
//! The manager owns every live [`Device`], bridges discovery records to
//! them, gates activation on the administrator's `allowed` flag, and is the
//! single execution context all device signals are dispatched on. It is also
//! the only writer of the [`DeviceCache`].

use super::{Device, DeviceConfig, DeviceContext, DeviceEvent, DeviceSignal};
use crate::cache::DeviceCache;
use crate::certificate::CertificateStore;
use crate::handlers::HandlerRegistry;
use crate::identity::{DiscoveredDevice, LocalDevice};
use crate::packet::Packet;
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct DeviceManager {
    devices: HashMap<String, Device>,
    cache: DeviceCache,
    ctx: DeviceContext,
    signals: mpsc::UnboundedReceiver<(String, DeviceSignal)>,
}

impl DeviceManager {
    /// Create a manager seeded from the cache. Returns the manager and the
    /// receiving end of the `(device_id, event)` stream.
    pub async fn new(
        local: Arc<LocalDevice>,
        certs: Arc<CertificateStore>,
        registry: Arc<HandlerRegistry>,
        cache: DeviceCache,
        config: DeviceConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(String, DeviceEvent)>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let ctx = DeviceContext {
            local,
            certs,
            registry,
            signals: signal_tx,
            events: event_tx,
            config,
        };

        let mut manager = Self {
            devices: HashMap::new(),
            cache,
            ctx,
            signals: signal_rx,
        };
        manager.seed_from_cache().await;
        (manager, event_rx)
    }

    async fn seed_from_cache(&mut self) {
        let entries: Vec<_> = self.cache.entries().cloned().collect();
        for entry in entries {
            match Device::from_cache(&entry, self.ctx.clone()) {
                Ok(mut device) => {
                    if let Err(e) = device.sync_handlers().await {
                        warn!(device = %entry.device_id, "could not attach handlers: {e}");
                    }
                    self.devices.insert(entry.device_id.clone(), device);
                }
                Err(e) => warn!("skipping cached device {}: {e}", entry.device_id),
            }
        }
        info!("restored {} devices from cache", self.devices.len());
    }

    /// Reconcile a discovery record: update the known device or create a
    /// fresh one (not allowed by default). Allowed but inactive devices get
    /// an activation attempt on every ping, which is also the retry path
    /// after transport errors.
    pub async fn observe(&mut self, discovered: DiscoveredDevice) -> Result<()> {
        let device_id = discovered.device_id.clone();

        if let Some(device) = self.devices.get_mut(&device_id) {
            device.update_from_device(&discovered).await?;
            self.persist(&device_id)?;

            let wants_activation = self
                .devices
                .get(&device_id)
                .map(|d| d.is_allowed() && !d.is_active())
                .unwrap_or(false);
            if wants_activation {
                self.try_activate(&device_id).await;
            }
        } else {
            let mut device = Device::from_discovery(discovered, self.ctx.clone());
            device.sync_handlers().await?;
            self.devices.insert(device_id.clone(), device);
            self.persist(&device_id)?;
            self.emit(&device_id, DeviceEvent::Added);
            info!(device = %device_id, "new device discovered");
        }

        Ok(())
    }

    /// Flip the administrator opt-in. Allowing activates; disallowing
    /// deactivates.
    pub async fn set_allowed(&mut self, device_id: &str, allowed: bool) -> Result<()> {
        {
            let device = self
                .devices
                .get_mut(device_id)
                .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
            device.set_allowed(allowed);
            if !allowed && device.is_active() {
                device.deactivate();
            }
        }
        self.persist(device_id)?;

        if allowed {
            self.try_activate(device_id).await;
        }
        Ok(())
    }

    async fn try_activate(&mut self, device_id: &str) {
        let result = match self.devices.get_mut(device_id) {
            Some(device) => device.activate().await,
            None => return,
        };

        match result {
            Ok(()) => {
                // The peer certificate may be fresh; keep the cache current.
                if let Err(e) = self.persist(device_id) {
                    warn!(device = %device_id, "could not persist after activation: {e}");
                }
            }
            Err(e) => warn!(device = %device_id, "activation failed: {e}"),
        }
    }

    /// Send a pairing request to a device.
    pub fn pair(&mut self, device_id: &str) -> Result<()> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?
            .pair(true)
    }

    /// Unpair from a device and persist the loss of trust.
    pub fn unpair(&mut self, device_id: &str) -> Result<()> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?
            .unpair()?;
        self.persist(device_id)
    }

    /// Queue a packet for a device.
    pub fn send(&self, device_id: &str, packet: Packet) -> Result<()> {
        self.devices
            .get(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?
            .send(packet)
    }

    /// Destroy a device: release its handlers, drop its channel, and remove
    /// its cache group.
    pub async fn remove_device(&mut self, device_id: &str) -> Result<()> {
        let mut device = self
            .devices
            .remove(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        device.release_all_handlers().await?;
        device.deactivate();
        self.cache.remove(device_id);
        self.cache.flush()?;
        info!(device = %device_id, "device removed");
        Ok(())
    }

    /// Dispatch one queued device signal. Returns `false` once the queue is
    /// closed. This is the single-consumer loop body that serializes every
    /// device mutation.
    pub async fn step(&mut self) -> bool {
        let Some((device_id, signal)) = self.signals.recv().await else {
            return false;
        };
        self.dispatch(device_id, signal).await;
        true
    }

    /// Run the signal loop until the queue closes.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    async fn dispatch(&mut self, device_id: String, signal: DeviceSignal) {
        let Some(device) = self.devices.get_mut(&device_id) else {
            debug!(device = %device_id, "signal for unknown device dropped");
            return;
        };

        let was_paired = device.is_paired();
        let old_fingerprint = device.certificate_fingerprint().to_string();

        if let Err(e) = device.handle_signal(signal).await {
            warn!(device = %device_id, "signal handling failed: {e}");
        }

        let trust_changed = was_paired != device.is_paired()
            || old_fingerprint != device.certificate_fingerprint();
        if trust_changed {
            if let Err(e) = self.persist(&device_id) {
                warn!(device = %device_id, "could not persist trust change: {e}");
            }
        }
    }

    /// Deactivate everything and flush the cache.
    pub async fn shutdown(&mut self) -> Result<()> {
        let device_ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in &device_ids {
            if let Some(device) = self.devices.get_mut(device_id) {
                if device.is_active() {
                    device.deactivate();
                }
            }
            self.persist(device_id)?;
        }
        self.cache.flush()?;
        info!("device manager shut down");
        Ok(())
    }

    pub fn get_device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn get_device_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        self.devices.get_mut(device_id)
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn paired_count(&self) -> usize {
        self.devices.values().filter(|d| d.is_paired()).count()
    }

    pub fn active_count(&self) -> usize {
        self.devices.values().filter(|d| d.is_active()).count()
    }

    fn emit(&self, device_id: &str, event: DeviceEvent) {
        let _ = self.ctx.events.send((device_id.to_string(), event));
    }

    fn persist(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        let entry = device.to_cache()?;
        self.cache.put(entry);
        self.cache.flush()
    }
}
