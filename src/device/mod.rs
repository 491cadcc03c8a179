//! Per-peer device state machine.
//!
//! A [`Device`] ties together identity, channel lifecycle, TLS trust, the
//! pairing protocol, capability negotiation, and handler dispatch for one
//! remote peer. Devices are mutated only from the owning
//! [`DeviceManager`](crate::device::DeviceManager)'s execution context: the
//! channel pump and the pair timer never touch the device directly, they
//! enqueue [`DeviceSignal`]s that the manager feeds back through
//! [`Device::handle_signal`]. That single queue is what makes the pairing
//! tie-break deterministic: whichever of "response packet" and "timer fired"
//! is dequeued first wins, and the loser sees stale state and is ignored.
//!
//! Connection lifecycle: `Idle → Connecting → GreetingPlain → Securing →
//! Ready → Disconnecting → Idle`. The orthogonal pairing lifecycle is
//! [`PairState`].

mod events;
mod manager;

pub use events::DeviceEvent;
pub use manager::DeviceManager;

use crate::cache::CacheEntry;
use crate::certificate::{fingerprint, CertificateStore};
use crate::handlers::{CapabilityHandler, HandlerRegistry};
use crate::identity::{dedup_preserving_order, DeviceType, DiscoveredDevice, LocalDevice};
use crate::packet::{Packet, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::transport::{ChannelHandle, DeviceChannel};
use crate::{ProtocolError, Result};
use openssl::x509::X509;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a pairing request waits for the peer's answer.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    GreetingPlain,
    Securing,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    /// A secured session is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// A connection attempt is underway or complete.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::GreetingPlain
                | ConnectionState::Securing
                | ConnectionState::Ready
        )
    }
}

/// Pairing lifecycle, orthogonal to the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    /// We sent a request and the answer timer is armed.
    Requested,
    Paired,
    /// The peer declined or the request timed out.
    Rejected,
}

impl PairState {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairState::Paired)
    }

    pub fn in_progress(&self) -> bool {
        matches!(self, PairState::Requested)
    }
}

/// Inputs serialized onto the manager's single-consumer queue.
#[derive(Debug)]
pub enum DeviceSignal {
    /// A packet arrived on the secured channel.
    Packet(Packet),
    /// The channel died; emitted at most once per session.
    Closed { reason: Option<String> },
    /// The pair timer fired. Stale generations lose against a pair packet
    /// that was dequeued first.
    PairTimeout { generation: u64 },
}

pub type SignalSender = mpsc::UnboundedSender<(String, DeviceSignal)>;
pub type EventSender = mpsc::UnboundedSender<(String, DeviceEvent)>;

/// Tunables for a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub pair_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pair_timeout: PAIR_TIMEOUT,
        }
    }
}

/// Shared context every device is constructed with.
#[derive(Clone)]
pub struct DeviceContext {
    pub local: Arc<LocalDevice>,
    pub certs: Arc<CertificateStore>,
    pub registry: Arc<HandlerRegistry>,
    pub signals: SignalSender,
    pub events: EventSender,
    pub config: DeviceConfig,
}

/// One remote peer.
pub struct Device {
    device_id: String,
    device_name: String,
    device_type: DeviceType,
    protocol_version: u32,
    tcp_port: u16,
    host: IpAddr,

    /// DER encoding of the peer's certificate, once seen or restored.
    certificate: Option<Vec<u8>>,
    certificate_fingerprint: String,
    allowed: bool,

    state: ConnectionState,
    pair_state: PairState,
    pair_deadline: Option<tokio::time::Instant>,
    pair_generation: u64,
    pair_timer: Option<JoinHandle<()>>,

    outgoing_capabilities: Vec<String>,
    incoming_capabilities: Vec<String>,
    handlers: HashMap<String, Box<dyn CapabilityHandler>>,

    link: Option<ChannelHandle>,
    ctx: DeviceContext,
}

impl Device {
    /// Create a device from a discovery record. New devices start idle,
    /// unpaired, and not allowed.
    pub fn from_discovery(descriptor: DiscoveredDevice, ctx: DeviceContext) -> Self {
        Self {
            device_id: descriptor.device_id,
            device_name: descriptor.device_name,
            device_type: descriptor.device_type,
            protocol_version: descriptor.protocol_version,
            tcp_port: descriptor.tcp_port,
            host: descriptor.host,
            certificate: None,
            certificate_fingerprint: String::new(),
            allowed: false,
            state: ConnectionState::Idle,
            pair_state: PairState::Unpaired,
            pair_deadline: None,
            pair_generation: 0,
            pair_timer: None,
            outgoing_capabilities: dedup_preserving_order(descriptor.outgoing_capabilities),
            incoming_capabilities: dedup_preserving_order(descriptor.incoming_capabilities),
            handlers: HashMap::new(),
            link: None,
            ctx,
        }
    }

    /// Restore a device from a cache group.
    pub fn from_cache(entry: &CacheEntry, ctx: DeviceContext) -> Result<Self> {
        let host: IpAddr = entry.last_ip_address.parse().map_err(|_| {
            ProtocolError::CacheLoad(format!(
                "bad lastIPAddress '{}' for {}",
                entry.last_ip_address, entry.device_id
            ))
        })?;

        let (certificate, certificate_fingerprint) = if entry.certificate.is_empty() {
            (None, String::new())
        } else {
            let der = X509::from_pem(entry.certificate.as_bytes())
                .and_then(|cert| cert.to_der())
                .map_err(|e| {
                    ProtocolError::CacheLoad(format!(
                        "bad certificate for {}: {e}",
                        entry.device_id
                    ))
                })?;
            let fp = fingerprint(&der);
            (Some(der), fp)
        };

        Ok(Self {
            device_id: entry.device_id.clone(),
            device_name: entry.device_name.clone(),
            device_type: entry.device_type,
            protocol_version: entry.protocol_version,
            tcp_port: entry.tcp_port,
            host,
            certificate,
            certificate_fingerprint,
            allowed: entry.allowed,
            state: ConnectionState::Idle,
            pair_state: if entry.paired {
                PairState::Paired
            } else {
                PairState::Unpaired
            },
            pair_deadline: None,
            pair_generation: 0,
            pair_timer: None,
            outgoing_capabilities: dedup_preserving_order(entry.outgoing_capabilities.clone()),
            incoming_capabilities: dedup_preserving_order(entry.incoming_capabilities.clone()),
            handlers: HashMap::new(),
            link: None,
            ctx,
        })
    }

    /// Snapshot the persisted attributes for the cache.
    pub fn to_cache(&self) -> Result<CacheEntry> {
        let certificate = match &self.certificate {
            Some(der) => {
                let pem = X509::from_der(der)?.to_pem()?;
                String::from_utf8(pem)
                    .map_err(|e| ProtocolError::CacheLoad(format!("non-UTF-8 PEM: {e}")))?
            }
            None => String::new(),
        };

        Ok(CacheEntry {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            device_type: self.device_type,
            protocol_version: self.protocol_version,
            tcp_port: self.tcp_port,
            last_ip_address: self.host.to_string(),
            allowed: self.allowed,
            paired: self.pair_state.is_paired(),
            certificate,
            outgoing_capabilities: self.outgoing_capabilities.clone(),
            incoming_capabilities: self.incoming_capabilities.clone(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn name(&self) -> &str {
        &self.device_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pair_state(&self) -> PairState {
        self.pair_state
    }

    /// Deadline of the outstanding pairing request, if one is in flight.
    pub fn pair_deadline(&self) -> Option<tokio::time::Instant> {
        self.pair_deadline
    }

    pub fn is_paired(&self) -> bool {
        self.pair_state.is_paired()
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Whether the device currently holds an open channel.
    pub fn is_active(&self) -> bool {
        self.link.is_some()
    }

    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    /// `sha1:<hex>` over the peer certificate, or empty when none is known.
    pub fn certificate_fingerprint(&self) -> &str {
        &self.certificate_fingerprint
    }

    pub fn outgoing_capabilities(&self) -> &[String] {
        &self.outgoing_capabilities
    }

    pub fn incoming_capabilities(&self) -> &[String] {
        &self.incoming_capabilities
    }

    /// Union of outgoing and incoming capabilities, insertion-ordered.
    pub fn effective_capabilities(&self) -> Vec<String> {
        let mut all = self.outgoing_capabilities.clone();
        for cap in &self.incoming_capabilities {
            if !all.contains(cap) {
                all.push(cap.clone());
            }
        }
        all
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.outgoing_capabilities.iter().any(|c| c == capability)
            || self.incoming_capabilities.iter().any(|c| c == capability)
    }

    /// Administrator opt-in to attempt connections and pairing.
    pub fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.ctx.events.send((self.device_id.clone(), event));
    }

    /// Open, greet, and secure a channel to the peer, then start the packet
    /// pump and, when appropriate, request pairing.
    ///
    /// On any failure the device unwinds to `Idle` and emits `Disconnected`;
    /// the manager retries on the next discovery ping.
    pub async fn activate(&mut self) -> Result<()> {
        if self.link.is_some() {
            debug!(device = %self.device_id, "already active");
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(device = %self.device_id, host = %self.host, port = self.tcp_port, "activating");

        let (mut channel, identity) =
            match DeviceChannel::open(self.host, self.tcp_port, &self.device_id).await {
                Ok(opened) => opened,
                Err(e) => return Err(self.fail_activation(e)),
            };

        // The live greeting is authoritative for the protocol version.
        self.protocol_version = identity.protocol_version;

        self.state = ConnectionState::GreetingPlain;
        if let Err(e) = channel.send(&self.ctx.local.identity_packet()).await {
            return Err(self.fail_activation(e));
        }

        self.state = ConnectionState::Securing;
        let pinned = if self.pair_state.is_paired() {
            self.certificate.clone()
        } else {
            None
        };
        let secured = match channel.secure(self.ctx.certs.local(), pinned.as_deref()).await {
            Ok(secured) => secured,
            Err(e) => {
                self.state = ConnectionState::Disconnecting;
                return Err(self.fail_activation(e));
            }
        };

        self.update_certificate(secured.peer_certificate().to_vec());

        self.state = ConnectionState::Ready;
        self.emit(DeviceEvent::Connected);
        self.link = Some(secured.start(self.device_id.clone(), self.ctx.signals.clone()));
        self.maybe_pair();

        info!(device = %self.device_id, fingerprint = %self.certificate_fingerprint, "ready");
        Ok(())
    }

    fn fail_activation(&mut self, error: ProtocolError) -> ProtocolError {
        warn!(device = %self.device_id, "activation failed: {error}");
        self.state = ConnectionState::Idle;
        self.emit(DeviceEvent::Disconnected);
        error
    }

    /// Close the channel and return to `Idle`; idempotent. Any suspended
    /// channel operation fails with `ChannelClosed`.
    pub fn deactivate(&mut self) {
        let Some(link) = self.link.take() else {
            self.state = ConnectionState::Idle;
            return;
        };

        self.state = ConnectionState::Disconnecting;
        link.close();
        self.state = ConnectionState::Idle;
        self.fail_pending_pair();
        self.emit(DeviceEvent::Disconnected);
        info!(device = %self.device_id, "deactivated");
    }

    /// Queue one packet for the peer. Handlers may call this at any time;
    /// while disconnected it fails with `ChannelClosed` and the packet is
    /// dropped by design.
    pub fn send(&self, packet: Packet) -> Result<()> {
        match &self.link {
            Some(link) => link.send(packet),
            None => Err(ProtocolError::ChannelClosed),
        }
    }

    /// Send a pairing request. With `expect_response` the 30-second answer
    /// timer is armed; without it the packet is a bare acknowledgement.
    pub fn pair(&mut self, expect_response: bool) -> Result<()> {
        if self.pair_state.in_progress() {
            warn!(device = %self.device_id, "pairing already in progress");
            return Ok(());
        }
        if self.pair_state.is_paired() {
            debug!(device = %self.device_id, "already paired");
            return Ok(());
        }

        self.send(Packet::pair(true))?;
        info!(device = %self.device_id, "pairing requested");

        if expect_response {
            self.pair_state = PairState::Requested;
            self.arm_pair_timer();
        }
        Ok(())
    }

    /// Drop the pairing and tell the peer. Also forgets the pinned
    /// certificate so the next pairing can present a fresh one.
    pub fn unpair(&mut self) -> Result<()> {
        self.cancel_pair_timer();
        self.pair_state = PairState::Unpaired;
        self.certificate = None;
        self.certificate_fingerprint.clear();

        if self.is_active() {
            self.send(Packet::pair(false))?;
        }
        info!(device = %self.device_id, "unpaired");
        self.emit(DeviceEvent::Paired(false));
        Ok(())
    }

    /// Request pairing automatically when the administrator has allowed the
    /// device and no pairing was settled yet. Does not fire after an
    /// explicit rejection.
    fn maybe_pair(&mut self) {
        if self.allowed && self.pair_state == PairState::Unpaired {
            if let Err(e) = self.pair(true) {
                warn!(device = %self.device_id, "could not request pairing: {e}");
            }
        }
    }

    fn arm_pair_timer(&mut self) {
        self.cancel_pair_timer();
        self.pair_generation += 1;

        let generation = self.pair_generation;
        let timeout_after = self.ctx.config.pair_timeout;
        self.pair_deadline = Some(tokio::time::Instant::now() + timeout_after);

        let signals = self.ctx.signals.clone();
        let device_id = self.device_id.clone();
        self.pair_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout_after).await;
            let _ = signals.send((device_id, DeviceSignal::PairTimeout { generation }));
        }));
    }

    fn cancel_pair_timer(&mut self) {
        if let Some(timer) = self.pair_timer.take() {
            timer.abort();
        }
        self.pair_deadline = None;
    }

    // A disconnect is an exit path from Requested; the timer must not
    // survive it.
    fn fail_pending_pair(&mut self) {
        if self.pair_state.in_progress() {
            self.cancel_pair_timer();
            self.pair_state = PairState::Rejected;
            self.emit(DeviceEvent::Paired(false));
        }
    }

    /// Dispatch one queued signal. Called only from the manager's execution
    /// context; this is where every post-activation state transition runs.
    pub async fn handle_signal(&mut self, signal: DeviceSignal) -> Result<()> {
        match signal {
            DeviceSignal::Packet(packet) => self.handle_packet(packet).await,
            DeviceSignal::Closed { reason } => {
                self.handle_closed(reason);
                Ok(())
            }
            DeviceSignal::PairTimeout { generation } => {
                self.handle_pair_timeout(generation);
                Ok(())
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        if packet.is_type(PACKET_TYPE_PAIR) {
            if self.state != ConnectionState::Ready {
                warn!(device = %self.device_id, state = ?self.state,
                    "pair packet outside the ready state, dropping");
                return Ok(());
            }
            self.handle_pair_packet(&packet);
            return Ok(());
        }

        if packet.is_type(PACKET_TYPE_IDENTITY) {
            debug!(device = %self.device_id, "ignoring in-session identity packet");
            return Ok(());
        }

        if self.state != ConnectionState::Ready {
            warn!(device = %self.device_id, state = ?self.state,
                packet_type = %packet.packet_type, "dropping packet outside the ready state");
            return Ok(());
        }

        if !self.pair_state.is_paired() {
            // The peer talks to us as if paired; it remembers a pairing we
            // lost. Refusing would deadlock the relationship, so adopt it.
            info!(device = %self.device_id, "peer sends application packets while unpaired, adopting pairing");
            self.cancel_pair_timer();
            self.pair_state = PairState::Paired;
            self.emit(DeviceEvent::Paired(true));
        }

        self.dispatch_message(packet).await
    }

    async fn dispatch_message(&mut self, packet: Packet) -> Result<()> {
        self.emit(DeviceEvent::Message(packet.clone()));

        // Taking the handler out of the map frees `self` for the handler's
        // Device::send calls.
        if let Some(mut handler) = self.handlers.remove(&packet.packet_type) {
            if let Err(e) = handler.message(self, &packet).await {
                warn!(device = %self.device_id, packet_type = %packet.packet_type,
                    "handler failed: {e}");
            }
            self.handlers.insert(packet.packet_type.clone(), handler);
        }
        Ok(())
    }

    fn handle_pair_packet(&mut self, packet: &Packet) {
        let Some(pair) = packet.body_field::<bool>("pair") else {
            warn!(device = %self.device_id, "dropping pair packet without a pair field");
            return;
        };

        match (self.pair_state.in_progress(), pair) {
            (true, true) => {
                self.cancel_pair_timer();
                self.pair_state = PairState::Paired;
                info!(device = %self.device_id, "pairing accepted by peer");
                self.emit(DeviceEvent::Paired(true));
            }
            (true, false) => {
                self.cancel_pair_timer();
                self.pair_state = PairState::Rejected;
                info!(device = %self.device_id, "pairing rejected by peer");
                self.emit(DeviceEvent::Paired(false));
            }
            (false, true) => {
                // Peer-initiated pair request: adopt it and acknowledge
                // without arming a timer.
                self.pair_state = PairState::Paired;
                info!(device = %self.device_id, "peer requested pairing, accepting");
                if let Err(e) = self.send(Packet::pair(true)) {
                    warn!(device = %self.device_id, "could not acknowledge pairing: {e}");
                }
                self.emit(DeviceEvent::Paired(true));
            }
            (false, false) => {
                info!(device = %self.device_id, "peer unpaired us");
                self.pair_state = PairState::Unpaired;
                self.certificate = None;
                self.certificate_fingerprint.clear();
                self.emit(DeviceEvent::Paired(false));
            }
        }
    }

    fn handle_pair_timeout(&mut self, generation: u64) {
        if !self.pair_state.in_progress() || generation != self.pair_generation {
            // The response was dequeued first and won the race.
            return;
        }

        warn!(device = %self.device_id, "pairing timed out");
        self.cancel_pair_timer();
        self.pair_state = PairState::Rejected;
        self.emit(DeviceEvent::Paired(false));
    }

    fn handle_closed(&mut self, reason: Option<String>) {
        if self.link.is_none() {
            // Already deactivated; a late pump signal.
            return;
        }

        info!(device = %self.device_id, reason = ?reason, "channel disconnected");
        self.link = None;
        self.state = ConnectionState::Idle;
        self.fail_pending_pair();
        self.emit(DeviceEvent::Disconnected);
    }

    /// Store the peer certificate and recompute its fingerprint.
    ///
    /// For a paired device the pinned handshake already guarantees the cert
    /// is unchanged; replacing a paired cert otherwise requires a fresh pair
    /// handshake, which is the caller's gate.
    pub fn update_certificate(&mut self, der: Vec<u8>) {
        self.certificate_fingerprint = fingerprint(&der);
        self.certificate = Some(der);
    }

    /// Reconcile with a fresh discovery record for the same device id.
    ///
    /// Capability lists are replaced; `CapabilityAdded` fires for every new
    /// effective capability and `CapabilityRemoved` for every dropped one,
    /// in insertion order, and handlers of dropped capabilities are
    /// released. An endpoint change deactivates before the swap so the next
    /// activation uses the new address.
    pub async fn update_from_device(&mut self, other: &DiscoveredDevice) -> Result<()> {
        debug_assert_eq!(self.device_id, other.device_id);

        self.device_name = other.device_name.clone();
        self.device_type = other.device_type;
        self.protocol_version = other.protocol_version;

        let old = self.effective_capabilities();
        self.outgoing_capabilities = dedup_preserving_order(other.outgoing_capabilities.clone());
        self.incoming_capabilities = dedup_preserving_order(other.incoming_capabilities.clone());
        let new = self.effective_capabilities();

        for cap in new.iter().filter(|cap| !old.contains(cap)) {
            self.emit(DeviceEvent::CapabilityAdded(cap.clone()));
        }
        let removed: Vec<String> = old.into_iter().filter(|cap| !new.contains(cap)).collect();
        for cap in &removed {
            self.emit(DeviceEvent::CapabilityRemoved(cap.clone()));
            self.unregister_capability_handler(cap).await?;
        }
        self.sync_handlers().await?;

        if other.host != self.host || other.tcp_port != self.tcp_port {
            if self.is_active() {
                info!(device = %self.device_id, old = %self.host, new = %other.host,
                    "endpoint changed, deactivating");
                self.deactivate();
            }
            self.host = other.host;
            self.tcp_port = other.tcp_port;
        }

        Ok(())
    }

    /// Attach `handler` for `capability` and hand it this device.
    ///
    /// Registering a second handler for the same capability is a contract
    /// violation: it aborts in debug builds and errors otherwise.
    pub async fn register_capability_handler(
        &mut self,
        capability: impl Into<String>,
        mut handler: Box<dyn CapabilityHandler>,
    ) -> Result<()> {
        let capability = capability.into();

        if self.handlers.contains_key(&capability) {
            debug_assert!(false, "duplicate capability handler for {capability}");
            return Err(ProtocolError::Handler(format!(
                "capability {capability} already has a handler on {}",
                self.device_id
            )));
        }
        if !self.has_capability(&capability) {
            warn!(device = %self.device_id, capability = %capability,
                "registering a handler for a capability the peer does not advertise");
        }

        handler.use_device(self).await?;
        debug!(device = %self.device_id, capability = %capability, "handler attached");
        self.handlers.insert(capability, handler);
        Ok(())
    }

    /// Detach the handler for `capability`, if any, releasing it exactly
    /// once.
    pub async fn unregister_capability_handler(&mut self, capability: &str) -> Result<()> {
        if let Some(mut handler) = self.handlers.remove(capability) {
            handler.release_device(self).await?;
            debug!(device = %self.device_id, capability = %capability, "handler released");
        }
        Ok(())
    }

    /// Instantiate handlers from the registry for every effective capability
    /// that does not have one yet.
    pub async fn sync_handlers(&mut self) -> Result<()> {
        for capability in self.effective_capabilities() {
            if self.handlers.contains_key(&capability) {
                continue;
            }
            if let Some(factory) = self.ctx.registry.factory_for(&capability) {
                self.register_capability_handler(capability, factory.create())
                    .await?;
            }
        }
        Ok(())
    }

    /// Release every handler; used when the device is destroyed.
    pub async fn release_all_handlers(&mut self) -> Result<()> {
        let capabilities: Vec<String> = self.handlers.keys().cloned().collect();
        for capability in capabilities {
            self.unregister_capability_handler(&capability).await?;
        }
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cancel_pair_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerFactory;
    use async_trait::async_trait;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        device: Device,
        events: mpsc::UnboundedReceiver<(String, DeviceEvent)>,
        _signals: mpsc::UnboundedReceiver<(String, DeviceSignal)>,
        _tmp: TempDir,
    }

    fn descriptor(outgoing: &[&str], incoming: &[&str]) -> DiscoveredDevice {
        DiscoveredDevice {
            device_id: "peer_device".to_string(),
            device_name: "Peer Phone".to_string(),
            device_type: DeviceType::Phone,
            protocol_version: 7,
            tcp_port: 1714,
            host: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            outgoing_capabilities: outgoing.iter().map(|s| s.to_string()).collect(),
            incoming_capabilities: incoming.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn fixture_with_registry(
        descriptor: DiscoveredDevice,
        registry: HandlerRegistry,
    ) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let certs = Arc::new(CertificateStore::open(tmp.path(), "local_device").unwrap());
        let local = Arc::new(LocalDevice::with_id(
            "local_device",
            "Local",
            DeviceType::Desktop,
            1714,
        ));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let ctx = DeviceContext {
            local,
            certs,
            registry: Arc::new(registry),
            signals: signal_tx,
            events: event_tx,
            config: DeviceConfig::default(),
        };

        Fixture {
            device: Device::from_discovery(descriptor, ctx),
            events: event_rx,
            _signals: signal_rx,
            _tmp: tmp,
        }
    }

    fn fixture(descriptor: DiscoveredDevice) -> Fixture {
        fixture_with_registry(descriptor, HandlerRegistry::new())
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<(String, DeviceEvent)>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[derive(Default)]
    struct Counters {
        used: AtomicUsize,
        released: AtomicUsize,
        messages: AtomicUsize,
    }

    struct CountingHandler {
        capability: String,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl CapabilityHandler for CountingHandler {
        fn packet_type_filter(&self) -> String {
            self.capability.clone()
        }

        async fn use_device(&mut self, _device: &Device) -> Result<()> {
            self.counters.used.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release_device(&mut self, _device: &Device) -> Result<()> {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn message(&mut self, _device: &Device, _packet: &Packet) -> Result<()> {
            self.counters.messages.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        capability: String,
        counters: Arc<Counters>,
    }

    impl HandlerFactory for CountingFactory {
        fn packet_type(&self) -> String {
            self.capability.clone()
        }

        fn create(&self) -> Box<dyn CapabilityHandler> {
            Box::new(CountingHandler {
                capability: self.capability.clone(),
                counters: self.counters.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let f = fixture(descriptor(&["kdeconnect.ping"], &[]));
        assert_eq!(f.device.state(), ConnectionState::Idle);
        assert_eq!(f.device.pair_state(), PairState::Unpaired);
        assert!(!f.device.is_paired());
        assert!(!f.device.is_allowed());
        assert!(!f.device.is_active());
        assert!(f.device.certificate_fingerprint().is_empty());
    }

    #[tokio::test]
    async fn test_capability_delta_signals() {
        let mut f = fixture(descriptor(&["kdeconnect.ping"], &[]));
        drain_events(&mut f.events);

        let updated = descriptor(
            &["kdeconnect.ping", "kdeconnect.battery"],
            &["kdeconnect.battery.request"],
        );
        f.device.update_from_device(&updated).await.unwrap();

        let events = drain_events(&mut f.events);
        let added: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::CapabilityAdded(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        let removed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::CapabilityRemoved(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(added, vec!["kdeconnect.battery", "kdeconnect.battery.request"]);
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_capability_delta_is_exact() {
        // added = B \ A and removed = A \ B, nothing else.
        let mut f = fixture(descriptor(&["kdeconnect.ping", "kdeconnect.mpris"], &[]));
        drain_events(&mut f.events);

        let updated = descriptor(&["kdeconnect.ping", "kdeconnect.battery"], &[]);
        f.device.update_from_device(&updated).await.unwrap();

        let events = drain_events(&mut f.events);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DeviceEvent::CapabilityAdded(c) if c == "kdeconnect.battery"));
        assert!(matches!(&events[1], DeviceEvent::CapabilityRemoved(c) if c == "kdeconnect.mpris"));
    }

    #[tokio::test]
    async fn test_duplicate_capabilities_tolerated() {
        let mut desc = descriptor(&["kdeconnect.ping"], &["kdeconnect.ping"]);
        desc.outgoing_capabilities.push("kdeconnect.ping".to_string());
        let f = fixture(desc);

        assert_eq!(f.device.effective_capabilities(), vec!["kdeconnect.ping"]);
    }

    #[tokio::test]
    async fn test_host_change_while_idle_just_swaps() {
        let mut f = fixture(descriptor(&[], &[]));
        drain_events(&mut f.events);

        let mut updated = descriptor(&[], &[]);
        updated.host = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        f.device.update_from_device(&updated).await.unwrap();

        assert_eq!(f.device.host(), updated.host);
        // Idle device: no Disconnected emitted.
        assert!(drain_events(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_pair_request_adopted() {
        let mut f = fixture(descriptor(&[], &[]));
        f.device.state = ConnectionState::Ready;

        let pair = Packet::pair(true);
        f.device.handle_signal(DeviceSignal::Packet(pair)).await.unwrap();

        assert!(f.device.is_paired());
        assert!(f.device.pair_deadline().is_none());
        let events = drain_events(&mut f.events);
        assert!(matches!(events.as_slice(), [DeviceEvent::Paired(true)]));
    }

    #[tokio::test]
    async fn test_pair_rejection_while_in_progress() {
        let mut f = fixture(descriptor(&[], &[]));
        f.device.state = ConnectionState::Ready;
        f.device.pair_state = PairState::Requested;

        f.device
            .handle_signal(DeviceSignal::Packet(Packet::pair(false)))
            .await
            .unwrap();

        assert_eq!(f.device.pair_state(), PairState::Rejected);
        let events = drain_events(&mut f.events);
        assert!(matches!(events.as_slice(), [DeviceEvent::Paired(false)]));
    }

    #[tokio::test]
    async fn test_remote_unpair_clears_certificate() {
        let mut f = fixture(descriptor(&[], &[]));
        f.device.state = ConnectionState::Ready;
        f.device.pair_state = PairState::Paired;
        f.device.update_certificate(vec![1, 2, 3]);
        assert!(!f.device.certificate_fingerprint().is_empty());

        f.device
            .handle_signal(DeviceSignal::Packet(Packet::pair(false)))
            .await
            .unwrap();

        assert_eq!(f.device.pair_state(), PairState::Unpaired);
        assert!(f.device.certificate().is_none());
        assert!(f.device.certificate_fingerprint().is_empty());
    }

    #[tokio::test]
    async fn test_pair_timeout_settles_rejected() {
        let mut f = fixture(descriptor(&[], &[]));
        f.device.state = ConnectionState::Ready;
        f.device.pair_state = PairState::Requested;
        f.device.pair_generation = 3;

        f.device
            .handle_signal(DeviceSignal::PairTimeout { generation: 3 })
            .await
            .unwrap();

        assert_eq!(f.device.pair_state(), PairState::Rejected);
        let events = drain_events(&mut f.events);
        assert!(matches!(events.as_slice(), [DeviceEvent::Paired(false)]));
    }

    #[tokio::test]
    async fn test_stale_pair_timeout_loses_race() {
        let mut f = fixture(descriptor(&[], &[]));
        f.device.state = ConnectionState::Ready;
        f.device.pair_state = PairState::Requested;
        f.device.pair_generation = 4;

        // The accept was dequeued first...
        f.device
            .handle_signal(DeviceSignal::Packet(Packet::pair(true)))
            .await
            .unwrap();
        assert!(f.device.is_paired());
        drain_events(&mut f.events);

        // ...so the stale timer firing must change nothing.
        f.device
            .handle_signal(DeviceSignal::PairTimeout { generation: 4 })
            .await
            .unwrap();
        assert!(f.device.is_paired());
        assert!(drain_events(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_implicit_pairing_inference() {
        let mut f = fixture(descriptor(&["kdeconnect.battery"], &[]));
        f.device.state = ConnectionState::Ready;

        let battery = Packet::new(
            "kdeconnect.battery",
            json!({"currentCharge": 42, "isCharging": true}),
        );
        f.device
            .handle_signal(DeviceSignal::Packet(battery))
            .await
            .unwrap();

        assert!(f.device.is_paired());
        let events = drain_events(&mut f.events);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DeviceEvent::Paired(true)));
        assert!(
            matches!(&events[1], DeviceEvent::Message(p) if p.packet_type == "kdeconnect.battery")
        );
    }

    #[tokio::test]
    async fn test_pair_packet_outside_ready_dropped() {
        let mut f = fixture(descriptor(&[], &[]));
        // Idle device, e.g. a queued leftover from a torn-down session.
        f.device
            .handle_signal(DeviceSignal::Packet(Packet::pair(true)))
            .await
            .unwrap();

        assert!(!f.device.is_paired());
        assert!(drain_events(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_certificate() {
        let mut f = fixture(descriptor(&[], &[]));
        let cert = crate::certificate::CertificateInfo::generate("peer_device").unwrap();

        f.device.update_certificate(cert.certificate.clone());
        assert_eq!(f.device.certificate_fingerprint(), cert.fingerprint());
        assert_eq!(f.device.certificate_fingerprint().len(), 45);
    }

    #[tokio::test]
    async fn test_cache_roundtrip_preserves_fields() {
        let mut f = fixture(descriptor(&["kdeconnect.ping"], &["kdeconnect.battery"]));
        f.device.set_allowed(true);
        f.device.pair_state = PairState::Paired;
        let cert = crate::certificate::CertificateInfo::generate("peer_device").unwrap();
        f.device.update_certificate(cert.certificate.clone());

        let entry = f.device.to_cache().unwrap();
        assert_eq!(entry.device_id, "peer_device");
        assert!(entry.paired);
        assert!(entry.allowed);
        assert!(entry.certificate.starts_with("-----BEGIN CERTIFICATE-----"));

        let g = fixture(descriptor(&[], &[]));
        let restored = Device::from_cache(&entry, g.device.ctx.clone()).unwrap();
        assert_eq!(restored.device_id(), f.device.device_id());
        assert_eq!(restored.name(), f.device.name());
        assert_eq!(restored.host(), f.device.host());
        assert_eq!(restored.tcp_port(), f.device.tcp_port());
        assert!(restored.is_paired());
        assert!(restored.is_allowed());
        assert_eq!(
            restored.certificate_fingerprint(),
            f.device.certificate_fingerprint()
        );
        assert_eq!(
            restored.effective_capabilities(),
            f.device.effective_capabilities()
        );
    }

    #[tokio::test]
    async fn test_handler_lifecycle_on_capability_removal() {
        let counters = Arc::new(Counters::default());
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(CountingFactory {
                capability: "kdeconnect.battery".to_string(),
                counters: counters.clone(),
            }))
            .unwrap();

        let mut f = fixture_with_registry(descriptor(&["kdeconnect.battery"], &[]), registry);
        f.device.sync_handlers().await.unwrap();
        assert_eq!(counters.used.load(Ordering::SeqCst), 1);
        assert_eq!(f.device.handler_count(), 1);

        // Peer stops advertising the capability: handler released once.
        f.device
            .update_from_device(&descriptor(&[], &[]))
            .await
            .unwrap();
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert_eq!(f.device.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_receives_messages() {
        let counters = Arc::new(Counters::default());
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(CountingFactory {
                capability: "kdeconnect.battery".to_string(),
                counters: counters.clone(),
            }))
            .unwrap();

        let mut f = fixture_with_registry(descriptor(&["kdeconnect.battery"], &[]), registry);
        f.device.sync_handlers().await.unwrap();
        f.device.state = ConnectionState::Ready;
        f.device.pair_state = PairState::Paired;

        let battery = Packet::new("kdeconnect.battery", json!({"currentCharge": 80}));
        f.device
            .handle_signal(DeviceSignal::Packet(battery))
            .await
            .unwrap();

        assert_eq!(counters.messages.load(Ordering::SeqCst), 1);
        // Handler stays registered after dispatch.
        assert_eq!(f.device.handler_count(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate capability handler")]
    async fn test_duplicate_handler_aborts_in_debug() {
        let counters = Arc::new(Counters::default());
        let mut f = fixture(descriptor(&["kdeconnect.battery"], &[]));

        f.device
            .register_capability_handler(
                "kdeconnect.battery",
                Box::new(CountingHandler {
                    capability: "kdeconnect.battery".to_string(),
                    counters: counters.clone(),
                }),
            )
            .await
            .unwrap();

        let _ = f
            .device
            .register_capability_handler(
                "kdeconnect.battery",
                Box::new(CountingHandler {
                    capability: "kdeconnect.battery".to_string(),
                    counters,
                }),
            )
            .await;
    }

    #[tokio::test]
    async fn test_send_while_idle_fails() {
        let f = fixture(descriptor(&[], &[]));
        let result = f.device.send(Packet::new("kdeconnect.ping", json!({})));
        assert!(matches!(result, Err(ProtocolError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_connection_state_predicates() {
        assert!(ConnectionState::Ready.is_connected());
        assert!(!ConnectionState::Securing.is_connected());
        assert!(ConnectionState::Connecting.is_reachable());
        assert!(ConnectionState::Ready.is_reachable());
        assert!(!ConnectionState::Idle.is_reachable());
        assert!(!ConnectionState::Disconnecting.is_reachable());
    }
}
