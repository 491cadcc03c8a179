//! Per-peer transport channel.
//!
//! A connection goes through three shapes. [`DeviceChannel`] is the plain TCP
//! phase: connect, read the peer's identity greeting, send ours.
//! [`SecuredChannel`] is the result of the TLS upgrade. [`ChannelHandle`] is
//! the running phase: a reader task pumping inbound packets to the device's
//! signal queue in strict arrival order and a writer task draining an
//! outbound command queue.
//!
//! The identity greeting is read one byte at a time. Reading through a
//! buffered reader would swallow the first bytes of the TLS handshake that
//! follow the newline on the wire.

use crate::certificate::CertificateInfo;
use crate::device::DeviceSignal;
use crate::identity::DiscoveredDevice;
use crate::packet::{Packet, PACKET_TYPE_IDENTITY};
use crate::transport::tls_config;
use crate::{ProtocolError, Result};
use openssl::ssl::Ssl;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

/// Timeout for TCP connect and the TLS handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the plain identity greeting.
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum size of the plain identity packet (1 MiB).
const MAX_IDENTITY_SIZE: usize = 1024 * 1024;

/// Maximum size of a secured packet (10 MiB).
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

enum ChannelCommand {
    Send(Packet),
    Close,
}

/// Plain TCP channel, before the TLS upgrade.
pub struct DeviceChannel {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl DeviceChannel {
    /// Connect to a peer and read exactly one identity packet from it.
    ///
    /// Fails with [`ProtocolError::IdentityMismatch`] when the peer announces
    /// a different device id than expected.
    pub async fn open(
        host: IpAddr,
        port: u16,
        expected_device_id: &str,
    ) -> Result<(Self, DiscoveredDevice)> {
        let addr = SocketAddr::new(host, port);
        debug!("connecting to {addr}");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;

        let mut channel = Self {
            stream,
            peer_addr: addr,
        };

        let line = channel.read_plain_line().await?;
        let packet = Packet::from_bytes(&line)?;
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let identity = DiscoveredDevice::from_identity_packet(&packet, host)?;
        if identity.device_id != expected_device_id {
            warn!(
                "peer at {addr} announced unexpected device id {}",
                identity.device_id
            );
            return Err(ProtocolError::IdentityMismatch {
                expected: expected_device_id.to_string(),
                actual: identity.device_id,
            });
        }

        debug!("identity confirmed for {} at {addr}", identity.device_id);
        Ok((channel, identity))
    }

    // Byte-by-byte read up to the newline; the bytes after it belong to the
    // TLS handshake and must stay in the kernel buffer.
    async fn read_plain_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match timeout(IDENTITY_TIMEOUT, self.stream.read_exact(&mut byte)).await {
                Ok(Ok(_)) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                    if line.len() > MAX_IDENTITY_SIZE {
                        return Err(ProtocolError::MalformedPacket(
                            "identity packet exceeds maximum size".to_string(),
                        ));
                    }
                }
                Ok(Err(e)) => return Err(ProtocolError::from_io_error(e, "reading identity")),
                Err(_) => {
                    return Err(ProtocolError::Timeout(
                        "waiting for identity packet".to_string(),
                    ))
                }
            }
        }
    }

    /// Send one framed packet over the plain stream.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)?;
        self.stream
            .flush()
            .await
            .map_err(|_| ProtocolError::ChannelClosed)?;
        Ok(())
    }

    /// Upgrade to TLS.
    ///
    /// This core initiated the TCP connection, so it takes the TLS server
    /// role; the accepting peer connects as TLS client. With `expected_cert`
    /// set (a previously paired peer) the presented leaf certificate must
    /// match byte-for-byte; otherwise any self-signed leaf is accepted and
    /// exposed through [`SecuredChannel::peer_certificate`].
    pub async fn secure(
        self,
        local: &CertificateInfo,
        expected_cert: Option<&[u8]>,
    ) -> Result<SecuredChannel> {
        let DeviceChannel { stream, peer_addr } = self;

        let acceptor = tls_config::acceptor(local)?;
        let ssl = Ssl::new(acceptor.context())?;
        let mut tls = SslStream::new(ssl, stream)?;

        timeout(CONNECT_TIMEOUT, Pin::new(&mut tls).accept())
            .await
            .map_err(|_| ProtocolError::Timeout("TLS handshake".to_string()))?
            .map_err(|e| ProtocolError::TlsHandshakeFailed(e.to_string()))?;

        let peer_cert = tls
            .ssl()
            .peer_certificate()
            .ok_or_else(|| {
                ProtocolError::TlsHandshakeFailed("peer presented no certificate".to_string())
            })?
            .to_der()?;

        if let Some(expected) = expected_cert {
            if expected != peer_cert.as_slice() {
                return Err(ProtocolError::CertificatePinningFailed(format!(
                    "peer certificate changed for {peer_addr}"
                )));
            }
        }

        info!("TLS established with {peer_addr}");
        Ok(SecuredChannel {
            stream: tls,
            peer_addr,
            peer_cert,
        })
    }
}

/// TLS channel, ready to start the packet pump.
pub struct SecuredChannel {
    stream: SslStream<TcpStream>,
    peer_addr: SocketAddr,
    peer_cert: Vec<u8>,
}

impl SecuredChannel {
    /// DER encoding of the peer's leaf certificate.
    pub fn peer_certificate(&self) -> &[u8] {
        &self.peer_cert
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Start the packet pump.
    ///
    /// Inbound packets arrive on `signals` tagged with `device_id` in strict
    /// arrival order, followed by exactly one `Closed` when the socket dies.
    /// Malformed lines are dropped with a warning and the channel stays open.
    pub fn start(
        self,
        device_id: String,
        signals: mpsc::UnboundedSender<(String, DeviceSignal)>,
    ) -> ChannelHandle {
        let SecuredChannel {
            stream, peer_addr, ..
        } = self;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ChannelCommand>();
        let (read_half, mut write_half) = tokio::io::split(stream);

        let writer = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ChannelCommand::Send(packet) => {
                        let bytes = match packet.to_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("dropping unserializable packet: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = write_half.write_all(&bytes).await {
                            warn!("write to {peer_addr} failed: {e}");
                            break;
                        }
                        if let Err(e) = write_half.flush().await {
                            warn!("flush to {peer_addr} failed: {e}");
                            break;
                        }
                    }
                    ChannelCommand::Close => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line: Vec<u8> = Vec::new();

            let reason = loop {
                line.clear();
                let mut limited = (&mut reader).take(MAX_PACKET_SIZE as u64 + 1);
                match limited.read_until(b'\n', &mut line).await {
                    Ok(0) => break None,
                    Ok(_) if !line.ends_with(b"\n") => {
                        break Some("oversized or truncated packet".to_string())
                    }
                    Ok(_) => match Packet::from_bytes(&line) {
                        Ok(packet) => {
                            debug!("received '{}' from {peer_addr}", packet.packet_type);
                            if signals
                                .send((device_id.clone(), DeviceSignal::Packet(packet)))
                                .is_err()
                            {
                                break None;
                            }
                        }
                        Err(e) => warn!("dropping malformed packet from {peer_addr}: {e}"),
                    },
                    Err(e) => break Some(e.to_string()),
                }
            };

            let _ = signals.send((device_id, DeviceSignal::Closed { reason }));
        });

        ChannelHandle {
            cmd_tx,
            reader,
            writer,
        }
    }
}

/// Handle to a running channel: queue packets for sending, close it.
pub struct ChannelHandle {
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChannelHandle {
    /// Queue one packet for sending.
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.cmd_tx
            .send(ChannelCommand::Send(packet))
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Shut the channel down; idempotent. Queued packets are flushed before
    /// the socket closes.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Close);
        self.reader.abort();
    }

    /// Whether the writer side is still accepting packets.
    pub fn is_open(&self) -> bool {
        !self.writer.is_finished()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}
