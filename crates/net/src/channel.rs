//! Delivery over QUIC and the relay bridge.
//!
//! Reliable packets travel on unidirectional streams, one stream per packet
//! with a length prefix. Unreliable packets travel as datagrams.

use crate::connection::{OutboundPacket, OutboundReceiver};
use crate::protocol::{DeliveryMethod, MAX_DECOMPRESSED_LEN};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hullsync_core::PeerId;
use quinn::Connection;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Something that can put a framed packet on the wire.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Write one packet with the requested delivery guarantee.
    async fn send_packet(&self, packet: OutboundPacket) -> Result<()>;

    /// Tear down the underlying transport.
    fn close(&self, reason: &str);
}

/// Packet sender/receiver over one QUIC connection.
#[derive(Clone)]
pub struct ChannelManager {
    connection: Connection,
}

impl ChannelManager {
    /// Wrap an established QUIC connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Send a packet on a fresh unidirectional stream.
    pub async fn send_reliable(&self, data: &[u8]) -> Result<()> {
        let mut stream = self
            .connection
            .open_uni()
            .await
            .context("Failed to open unidirectional stream")?;

        let len = data.len() as u32;
        stream
            .write_all(&len.to_le_bytes())
            .await
            .context("Failed to write length prefix")?;
        stream
            .write_all(data)
            .await
            .context("Failed to write packet")?;
        stream.finish().context("Failed to finish stream")?;

        trace!("Sent {} reliable bytes", data.len());
        Ok(())
    }

    /// Send a packet as a datagram.
    ///
    /// Packets that do not fit in a datagram fall back to a stream.
    pub async fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        let fits = self
            .connection
            .max_datagram_size()
            .is_some_and(|max| data.len() <= max);
        if !fits {
            debug!("Datagram of {} bytes too large, sending on stream", data.len());
            return self.send_reliable(data).await;
        }
        self.connection
            .send_datagram(data.to_vec().into())
            .context("Failed to send datagram")?;
        trace!("Sent {} unreliable bytes", data.len());
        Ok(())
    }

    /// Receive the next packet sent on a stream.
    pub async fn recv_reliable(&self) -> Result<Vec<u8>> {
        let mut stream = self
            .connection
            .accept_uni()
            .await
            .context("Failed to accept unidirectional stream")?;

        let mut len_bytes = [0u8; 4];
        stream
            .read_exact(&mut len_bytes)
            .await
            .context("Failed to read length prefix")?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_DECOMPRESSED_LEN {
            anyhow::bail!("Reliable packet of {} bytes exceeds limit", len);
        }

        let mut data = vec![0u8; len];
        stream
            .read_exact(&mut data)
            .await
            .context("Failed to read packet")?;

        trace!("Received {} reliable bytes", data.len());
        Ok(data)
    }

    /// Receive the next datagram.
    pub async fn recv_unreliable(&self) -> Result<Vec<u8>> {
        let datagram = self
            .connection
            .read_datagram()
            .await
            .context("Failed to read datagram")?;
        trace!("Received {} unreliable bytes", datagram.len());
        Ok(datagram.to_vec())
    }

    /// Remote address of the connection.
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }
}

#[async_trait]
impl PacketSink for ChannelManager {
    async fn send_packet(&self, packet: OutboundPacket) -> Result<()> {
        match packet.delivery {
            DeliveryMethod::Reliable => self.send_reliable(&packet.bytes).await,
            DeliveryMethod::Unreliable => self.send_unreliable(&packet.bytes).await,
        }
    }

    fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
    }
}

/// Frame exchanged with the peer-to-peer relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Peer the frame is addressed to (outbound) or came from (inbound).
    pub peer: PeerId,
    /// Encoded peer packet.
    pub bytes: Vec<u8>,
    /// Delivery guarantee the relay should apply.
    pub delivery: DeliveryMethod,
}

/// Sink forwarding packets for one peer into the relay bridge.
#[derive(Debug, Clone)]
pub struct RelaySink {
    peer: PeerId,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

impl RelaySink {
    /// Create a sink for `peer`.
    pub fn new(peer: PeerId, tx: mpsc::UnboundedSender<RelayFrame>) -> Self {
        Self { peer, tx }
    }
}

#[async_trait]
impl PacketSink for RelaySink {
    async fn send_packet(&self, packet: OutboundPacket) -> Result<()> {
        self.tx
            .send(RelayFrame {
                peer: self.peer,
                bytes: packet.bytes,
                delivery: packet.delivery,
            })
            .map_err(|_| anyhow::anyhow!("Relay bridge for {} closed", self.peer))
    }

    fn close(&self, reason: &str) {
        debug!("Relay session {} closed: {}", self.peer, reason);
    }
}

/// Drain a connection's outbound queue into `sink` until the queue closes.
///
/// Unreliable send failures are dropped; a reliable failure ends the pump.
pub async fn pump_outbound<S: PacketSink>(queue: OutboundReceiver, sink: S) {
    while let Some(packet) = queue.recv().await {
        let reliable = packet.delivery.is_reliable();
        if let Err(err) = sink.send_packet(packet).await {
            if reliable {
                warn!("Reliable send failed, stopping pump: {:#}", err);
                break;
            }
            trace!("Dropped unreliable packet: {:#}", err);
        }
    }
    sink.close("connection closed");
}
