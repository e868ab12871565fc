//! Transport-agnostic connection handle.
//!
//! A [`NetworkConnection`] is the server's view of one remote endpoint. It
//! never touches a socket itself: outbound packets go into an ordered queue
//! that a pump task drains into the actual transport (see
//! [`crate::channel::pump_outbound`]).

use crate::codec::{encode_server_packet, ServerPacket};
use crate::error::NetError;
use crate::protocol::{DeliveryMethod, PEER_TIMEOUT};
use hullsync_core::{ConnectionId, PeerId};
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Underlying transport of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Direct socket (QUIC) connection.
    Socket,
    /// Connection tunnelled through a peer-to-peer relay.
    PeerRelay,
}

/// Where a connection's packets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteEndpoint {
    /// Socket address of a direct connection.
    Socket(SocketAddr),
    /// Relay peer identity.
    PeerRelay(PeerId),
}

impl RemoteEndpoint {
    /// Transport kind of this endpoint.
    pub fn kind(&self) -> TransportKind {
        match self {
            RemoteEndpoint::Socket(_) => TransportKind::Socket,
            RemoteEndpoint::PeerRelay(_) => TransportKind::PeerRelay,
        }
    }

    /// Normalized identity used for reconnect dedup and bans.
    pub fn key(&self) -> EndpointKey {
        match self {
            RemoteEndpoint::Socket(addr) => {
                let ip = match addr.ip() {
                    IpAddr::V6(v6) => v6
                        .to_ipv4_mapped()
                        .map(IpAddr::V4)
                        .unwrap_or(IpAddr::V6(v6)),
                    ip => ip,
                };
                EndpointKey::Address(SocketAddr::new(ip, addr.port()))
            }
            RemoteEndpoint::PeerRelay(peer) => EndpointKey::Peer(*peer),
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteEndpoint::Socket(addr) => write!(f, "{addr}"),
            RemoteEndpoint::PeerRelay(peer) => write!(f, "{peer}"),
        }
    }
}

/// Comparable remote identity.
///
/// IPv4-mapped IPv6 addresses collapse to their IPv4 form so the same host
/// compares equal regardless of socket family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKey {
    /// Address and port.
    Address(SocketAddr),
    /// Persistent relay peer id.
    Peer(PeerId),
}

impl EndpointKey {
    /// Same key without the port, used for address bans.
    pub fn host(&self) -> EndpointKey {
        match self {
            EndpointKey::Address(addr) => EndpointKey::Address(SocketAddr::new(addr.ip(), 0)),
            EndpointKey::Peer(peer) => EndpointKey::Peer(*peer),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKey::Address(addr) => write!(f, "{addr}"),
            EndpointKey::Peer(peer) => write!(f, "{peer}"),
        }
    }
}

/// Connection status as seen by the server.
///
/// A banned connection is `Disconnected` with [`NetworkConnection::is_banned`]
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Handshake finished; traffic flows.
    Connected,
    /// Handshake in progress.
    Pending,
    /// Closed. Nothing more is sent.
    Disconnected,
}

/// A framed packet waiting to be written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    /// Encoded peer packet.
    pub bytes: Vec<u8>,
    /// Requested delivery guarantee.
    pub delivery: DeliveryMethod,
}

#[derive(Debug, Default)]
struct QueueState {
    packets: VecDeque<OutboundPacket>,
    closed: bool,
}

#[derive(Debug, Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer half of a connection's ordered outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    shared: Arc<QueueShared>,
}

/// Consumer half of a connection's ordered outbound queue.
#[derive(Debug)]
pub struct OutboundReceiver {
    shared: Arc<QueueShared>,
}

/// Create a connected outbound queue pair.
pub fn outbound_queue() -> (OutboundQueue, OutboundReceiver) {
    let shared = Arc::new(QueueShared::default());
    (
        OutboundQueue {
            shared: shared.clone(),
        },
        OutboundReceiver { shared },
    )
}

impl OutboundQueue {
    /// Append a packet. Fails once the queue is closed.
    pub fn push(&self, packet: OutboundPacket) -> Result<(), NetError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(NetError::NotActive);
            }
            state.packets.push_back(packet);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Drop everything pending, enqueue `last` (if any) and close.
    pub fn close_with(&self, last: Option<OutboundPacket>) -> usize {
        let dropped = {
            let mut state = self.shared.lock();
            let dropped = state.packets.len();
            state.packets.clear();
            if !state.closed {
                state.packets.extend(last);
            }
            state.closed = true;
            dropped
        };
        self.shared.notify.notify_one();
        dropped
    }

    /// Number of packets not yet taken by the receiver.
    pub fn pending(&self) -> usize {
        self.shared.lock().packets.len()
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl OutboundReceiver {
    /// Wait for the next packet. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<OutboundPacket> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if let Some(packet) = state.packets.pop_front() {
                    return Some(packet);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take every packet currently queued without waiting.
    pub fn try_drain(&self) -> Vec<OutboundPacket> {
        self.shared.lock().packets.drain(..).collect()
    }
}

/// Server-side handle for one remote endpoint.
#[derive(Debug)]
pub struct NetworkConnection {
    id: ConnectionId,
    name: String,
    endpoint: RemoteEndpoint,
    status: ConnectionStatus,
    banned: bool,
    outbound: OutboundQueue,
    peer_timeout: Duration,
    deadline: Option<Instant>,
}

impl NetworkConnection {
    /// Create a pending connection and the receiver for its outbound queue.
    pub fn new(id: ConnectionId, endpoint: RemoteEndpoint, now: Instant) -> (Self, OutboundReceiver) {
        let (outbound, receiver) = outbound_queue();
        let deadline = match endpoint.kind() {
            TransportKind::PeerRelay => Some(now + PEER_TIMEOUT),
            TransportKind::Socket => None,
        };
        let connection = Self {
            id,
            name: String::new(),
            endpoint,
            status: ConnectionStatus::Pending,
            banned: false,
            outbound,
            peer_timeout: PEER_TIMEOUT,
            deadline,
        };
        (connection, receiver)
    }

    /// Server-assigned id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Display name announced during the handshake.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Remote endpoint.
    pub fn endpoint(&self) -> RemoteEndpoint {
        self.endpoint
    }

    /// Transport kind.
    pub fn kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    /// Normalized remote identity.
    pub fn key(&self) -> EndpointKey {
        self.endpoint.key()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether the connection was closed by a ban.
    pub fn is_banned(&self) -> bool {
        self.banned
    }

    /// Mark the handshake as finished.
    pub fn mark_connected(&mut self) {
        if self.status == ConnectionStatus::Pending {
            self.status = ConnectionStatus::Connected;
        }
    }

    /// Return to the handshake phase.
    pub fn mark_pending(&mut self) {
        if self.status == ConnectionStatus::Connected {
            self.status = ConnectionStatus::Pending;
        }
    }

    /// Queue raw packet bytes. Never blocks.
    pub fn send(&self, bytes: Vec<u8>, delivery: DeliveryMethod) -> Result<(), NetError> {
        if self.status == ConnectionStatus::Disconnected {
            return Err(NetError::NotActive);
        }
        trace!(conn = %self.id, len = bytes.len(), ?delivery, "queue packet");
        self.outbound.push(OutboundPacket { bytes, delivery })
    }

    /// Encode and queue a server packet.
    pub fn send_packet(&self, packet: &ServerPacket, delivery: DeliveryMethod) -> Result<(), NetError> {
        self.send(encode_server_packet(packet), delivery)
    }

    /// Packets queued but not yet handed to the transport.
    pub fn pending_sends(&self) -> usize {
        self.outbound.pending()
    }

    /// Override the relay liveness bound and restart the deadline.
    pub fn set_peer_timeout(&mut self, timeout: Duration, now: Instant) {
        self.peer_timeout = timeout;
        self.refresh(now);
    }

    /// Extend the liveness deadline of a relay connection.
    pub fn refresh(&mut self, now: Instant) {
        if self.deadline.is_some() {
            self.deadline = Some(now + self.peer_timeout);
        }
    }

    /// Whether a relay connection missed its liveness deadline.
    ///
    /// Socket connections rely on the transport's idle timeout and never
    /// time out here.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.status != ConnectionStatus::Disconnected
            && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Close the connection, dropping pending sends.
    ///
    /// `farewell` is queued after the drop so the remote learns why.
    pub fn disconnect(&mut self, farewell: Option<&ServerPacket>) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        let last = farewell.map(|packet| OutboundPacket {
            bytes: encode_server_packet(packet),
            delivery: DeliveryMethod::Reliable,
        });
        let dropped = self.outbound.close_with(last);
        self.status = ConnectionStatus::Disconnected;
        debug!(conn = %self.id, endpoint = %self.endpoint, dropped, "connection closed");
    }

    /// Close the connection as banned.
    pub fn ban(&mut self, farewell: Option<&ServerPacket>) {
        self.disconnect(farewell);
        self.banned = true;
    }
}
