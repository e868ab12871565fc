//! Error types surfaced by the networking layer.

use crate::bitstream::DecodeError;
use crate::protocol::ConnectionInitialization;
use thiserror::Error;

/// Errors raised while handling a connection.
#[derive(Debug, Error)]
pub enum NetError {
    /// A message could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),
    /// An initialization step arrived out of order.
    #[error("expected initialization step {expected:?}, received {received:?}")]
    ProtocolOrderViolation {
        /// Step the connection was waiting for.
        expected: ConnectionInitialization,
        /// Step that actually arrived.
        received: ConnectionInitialization,
    },
    /// A peer-relay connection missed its liveness deadline.
    #[error("connection timed out")]
    TransportTimeout,
    /// The remote identity is banned.
    #[error("remote endpoint is banned")]
    Banned,
    /// Data arrived before the connection finished initialization.
    #[error("connection is not active")]
    NotActive,
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors raised while producing or consuming replication events.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The event payload could not be parsed.
    #[error("malformed event: {0}")]
    Malformed(#[from] DecodeError),
    /// The event kind byte is not known to the entity.
    #[error("unknown event kind {kind} for {entity}")]
    UnknownEventKind {
        /// Entity kind name.
        entity: &'static str,
        /// Offending kind byte.
        kind: u8,
    },
    /// The entity does not accept writes from clients.
    #[error("{0} does not accept client writes")]
    ClientWriteRejected(&'static str),
    /// No entity is registered under the id.
    #[error("no entity registered as {0}")]
    UnknownEntity(hullsync_core::EntityId),
}
