//! Identifiers used on the wire and in server-side collections.
//!
//! These are intentionally small so they encode cheaply: entity ids fit in a
//! `u16` on the wire, connection ids are server-assigned, and peer ids are the
//! persistent account id handed out by the relay service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u16);

impl EntityId {
    /// Reserved id that never refers to a live entity.
    pub const NULL: Self = Self(0);

    /// Whether this is the reserved null id.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Server-assigned identifier of a connection.
///
/// Never reused during the lifetime of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Persistent peer identity used by relay-backed connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{:016x}", self.0)
    }
}
