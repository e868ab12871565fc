#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod ids;
pub mod math;

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use ids::{ConnectionId, EntityId, PeerId};

/// Fixed simulation tick (60 TPS by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick of a session.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// True when this tick lands on a multiple of `interval`.
    ///
    /// An interval of zero is treated as "every tick".
    pub fn is_multiple_of(self, interval: u64) -> bool {
        interval == 0 || self.0 % interval == 0
    }
}
