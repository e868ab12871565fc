#![warn(missing_docs)]
//! Authoritative replication host.
//!
//! [`ReplicationServer`] is the synchronous session context: connections,
//! bans, entities, wallets and voice. [`MultiplayerHost`] wraps it with the
//! QUIC endpoint, the relay bridge and the tick schedulers.

pub mod multiplayer;
pub mod server;
pub mod settings;

pub use multiplayer::{relay_bridge, MultiplayerHost, RelayBridge, RelayPort, SharedServer};
pub use server::{Admission, BanRecord, ReplicationServer, ServerClient};
pub use settings::{ServerSettings, DEFAULT_PORT};
