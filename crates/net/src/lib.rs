#![warn(missing_docs)]
//! Replication and transport layer for hullsync.
//!
//! Layers, bottom up: the bit-level wire codec ([`bitstream`]), packet
//! framing ([`codec`]), transport-agnostic connections and QUIC delivery
//! ([`connection`], [`channel`], [`transport`]), the initialization state
//! machine ([`lifecycle`]), and the three payload streams: entity
//! replication, voice and ledger sync.

pub mod bitstream;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod protocol;
pub mod replication;
pub mod transport;
pub mod voice;

pub use bitstream::{BitReader, BitWriter, DecodeError};
pub use channel::{pump_outbound, ChannelManager, PacketSink, RelayFrame, RelaySink};
pub use codec::{
    compute_schema_hash, content_fingerprint, decode_client_message, decode_client_packet,
    decode_server_message, decode_server_packet, encode_client_message, encode_client_packet,
    encode_server_message, encode_server_packet, password_digest, AuthInfo, ClientInitStep,
    ClientMessage, ClientPacket, ContentPackageList, DisconnectPacket, PlayerListEntry,
    ServerInitStep, ServerMessage, ServerPacket,
};
pub use connection::{
    ConnectionStatus, EndpointKey, NetworkConnection, OutboundPacket, OutboundReceiver,
    RemoteEndpoint, TransportKind,
};
pub use error::{NetError, ReplicationError};
pub use ledger::{Delta, Wallet, WalletChange, WalletSnapshot, WalletSyncMessage};
pub use lifecycle::{ConnectionLifecycle, HandshakePolicy, LifecycleState, StepOutcome};
pub use protocol::{
    ConnectionInitialization, DeliveryMethod, DisconnectReason, PacketHeader, PEER_TIMEOUT,
    PROTOCOL_VERSION,
};
pub use replication::{EntityKind, EntityRegistry, EventHint, ReplicatedEntity};
pub use transport::{ClientEndpoint, LinkTimings, ServerEndpoint};
pub use voice::{VoicePayload, VoiceRelay};
