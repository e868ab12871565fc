//! Protocol constants and wire-level enumerations.
//!
//! Every byte value defined here is part of the wire format; reordering
//! variants breaks compatibility with existing clients.

use crate::bitstream::DecodeError;
use std::time::Duration;

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 3;

/// Protocol magic bytes mixed into the schema hash.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"HULLSYNC";

/// Largest datagram payload we emit without fragmenting.
pub const MTU: usize = 1200;

/// Data payloads larger than this are compressed before sending.
pub const COMPRESSION_THRESHOLD: usize = 1000;

/// Upper bound on a decompressed payload (bytes).
pub const MAX_DECOMPRESSED_LEN: usize = 1024 * 1024;

/// Maximum length of a player name (bytes).
pub const MAX_NAME_LEN: usize = 32;

/// Maximum number of content packages a client may announce.
pub const MAX_CONTENT_PACKAGES: usize = 128;

/// Maximum length of a disconnect message (bytes).
pub const MAX_DISCONNECT_MESSAGE_LEN: usize = 256;

/// Maximum size of a single encoded voice frame (bytes).
pub const MAX_VOICE_FRAME_LEN: usize = 512;

/// Maximum number of voice frames carried by one voice packet.
pub const MAX_VOICE_FRAMES_PER_PACKET: usize = 8;

/// Liveness bound for peer-relay connections.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

bitflags::bitflags! {
    /// Leading flag byte of every peer packet.
    ///
    /// Several flags may be set at once; always test them individually.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PacketHeader: u8 {
        /// Body is zstd-compressed.
        const IS_COMPRESSED = 0b0000_0001;
        /// Packet carries a connection initialization step.
        const IS_CONNECTION_INITIALIZATION_STEP = 0b0000_0010;
        /// Packet announces a disconnect.
        const IS_DISCONNECT_MESSAGE = 0b0000_0100;
        /// Packet was sent by the server.
        const IS_SERVER_MESSAGE = 0b0000_1000;
        /// Packet is a keep-alive.
        const IS_HEARTBEAT_MESSAGE = 0b0001_0000;
        /// Packet carries one fragment of a larger payload.
        const IS_DATA_FRAGMENT = 0b0010_0000;
    }
}

impl PacketHeader {
    /// Parse a header byte, rejecting unknown flag bits.
    pub fn parse(value: u8) -> Result<Self, DecodeError> {
        Self::from_bits(value).ok_or(DecodeError::UnknownTag {
            field: "packet header",
            value,
        })
    }

    /// Whether the body is compressed.
    pub fn is_compressed(self) -> bool {
        self.contains(Self::IS_COMPRESSED)
    }

    /// Whether the packet is a connection initialization step.
    pub fn is_connection_initialization_step(self) -> bool {
        self.contains(Self::IS_CONNECTION_INITIALIZATION_STEP)
    }

    /// Whether the packet is a disconnect message.
    pub fn is_disconnect_message(self) -> bool {
        self.contains(Self::IS_DISCONNECT_MESSAGE)
    }

    /// Whether the packet originated from the server.
    pub fn is_server_message(self) -> bool {
        self.contains(Self::IS_SERVER_MESSAGE)
    }

    /// Whether the packet is a heartbeat.
    pub fn is_heartbeat_message(self) -> bool {
        self.contains(Self::IS_HEARTBEAT_MESSAGE)
    }

    /// Whether the packet is a data fragment.
    pub fn is_data_fragment(self) -> bool {
        self.contains(Self::IS_DATA_FRAGMENT)
    }
}

/// Connection initialization step codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionInitialization {
    /// Handshake completion.
    Success = 0,
    /// Player identity and build version.
    AuthInfoAndVersion = 1,
    /// Content package list negotiation.
    ContentPackageOrder = 2,
    /// Password challenge/response.
    Password = 3,
    /// Relay session opened (peer-relay only).
    ConnectionStarted = 4,
}

impl TryFrom<u8> for ConnectionInitialization {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::AuthInfoAndVersion),
            2 => Ok(Self::ContentPackageOrder),
            3 => Ok(Self::Password),
            4 => Ok(Self::ConnectionStarted),
            _ => Err(DecodeError::UnknownTag {
                field: "initialization step",
                value,
            }),
        }
    }
}

/// Delivery guarantee requested for an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMethod {
    /// May be dropped or reordered.
    Unreliable = 0,
    /// Retransmitted until acknowledged, delivered in order.
    Reliable = 1,
}

impl DeliveryMethod {
    /// Check if this delivery method is reliable.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::Reliable)
    }
}

impl TryFrom<u8> for DeliveryMethod {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::Reliable),
            _ => Err(DecodeError::UnknownTag {
                field: "delivery method",
                value,
            }),
        }
    }
}

/// First byte of a server data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerPacketHeader {
    /// Entity replication event.
    EntityEvent = 0,
    /// Relayed voice frames.
    Voice = 1,
    /// Ledger delta plus snapshot.
    LedgerSync = 2,
    /// Names and ids of active players.
    PlayerList = 3,
}

impl TryFrom<u8> for ServerPacketHeader {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::EntityEvent),
            1 => Ok(Self::Voice),
            2 => Ok(Self::LedgerSync),
            3 => Ok(Self::PlayerList),
            _ => Err(DecodeError::UnknownTag {
                field: "server packet header",
                value,
            }),
        }
    }
}

/// First byte of a client data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientPacketHeader {
    /// Entity event written by the client.
    EntityEvent = 0,
    /// Captured voice frames.
    Voice = 1,
}

impl TryFrom<u8> for ClientPacketHeader {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::EntityEvent),
            1 => Ok(Self::Voice),
            _ => Err(DecodeError::UnknownTag {
                field: "client packet header",
                value,
            }),
        }
    }
}

/// Reason attached to a disconnect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Orderly disconnect.
    Disconnected = 0,
    /// Identity is banned.
    Banned = 1,
    /// Removed by a moderator.
    Kicked = 2,
    /// Missed the heartbeat deadline.
    Timeout = 3,
    /// Protocol version or schema mismatch.
    InvalidVersion = 4,
    /// Content package fingerprint mismatch.
    ContentMismatch = 5,
    /// Ran out of password attempts.
    WrongPassword = 6,
    /// Too many out-of-order initialization steps.
    ProtocolViolation = 7,
    /// Too many malformed messages.
    MalformedData = 8,
    /// No free player slots.
    ServerFull = 9,
    /// Server is shutting down.
    ServerShutdown = 10,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => Self::Disconnected,
            1 => Self::Banned,
            2 => Self::Kicked,
            3 => Self::Timeout,
            4 => Self::InvalidVersion,
            5 => Self::ContentMismatch,
            6 => Self::WrongPassword,
            7 => Self::ProtocolViolation,
            8 => Self::MalformedData,
            9 => Self::ServerFull,
            10 => Self::ServerShutdown,
            _ => {
                return Err(DecodeError::UnknownTag {
                    field: "disconnect reason",
                    value,
                })
            }
        })
    }
}
