//! Packet framing and message encoding.
//!
//! Frame format: `[header flags: u8][initialization step: u8, if flagged][body]`.
//! Data bodies start with a [`ServerPacketHeader`] or [`ClientPacketHeader`]
//! byte and are zstd-compressed when they exceed
//! [`COMPRESSION_THRESHOLD`].

use crate::bitstream::{BitReader, BitWriter, DecodeError};
use crate::protocol::{
    ClientPacketHeader, ConnectionInitialization, DisconnectReason, PacketHeader,
    ServerPacketHeader, COMPRESSION_THRESHOLD, MAX_CONTENT_PACKAGES, MAX_DECOMPRESSED_LEN,
    MAX_DISCONNECT_MESSAGE_LEN, MAX_NAME_LEN, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use blake3::Hash;
use hullsync_core::{ConnectionId, EntityId};
use tracing::warn;

/// Compute schema hash from protocol definitions.
///
/// Client and server refuse each other when their hashes differ.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    hasher.update(PROTOCOL_MAGIC);

    // Message layouts that must agree bit for bit.
    hasher.update(b"PhysicsBodySnapshot");
    hasher.update(b"PowerGridState");
    hasher.update(b"LevelWallEvent");
    hasher.update(b"StructureDamageEvent");
    hasher.update(b"LedgerSyncMessage");
    hasher.update(b"VoicePacket");

    let hash: Hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// Fingerprint of an ordered content package list.
pub fn content_fingerprint<S: AsRef<str>>(packages: &[S]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for package in packages {
        let name = package.as_ref();
        hasher.update(&(name.len() as u32).to_le_bytes());
        hasher.update(name.as_bytes());
    }
    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// Salted password digest sent in response to a password challenge.
pub fn password_digest(salt: u32, password: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&salt.to_le_bytes());
    hasher.update(password.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Identity and build information sent by a joining client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// Display name.
    pub name: String,
    /// Protocol version of the client build.
    pub version: u16,
    /// Schema hash of the client build.
    pub schema_hash: u64,
    /// Key proving the client is the session owner, if it is.
    pub owner_key: Option<u32>,
}

/// Ordered content package list plus its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPackageList {
    /// Package names in load order.
    pub packages: Vec<String>,
    /// [`content_fingerprint`] of `packages`.
    pub fingerprint: u64,
}

impl ContentPackageList {
    /// Build a list and compute its fingerprint.
    pub fn new(packages: Vec<String>) -> Self {
        let fingerprint = content_fingerprint(&packages);
        Self {
            packages,
            fingerprint,
        }
    }
}

/// Initialization step sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInitStep {
    /// Acknowledges the content negotiation when no password is required.
    Success,
    /// Identity and version.
    AuthInfoAndVersion(AuthInfo),
    /// Client's content package list.
    ContentPackageOrder(ContentPackageList),
    /// Salted password digest.
    Password {
        /// [`password_digest`] of the challenge salt and password.
        digest: [u8; 32],
    },
    /// Relay announced an open session.
    ConnectionStarted,
}

impl ClientInitStep {
    /// Wire code of this step.
    pub fn code(&self) -> ConnectionInitialization {
        match self {
            ClientInitStep::Success => ConnectionInitialization::Success,
            ClientInitStep::AuthInfoAndVersion(_) => ConnectionInitialization::AuthInfoAndVersion,
            ClientInitStep::ContentPackageOrder(_) => ConnectionInitialization::ContentPackageOrder,
            ClientInitStep::Password { .. } => ConnectionInitialization::Password,
            ClientInitStep::ConnectionStarted => ConnectionInitialization::ConnectionStarted,
        }
    }
}

/// Initialization step sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInitStep {
    /// Handshake complete; the connection is active.
    Success {
        /// Id assigned to the client.
        connection_id: ConnectionId,
    },
    /// Server requests identity and version.
    AuthInfoAndVersion,
    /// Server's content package list; the client must answer with its own.
    ContentPackageOrder(ContentPackageList),
    /// Password challenge.
    Password {
        /// Salt to mix into the digest.
        salt: u32,
        /// Attempts left before disconnect.
        attempts_left: u8,
    },
}

impl ServerInitStep {
    /// Wire code of this step.
    pub fn code(&self) -> ConnectionInitialization {
        match self {
            ServerInitStep::Success { .. } => ConnectionInitialization::Success,
            ServerInitStep::AuthInfoAndVersion => ConnectionInitialization::AuthInfoAndVersion,
            ServerInitStep::ContentPackageOrder(_) => ConnectionInitialization::ContentPackageOrder,
            ServerInitStep::Password { .. } => ConnectionInitialization::Password,
        }
    }
}

/// Disconnect notification body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    /// Machine-readable reason.
    pub reason: DisconnectReason,
    /// Optional human-readable detail.
    pub message: String,
}

impl DisconnectPacket {
    /// Disconnect with a reason and no message.
    pub fn with_reason(reason: DisconnectReason) -> Self {
        Self {
            reason,
            message: String::new(),
        }
    }
}

/// Packet sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    /// Handshake step.
    Initialization(ClientInitStep),
    /// Data payload (see [`ClientMessage`]).
    Data(Vec<u8>),
    /// Keep-alive.
    Heartbeat,
    /// Client is leaving.
    Disconnect(DisconnectPacket),
}

/// Packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// Handshake step.
    Initialization(ServerInitStep),
    /// Data payload (see [`ServerMessage`]).
    Data(Vec<u8>),
    /// Keep-alive.
    Heartbeat,
    /// Server is dropping the client.
    Disconnect(DisconnectPacket),
}

/// Encode a client packet.
pub fn encode_client_packet(packet: &ClientPacket) -> Vec<u8> {
    match packet {
        ClientPacket::Initialization(step) => {
            let mut writer = BitWriter::new();
            writer.write_u8(PacketHeader::IS_CONNECTION_INITIALIZATION_STEP.bits());
            writer.write_u8(step.code() as u8);
            write_client_step(&mut writer, step);
            writer.into_bytes()
        }
        ClientPacket::Data(payload) => encode_data(PacketHeader::empty(), payload),
        ClientPacket::Heartbeat => vec![PacketHeader::IS_HEARTBEAT_MESSAGE.bits()],
        ClientPacket::Disconnect(packet) => encode_disconnect(PacketHeader::empty(), packet),
    }
}

/// Encode a server packet.
pub fn encode_server_packet(packet: &ServerPacket) -> Vec<u8> {
    let base = PacketHeader::IS_SERVER_MESSAGE;
    match packet {
        ServerPacket::Initialization(step) => {
            let mut writer = BitWriter::new();
            writer.write_u8((base | PacketHeader::IS_CONNECTION_INITIALIZATION_STEP).bits());
            writer.write_u8(step.code() as u8);
            write_server_step(&mut writer, step);
            writer.into_bytes()
        }
        ServerPacket::Data(payload) => encode_data(base, payload),
        ServerPacket::Heartbeat => vec![(base | PacketHeader::IS_HEARTBEAT_MESSAGE).bits()],
        ServerPacket::Disconnect(packet) => encode_disconnect(base, packet),
    }
}

/// Decode a packet sent by a client.
pub fn decode_client_packet(data: &[u8]) -> Result<ClientPacket, DecodeError> {
    let (header, body) = split_frame(data)?;
    if header.is_server_message() {
        return Err(DecodeError::Invalid("server flag set on client packet"));
    }
    let mut reader = BitReader::new(&body);
    if header.is_disconnect_message() {
        return Ok(ClientPacket::Disconnect(read_disconnect(&mut reader)?));
    }
    if header.is_heartbeat_message() {
        return Ok(ClientPacket::Heartbeat);
    }
    if header.is_connection_initialization_step() {
        let code = ConnectionInitialization::try_from(reader.read_u8()?)?;
        return Ok(ClientPacket::Initialization(read_client_step(
            &mut reader,
            code,
        )?));
    }
    Ok(ClientPacket::Data(body))
}

/// Decode a packet sent by the server.
pub fn decode_server_packet(data: &[u8]) -> Result<ServerPacket, DecodeError> {
    let (header, body) = split_frame(data)?;
    if !header.is_server_message() {
        return Err(DecodeError::Invalid("server flag missing on server packet"));
    }
    let mut reader = BitReader::new(&body);
    if header.is_disconnect_message() {
        return Ok(ServerPacket::Disconnect(read_disconnect(&mut reader)?));
    }
    if header.is_heartbeat_message() {
        return Ok(ServerPacket::Heartbeat);
    }
    if header.is_connection_initialization_step() {
        let code = ConnectionInitialization::try_from(reader.read_u8()?)?;
        return Ok(ServerPacket::Initialization(read_server_step(
            &mut reader,
            code,
        )?));
    }
    Ok(ServerPacket::Data(body))
}

fn encode_data(base: PacketHeader, payload: &[u8]) -> Vec<u8> {
    if payload.len() > COMPRESSION_THRESHOLD {
        match zstd::bulk::compress(payload, 3) {
            Ok(compressed) if compressed.len() < payload.len() => {
                let mut frame = Vec::with_capacity(1 + compressed.len());
                frame.push((base | PacketHeader::IS_COMPRESSED).bits());
                frame.extend_from_slice(&compressed);
                return frame;
            }
            Ok(_) => {}
            Err(err) => warn!("Failed to compress {} byte payload: {}", payload.len(), err),
        }
    }
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(base.bits());
    frame.extend_from_slice(payload);
    frame
}

fn encode_disconnect(base: PacketHeader, packet: &DisconnectPacket) -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.write_u8((base | PacketHeader::IS_DISCONNECT_MESSAGE).bits());
    writer.write_u8(packet.reason as u8);
    writer.write_string(truncate_str(&packet.message, MAX_DISCONNECT_MESSAGE_LEN));
    writer.into_bytes()
}

/// Split a frame into its header and (decompressed) body.
fn split_frame(data: &[u8]) -> Result<(PacketHeader, Vec<u8>), DecodeError> {
    let (&first, rest) = data.split_first().ok_or(DecodeError::ReadPastEnd {
        position: 0,
        needed: 8,
        available: 0,
    })?;
    let header = PacketHeader::parse(first)?;
    if header.is_data_fragment() {
        return Err(DecodeError::Invalid("fragmented packets are not supported"));
    }
    let body = if header.is_compressed() {
        zstd::bulk::decompress(rest, MAX_DECOMPRESSED_LEN)
            .map_err(|_| DecodeError::Invalid("corrupt compressed body"))?
    } else {
        rest.to_vec()
    };
    Ok((header, body))
}

fn truncate_str(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn read_bounded_string(
    reader: &mut BitReader<'_>,
    field: &'static str,
    max: usize,
) -> Result<String, DecodeError> {
    let value = reader.read_string()?;
    if value.len() > max {
        return Err(DecodeError::LimitExceeded {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(value)
}

fn read_disconnect(reader: &mut BitReader<'_>) -> Result<DisconnectPacket, DecodeError> {
    let reason = DisconnectReason::try_from(reader.read_u8()?)?;
    let message = read_bounded_string(reader, "disconnect message", MAX_DISCONNECT_MESSAGE_LEN)?;
    Ok(DisconnectPacket { reason, message })
}

fn write_package_list(writer: &mut BitWriter, list: &ContentPackageList) {
    writer.write_var_u32(list.packages.len() as u32);
    for package in &list.packages {
        writer.write_string(package);
    }
    writer.write_u64(list.fingerprint);
}

fn read_package_list(reader: &mut BitReader<'_>) -> Result<ContentPackageList, DecodeError> {
    let count = reader.read_var_u32()? as usize;
    if count > MAX_CONTENT_PACKAGES {
        return Err(DecodeError::LimitExceeded {
            field: "content package list",
            len: count,
            max: MAX_CONTENT_PACKAGES,
        });
    }
    let mut packages = Vec::with_capacity(count);
    for _ in 0..count {
        packages.push(reader.read_string()?);
    }
    let fingerprint = reader.read_u64()?;
    if fingerprint != content_fingerprint(&packages) {
        return Err(DecodeError::Invalid("content fingerprint does not match packages"));
    }
    Ok(ContentPackageList {
        packages,
        fingerprint,
    })
}

fn write_client_step(writer: &mut BitWriter, step: &ClientInitStep) {
    match step {
        ClientInitStep::Success | ClientInitStep::ConnectionStarted => {}
        ClientInitStep::AuthInfoAndVersion(info) => {
            writer.write_string(truncate_str(&info.name, MAX_NAME_LEN));
            writer.write_u16(info.version);
            writer.write_u64(info.schema_hash);
            writer.write_bool(info.owner_key.is_some());
            if let Some(key) = info.owner_key {
                writer.write_u32(key);
            }
            writer.write_pad_bits();
        }
        ClientInitStep::ContentPackageOrder(list) => write_package_list(writer, list),
        ClientInitStep::Password { digest } => writer.write_bytes(digest),
    }
}

fn read_client_step(
    reader: &mut BitReader<'_>,
    code: ConnectionInitialization,
) -> Result<ClientInitStep, DecodeError> {
    Ok(match code {
        ConnectionInitialization::Success => ClientInitStep::Success,
        ConnectionInitialization::ConnectionStarted => ClientInitStep::ConnectionStarted,
        ConnectionInitialization::AuthInfoAndVersion => {
            let name = read_bounded_string(reader, "player name", MAX_NAME_LEN)?;
            let version = reader.read_u16()?;
            let schema_hash = reader.read_u64()?;
            let owner_key = if reader.read_bool()? {
                Some(reader.read_u32()?)
            } else {
                None
            };
            reader.read_pad_bits();
            ClientInitStep::AuthInfoAndVersion(AuthInfo {
                name,
                version,
                schema_hash,
                owner_key,
            })
        }
        ConnectionInitialization::ContentPackageOrder => {
            ClientInitStep::ContentPackageOrder(read_package_list(reader)?)
        }
        ConnectionInitialization::Password => {
            let bytes = reader.read_bytes(32)?;
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&bytes);
            ClientInitStep::Password { digest }
        }
    })
}

fn write_server_step(writer: &mut BitWriter, step: &ServerInitStep) {
    match step {
        ServerInitStep::Success { connection_id } => writer.write_u32(connection_id.0),
        ServerInitStep::AuthInfoAndVersion => {}
        ServerInitStep::ContentPackageOrder(list) => write_package_list(writer, list),
        ServerInitStep::Password {
            salt,
            attempts_left,
        } => {
            writer.write_u32(*salt);
            writer.write_u8(*attempts_left);
        }
    }
}

fn read_server_step(
    reader: &mut BitReader<'_>,
    code: ConnectionInitialization,
) -> Result<ServerInitStep, DecodeError> {
    Ok(match code {
        ConnectionInitialization::Success => ServerInitStep::Success {
            connection_id: ConnectionId(reader.read_u32()?),
        },
        ConnectionInitialization::AuthInfoAndVersion => ServerInitStep::AuthInfoAndVersion,
        ConnectionInitialization::ContentPackageOrder => {
            ServerInitStep::ContentPackageOrder(read_package_list(reader)?)
        }
        ConnectionInitialization::Password => ServerInitStep::Password {
            salt: reader.read_u32()?,
            attempts_left: reader.read_u8()?,
        },
        ConnectionInitialization::ConnectionStarted => {
            return Err(DecodeError::Invalid("server never sends ConnectionStarted"))
        }
    })
}

/// One row of the player list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerListEntry {
    /// Connection id of the player.
    pub connection_id: ConnectionId,
    /// Display name.
    pub name: String,
}

/// Data message sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Replication event for one entity.
    EntityEvent {
        /// Target entity.
        entity: EntityId,
        /// Entity-kind specific bytes.
        payload: Vec<u8>,
    },
    /// Voice frames relayed from one speaker.
    Voice {
        /// Speaker's queue id.
        queue: u8,
        /// Encoded voice payload.
        payload: Vec<u8>,
    },
    /// Ledger delta plus snapshot.
    LedgerSync(Vec<u8>),
    /// Active players.
    PlayerList(Vec<PlayerListEntry>),
}

impl ServerMessage {
    /// Header byte identifying this message.
    pub fn header(&self) -> ServerPacketHeader {
        match self {
            ServerMessage::EntityEvent { .. } => ServerPacketHeader::EntityEvent,
            ServerMessage::Voice { .. } => ServerPacketHeader::Voice,
            ServerMessage::LedgerSync(_) => ServerPacketHeader::LedgerSync,
            ServerMessage::PlayerList(_) => ServerPacketHeader::PlayerList,
        }
    }
}

/// Data message sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Entity event written by the client.
    EntityEvent {
        /// Target entity.
        entity: EntityId,
        /// Entity-kind specific bytes.
        payload: Vec<u8>,
    },
    /// Captured voice frames.
    Voice {
        /// Speaker's own queue id.
        queue: u8,
        /// Encoded voice payload.
        payload: Vec<u8>,
    },
}

/// Encode a server data message body.
pub fn encode_server_message(msg: &ServerMessage) -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.write_u8(msg.header() as u8);
    match msg {
        ServerMessage::EntityEvent { entity, payload } => {
            writer.write_u16(entity.0);
            writer.write_bytes(payload);
        }
        ServerMessage::Voice { queue, payload } => {
            writer.write_u8(*queue);
            writer.write_bytes(payload);
        }
        ServerMessage::LedgerSync(payload) => writer.write_bytes(payload),
        ServerMessage::PlayerList(entries) => {
            writer.write_var_u32(entries.len() as u32);
            for entry in entries {
                writer.write_u32(entry.connection_id.0);
                writer.write_string(truncate_str(&entry.name, MAX_NAME_LEN));
            }
        }
    }
    writer.into_bytes()
}

/// Decode a server data message body.
pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, DecodeError> {
    let mut reader = BitReader::new(data);
    let header = ServerPacketHeader::try_from(reader.read_u8()?)?;
    Ok(match header {
        ServerPacketHeader::EntityEvent => {
            let entity = EntityId(reader.read_u16()?);
            ServerMessage::EntityEvent {
                entity,
                payload: data[3..].to_vec(),
            }
        }
        ServerPacketHeader::Voice => {
            let queue = reader.read_u8()?;
            ServerMessage::Voice {
                queue,
                payload: data[2..].to_vec(),
            }
        }
        ServerPacketHeader::LedgerSync => ServerMessage::LedgerSync(data[1..].to_vec()),
        ServerPacketHeader::PlayerList => {
            let count = reader.read_var_u32()? as usize;
            // Each entry takes at least five bytes.
            if count > data.len() / 5 {
                return Err(DecodeError::LimitExceeded {
                    field: "player list",
                    len: count,
                    max: data.len() / 5,
                });
            }
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let connection_id = ConnectionId(reader.read_u32()?);
                let name = read_bounded_string(&mut reader, "player name", MAX_NAME_LEN)?;
                entries.push(PlayerListEntry {
                    connection_id,
                    name,
                });
            }
            ServerMessage::PlayerList(entries)
        }
    })
}

/// Encode a client data message body.
pub fn encode_client_message(msg: &ClientMessage) -> Vec<u8> {
    let mut writer = BitWriter::new();
    match msg {
        ClientMessage::EntityEvent { entity, payload } => {
            writer.write_u8(ClientPacketHeader::EntityEvent as u8);
            writer.write_u16(entity.0);
            writer.write_bytes(payload);
        }
        ClientMessage::Voice { queue, payload } => {
            writer.write_u8(ClientPacketHeader::Voice as u8);
            writer.write_u8(*queue);
            writer.write_bytes(payload);
        }
    }
    writer.into_bytes()
}

/// Decode a client data message body.
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, DecodeError> {
    let mut reader = BitReader::new(data);
    let header = ClientPacketHeader::try_from(reader.read_u8()?)?;
    Ok(match header {
        ClientPacketHeader::EntityEvent => {
            let entity = EntityId(reader.read_u16()?);
            ClientMessage::EntityEvent {
                entity,
                payload: data[3..].to_vec(),
            }
        }
        ClientPacketHeader::Voice => {
            let queue = reader.read_u8()?;
            ClientMessage::Voice {
                queue,
                payload: data[2..].to_vec(),
            }
        }
    })
}
