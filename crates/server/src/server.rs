//! Authoritative replication context.
//!
//! [`ReplicationServer`] owns every registry the replication layer needs:
//! the connection arena, the ban list, replicated entities, wallets and the
//! voice relay. It performs no I/O; transports feed it decoded bytes and
//! drain the per-connection outbound queues it hands out.

use crate::settings::ServerSettings;
use hullsync_core::{ConnectionId, EntityId, SimTick};
use hullsync_net::{
    decode_client_message, decode_client_packet, encode_server_message, ClientMessage,
    ClientInitStep, ClientPacket, ConnectionLifecycle, ConnectionStatus, DecodeError, DeliveryMethod,
    DisconnectPacket, DisconnectReason, EndpointKey, EntityRegistry, EventHint, HandshakePolicy,
    NetError, NetworkConnection, OutboundReceiver, PlayerListEntry, RemoteEndpoint,
    ReplicatedEntity, ReplicationError, ServerInitStep, ServerMessage, ServerPacket, StepOutcome,
    TransportKind, VoiceRelay, Wallet, WalletSyncMessage,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Result of [`ReplicationServer::connect`].
#[derive(Debug)]
pub struct Admission {
    /// Id assigned to the connection.
    pub id: ConnectionId,
    /// Receiving end of the connection's outbound queue.
    pub outbound: OutboundReceiver,
    /// False when the server was full; `outbound` then only carries the
    /// refusal and the connection is not tracked.
    pub accepted: bool,
}

/// Why an endpoint is banned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    /// Player name at the time of the ban.
    pub name: String,
    /// Moderator-supplied reason.
    pub reason: String,
}

/// Server-side state of one client.
#[derive(Debug)]
pub struct ServerClient {
    connection: NetworkConnection,
    lifecycle: ConnectionLifecycle,
    malformed: u32,
    needs_full_sync: bool,
}

impl ServerClient {
    /// Transport connection.
    pub fn connection(&self) -> &NetworkConnection {
        &self.connection
    }

    /// Handshake state.
    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    /// Malformed messages received so far.
    pub fn malformed_count(&self) -> u32 {
        self.malformed
    }

    fn is_active(&self) -> bool {
        self.lifecycle.accepts_traffic()
    }
}

/// The authoritative side of a session.
#[derive(Debug)]
pub struct ReplicationServer {
    settings: ServerSettings,
    policy: HandshakePolicy,
    clients: BTreeMap<ConnectionId, ServerClient>,
    endpoints: HashMap<EndpointKey, ConnectionId>,
    bans: BTreeMap<EndpointKey, BanRecord>,
    entities: EntityRegistry,
    wallets: BTreeMap<Option<EntityId>, Wallet>,
    voice: VoiceRelay,
    tick: SimTick,
    next_connection_id: u32,
}

impl ReplicationServer {
    /// Create an empty session.
    pub fn new(settings: ServerSettings) -> Self {
        let policy = settings.handshake_policy();
        let voice = VoiceRelay::new(settings.voice_buffer_frames, settings.voice_interval());
        Self {
            settings,
            policy,
            clients: BTreeMap::new(),
            endpoints: HashMap::new(),
            bans: BTreeMap::new(),
            entities: EntityRegistry::new(),
            wallets: BTreeMap::new(),
            voice,
            tick: SimTick::ZERO,
            next_connection_id: 0,
        }
    }

    /// Settings the session runs with.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Replication ticks run so far.
    pub fn tick(&self) -> SimTick {
        self.tick
    }

    /// Look up a client.
    pub fn client(&self, id: ConnectionId) -> Option<&ServerClient> {
        self.clients.get(&id)
    }

    /// Tracked clients, pending ones included.
    pub fn clients(&self) -> impl Iterator<Item = &ServerClient> {
        self.clients.values()
    }

    /// Number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of clients past the handshake.
    pub fn active_count(&self) -> usize {
        self.clients.values().filter(|client| client.is_active()).count()
    }

    /// Connection currently owned by `key`.
    pub fn connection_for(&self, key: &EndpointKey) -> Option<ConnectionId> {
        self.endpoints.get(key).copied()
    }

    /// Replicated entities.
    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    /// Replicated entities, for the simulation to mutate and mark dirty.
    pub fn entities_mut(&mut self) -> &mut EntityRegistry {
        &mut self.entities
    }

    /// Wallet of `owner`, created on first use. `None` is the shared bank.
    pub fn wallet(&mut self, owner: Option<EntityId>) -> &Wallet {
        self.wallets.entry(owner).or_insert_with(|| Wallet::new(owner))
    }

    /// Voice relay.
    pub fn voice(&self) -> &VoiceRelay {
        &self.voice
    }

    /// Active bans.
    pub fn bans(&self) -> impl Iterator<Item = (&EndpointKey, &BanRecord)> {
        self.bans.iter()
    }

    /// Admit a new remote endpoint.
    ///
    /// Banned endpoints are refused outright. An endpoint that already owns
    /// a live connection has that connection replaced.
    pub fn connect(&mut self, endpoint: RemoteEndpoint, now: Instant) -> Result<Admission, NetError> {
        let key = endpoint.key();
        if self.is_banned(&key) {
            warn!(%endpoint, "refused banned endpoint");
            return Err(NetError::Banned);
        }

        if let Some(previous) = self.endpoints.get(&key).copied() {
            info!(%endpoint, %previous, "endpoint reconnected, replacing connection");
            self.drop_client(previous, None);
        }

        let id = self.allocate_id();
        let (mut connection, outbound) = NetworkConnection::new(id, endpoint, now);
        connection.set_peer_timeout(self.settings.peer_timeout(), now);

        if self.clients.len() >= self.settings.max_players {
            warn!(%endpoint, max_players = self.settings.max_players, "server full");
            let farewell = ServerPacket::Disconnect(DisconnectPacket::with_reason(DisconnectReason::ServerFull));
            connection.disconnect(Some(&farewell));
            return Ok(Admission {
                id,
                outbound,
                accepted: false,
            });
        }

        // Relay sessions wait for ConnectionStarted before the first request.
        if endpoint.kind() == TransportKind::Socket {
            connection.send_packet(
                &ServerPacket::Initialization(ServerInitStep::AuthInfoAndVersion),
                DeliveryMethod::Reliable,
            )?;
        }

        let lifecycle = ConnectionLifecycle::new(id, endpoint.kind(), &self.policy);
        self.clients.insert(
            id,
            ServerClient {
                connection,
                lifecycle,
                malformed: 0,
                needs_full_sync: false,
            },
        );
        self.endpoints.insert(key, id);
        debug!(conn = %id, %endpoint, "connection admitted");

        Ok(Admission {
            id,
            outbound,
            accepted: true,
        })
    }

    /// Process one inbound packet from `id`.
    ///
    /// Malformed input is counted against the sender and reported as an
    /// error; the server itself never fails.
    pub fn handle_packet(&mut self, id: ConnectionId, bytes: &[u8], now: Instant) -> Result<(), NetError> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Err(NetError::NotActive);
        };
        // Any packet proves liveness, even one that fails to parse.
        client.connection.refresh(now);

        let packet = match decode_client_packet(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                self.flag_malformed(id, &err);
                return Err(err.into());
            }
        };

        match packet {
            ClientPacket::Heartbeat => {
                trace!(conn = %id, "heartbeat");
                client.connection.send_packet(&ServerPacket::Heartbeat, DeliveryMethod::Unreliable)
            }
            ClientPacket::Disconnect(packet) => {
                info!(conn = %id, reason = ?packet.reason, message = %packet.message, "client left");
                self.drop_client(id, None);
                Ok(())
            }
            ClientPacket::Initialization(step) => self.handle_init_step(id, &step),
            ClientPacket::Data(body) => self.handle_data(id, &body),
        }
    }

    fn handle_init_step(&mut self, id: ConnectionId, step: &ClientInitStep) -> Result<(), NetError> {
        let client = self.clients.get_mut(&id).ok_or(NetError::NotActive)?;
        let was_active = client.is_active();

        match client.lifecycle.handle_step(step, &self.policy) {
            StepOutcome::Advanced { reply } => {
                if let Some(reply) = reply {
                    client
                        .connection
                        .send_packet(&ServerPacket::Initialization(reply), DeliveryMethod::Reliable)?;
                }
                if !was_active && client.is_active() {
                    let name = client.lifecycle.player_name().unwrap_or_default().to_string();
                    client.connection.set_name(name);
                    client.connection.mark_connected();
                    client.needs_full_sync = true;
                    self.on_activated(id);
                }
                Ok(())
            }
            StepOutcome::Retry(err) => {
                warn!(conn = %id, retries = client.lifecycle.retries(), error = %err, "handshake reset");
                client.needs_full_sync = false;
                client.connection.mark_pending();
                client.connection.send_packet(
                    &ServerPacket::Initialization(ServerInitStep::AuthInfoAndVersion),
                    DeliveryMethod::Reliable,
                )?;
                if was_active {
                    self.voice.unregister(id);
                    self.broadcast_player_list();
                }
                Err(err)
            }
            StepOutcome::Disconnected(reason) => {
                self.disconnect(id, reason);
                Ok(())
            }
            StepOutcome::Ignored => Ok(()),
        }
    }

    fn on_activated(&mut self, id: ConnectionId) {
        if self.settings.voice_enabled && self.voice.register(id).is_none() {
            warn!(conn = %id, "no free voice queue");
        }

        if let Some(client) = self.clients.get(&id) {
            info!(conn = %id, name = client.connection.name(), "client active");
            for wallet in self.wallets.values() {
                let message = WalletSyncMessage {
                    owner: wallet.owner(),
                    delta: Default::default(),
                    snapshot: wallet.snapshot(),
                };
                let bytes = encode_server_message(&ServerMessage::LedgerSync(message.encode()));
                if let Err(err) = client.connection.send_packet(&ServerPacket::Data(bytes), DeliveryMethod::Reliable) {
                    debug!(conn = %id, error = %err, "ledger snapshot not queued");
                }
            }
        }

        self.broadcast_player_list();
    }

    fn handle_data(&mut self, id: ConnectionId, body: &[u8]) -> Result<(), NetError> {
        let active = self.clients.get(&id).is_some_and(ServerClient::is_active);
        if !active {
            debug!(conn = %id, "data before handshake completed");
            return Err(NetError::NotActive);
        }

        let message = match decode_client_message(body) {
            Ok(message) => message,
            Err(err) => {
                self.flag_malformed(id, &err);
                return Err(err.into());
            }
        };

        match message {
            ClientMessage::EntityEvent { entity, payload } => {
                match self.entities.apply_client(id, entity, &payload) {
                    Ok(()) => Ok(()),
                    Err(ReplicationError::Malformed(err)) => {
                        self.flag_malformed(id, &err);
                        Err(err.into())
                    }
                    Err(err @ ReplicationError::UnknownEventKind { .. }) => {
                        self.flag_malformed(id, &err);
                        Err(DecodeError::Invalid("unknown entity event kind").into())
                    }
                    Err(err) => {
                        debug!(conn = %id, %entity, error = %err, "client entity event dropped");
                        Ok(())
                    }
                }
            }
            ClientMessage::Voice { queue, payload } => {
                if !self.settings.voice_enabled {
                    return Ok(());
                }
                match self.voice.ingest(id, queue, &payload) {
                    Ok(accepted) => {
                        trace!(conn = %id, queue, accepted, "voice upload");
                        Ok(())
                    }
                    Err(err) => {
                        self.flag_malformed(id, &err);
                        Err(err.into())
                    }
                }
            }
        }
    }

    fn flag_malformed(&mut self, id: ConnectionId, err: &dyn fmt::Display) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.malformed += 1;
        warn!(conn = %id, count = client.malformed, error = %err, "malformed payload");
        if client.malformed > self.settings.max_malformed_messages {
            self.disconnect(id, DisconnectReason::MalformedData);
        }
    }

    /// Run one replication tick: produce pending entity events for every
    /// active client and flush wallets on the configured cadence.
    ///
    /// Returns the number of entity events queued.
    #[instrument(skip(self), fields(tick = self.tick.0, clients = self.clients.len()))]
    pub fn replication_tick(&mut self) -> usize {
        let events = self.entities.take_pending();
        let all: Vec<EntityId> = self.entities.ids().collect();
        let mut queued = 0;

        for client in self.clients.values_mut() {
            if !client.is_active() {
                continue;
            }
            if client.needs_full_sync {
                client.needs_full_sync = false;
                for &id in &all {
                    if let Some(entity) = self.entities.get(id) {
                        queued += send_entity_event(&client.connection, id, entity, EventHint::State);
                    }
                }
                continue;
            }
            for event in &events {
                if let Some(entity) = self.entities.get(event.entity) {
                    queued += send_entity_event(&client.connection, event.entity, entity, event.hint);
                }
            }
        }

        self.tick = self.tick.advance(1);
        if self.tick.is_multiple_of(self.settings.ledger_sync_interval_ticks) {
            self.flush_ledgers();
        }
        debug!(events = events.len(), queued, "replication tick");
        queued
    }

    /// Flush every wallet with pending changes to all active clients.
    ///
    /// Returns the number of wallets flushed.
    pub fn flush_ledgers(&mut self) -> usize {
        let mut flushed = 0;
        for wallet in self.wallets.values() {
            let Some(message) = wallet.flush() else {
                continue;
            };
            flushed += 1;
            let packet = ServerPacket::Data(encode_server_message(&ServerMessage::LedgerSync(message.encode())));
            for client in self.clients.values().filter(|client| client.is_active()) {
                if let Err(err) = client.connection.send_packet(&packet, DeliveryMethod::Reliable) {
                    debug!(conn = %client.connection.id(), error = %err, "ledger sync not queued");
                }
            }
        }
        flushed
    }

    /// Relay due voice queues. Returns the number of messages queued.
    pub fn flush_voice(&mut self, now: Instant) -> usize {
        if !self.settings.voice_enabled {
            return 0;
        }
        let recipients: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_active())
            .map(|(&id, _)| id)
            .collect();

        let sends = self.voice.flush(now, &recipients);
        let mut queued = 0;
        for send in sends {
            let Some(client) = self.clients.get(&send.to) else {
                continue;
            };
            let packet = ServerPacket::Data(encode_server_message(&send.message));
            // Voice drops are never retried.
            if client.connection.send_packet(&packet, DeliveryMethod::Unreliable).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Disconnect relay connections past their liveness deadline.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<ConnectionId> {
        let expired: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.connection.is_timed_out(now))
            .map(|(&id, _)| id)
            .collect();
        for &id in &expired {
            warn!(conn = %id, "peer timed out");
            self.disconnect(id, DisconnectReason::Timeout);
        }
        expired
    }

    /// Disconnect `id`, telling it why. Returns false for unknown ids.
    pub fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        self.drop_client(id, Some(DisconnectPacket::with_reason(reason)))
    }

    /// The transport under `id` is gone; forget it without a farewell.
    pub fn connection_lost(&mut self, id: ConnectionId) -> bool {
        self.drop_client(id, None)
    }

    /// Ban the endpoint behind `id` and disconnect it.
    pub fn ban(&mut self, id: ConnectionId, reason: &str) -> bool {
        let Some(mut client) = self.clients.remove(&id) else {
            return false;
        };
        let was_connected = client.connection.status() == ConnectionStatus::Connected;
        let key = client.connection.key();
        self.bans.insert(
            key.host(),
            BanRecord {
                name: client.connection.name().to_string(),
                reason: reason.to_string(),
            },
        );
        client.lifecycle.ban();
        client.connection.ban(Some(&ServerPacket::Disconnect(DisconnectPacket {
            reason: DisconnectReason::Banned,
            message: reason.to_string(),
        })));
        warn!(conn = %id, endpoint = %key, reason, "banned");
        self.forget(id, key, was_connected);
        true
    }

    /// Ban an endpoint that may not be connected. Drops any live connection
    /// from the same host.
    pub fn ban_endpoint(&mut self, key: EndpointKey, name: &str, reason: &str) {
        let host = key.host();
        let live: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.connection.key().host() == host)
            .map(|(&id, _)| id)
            .collect();
        for id in live {
            self.ban(id, reason);
        }
        self.bans.insert(
            host,
            BanRecord {
                name: name.to_string(),
                reason: reason.to_string(),
            },
        );
        info!(endpoint = %host, name, reason, "endpoint banned");
    }

    /// Lift a ban. Returns the removed record.
    pub fn unban(&mut self, key: &EndpointKey) -> Option<BanRecord> {
        let record = self.bans.remove(&key.host());
        if record.is_some() {
            info!(endpoint = %key.host(), "ban lifted");
        }
        record
    }

    /// Whether `key` (any port of its host) is banned.
    pub fn is_banned(&self, key: &EndpointKey) -> bool {
        self.bans.contains_key(&key.host())
    }

    /// Mute or unmute a speaker.
    pub fn set_muted(&mut self, id: ConnectionId, muted: bool) -> bool {
        self.voice.set_muted(id, muted)
    }

    /// Send the current player list to every active client.
    pub fn broadcast_player_list(&self) {
        let entries: Vec<PlayerListEntry> = self
            .clients
            .values()
            .filter(|client| client.is_active())
            .map(|client| PlayerListEntry {
                connection_id: client.connection.id(),
                name: client.connection.name().to_string(),
            })
            .collect();
        let packet = ServerPacket::Data(encode_server_message(&ServerMessage::PlayerList(entries)));
        for client in self.clients.values().filter(|client| client.is_active()) {
            if let Err(err) = client.connection.send_packet(&packet, DeliveryMethod::Reliable) {
                debug!(conn = %client.connection.id(), error = %err, "player list not queued");
            }
        }
    }

    /// Disconnect everyone with `ServerShutdown`.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.clients.keys().copied().collect();
        info!(clients = ids.len(), "shutting down session");
        for id in ids {
            self.disconnect(id, DisconnectReason::ServerShutdown);
        }
    }

    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            self.next_connection_id = self.next_connection_id.wrapping_add(1);
            let id = ConnectionId(self.next_connection_id);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    fn drop_client(&mut self, id: ConnectionId, farewell: Option<DisconnectPacket>) -> bool {
        let Some(mut client) = self.clients.remove(&id) else {
            return false;
        };
        let was_connected = client.connection.status() == ConnectionStatus::Connected;
        let reason = farewell.as_ref().map(|packet| packet.reason);
        client.lifecycle.disconnect();
        client.connection.disconnect(farewell.map(ServerPacket::Disconnect).as_ref());
        info!(conn = %id, ?reason, "client removed");
        self.forget(id, client.connection.key(), was_connected);
        true
    }

    fn forget(&mut self, id: ConnectionId, key: EndpointKey, was_connected: bool) {
        if self.endpoints.get(&key) == Some(&id) {
            self.endpoints.remove(&key);
        }
        self.voice.unregister(id);
        if was_connected {
            self.broadcast_player_list();
        }
    }
}

fn send_entity_event(
    connection: &NetworkConnection,
    id: EntityId,
    entity: &ReplicatedEntity,
    hint: EventHint,
) -> usize {
    let payload = entity.produce(connection.id(), hint);
    let message = encode_server_message(&ServerMessage::EntityEvent { entity: id, payload });
    match connection.send_packet(&ServerPacket::Data(message), entity.delivery()) {
        Ok(()) => 1,
        Err(err) => {
            debug!(conn = %connection.id(), entity = %id, error = %err, "entity event not queued");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;
    use hullsync_core::PeerId;
    use hullsync_net::replication::{DestructibleWall, LevelWalls, PhysicsBodyState, ReplicatedBody};
    use hullsync_net::voice::VoicePayload;
    use hullsync_net::{
        compute_schema_hash, decode_server_message, decode_server_packet, encode_client_message,
        encode_client_packet, password_digest, AuthInfo, ContentPackageList, Delta, LifecycleState,
        WalletChange, PROTOCOL_VERSION,
    };
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn socket(host: u8, port: u16) -> RemoteEndpoint {
        RemoteEndpoint::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, host)), port))
    }

    fn auth(name: &str) -> ClientInitStep {
        ClientInitStep::AuthInfoAndVersion(AuthInfo {
            name: name.to_string(),
            version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            owner_key: None,
        })
    }

    fn content() -> ClientInitStep {
        ClientInitStep::ContentPackageOrder(ContentPackageList::new(vec!["Vanilla".to_string()]))
    }

    fn init(step: ClientInitStep) -> Vec<u8> {
        encode_client_packet(&ClientPacket::Initialization(step))
    }

    fn data(message: &ClientMessage) -> Vec<u8> {
        encode_client_packet(&ClientPacket::Data(encode_client_message(message)))
    }

    fn drain(outbound: &OutboundReceiver) -> Vec<ServerPacket> {
        outbound
            .try_drain()
            .into_iter()
            .map(|packet| decode_server_packet(&packet.bytes).unwrap())
            .collect()
    }

    fn messages(packets: &[ServerPacket]) -> Vec<ServerMessage> {
        packets
            .iter()
            .filter_map(|packet| match packet {
                ServerPacket::Data(body) => Some(decode_server_message(body).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn join(server: &mut ReplicationServer, endpoint: RemoteEndpoint, name: &str, now: Instant) -> (ConnectionId, OutboundReceiver) {
        let admission = server.connect(endpoint, now).unwrap();
        assert!(admission.accepted);
        for step in [auth(name), content(), ClientInitStep::Success] {
            server.handle_packet(admission.id, &init(step), now).unwrap();
        }
        (admission.id, admission.outbound)
    }

    #[test]
    fn test_handshake_activates_client() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let (id, outbound) = join(&mut server, socket(2, 4000), "Diver", now);

        let client = server.client(id).unwrap();
        assert_eq!(client.lifecycle().state(), LifecycleState::Active);
        assert_eq!(client.connection().name(), "Diver");
        assert_eq!(client.connection().status(), ConnectionStatus::Connected);

        let packets = drain(&outbound);
        assert_eq!(packets[0], ServerPacket::Initialization(ServerInitStep::AuthInfoAndVersion));
        assert!(matches!(packets[1], ServerPacket::Initialization(ServerInitStep::ContentPackageOrder(_))));
        assert_eq!(
            packets[2],
            ServerPacket::Initialization(ServerInitStep::Success { connection_id: id })
        );
        let list = messages(&packets);
        assert_eq!(
            list,
            vec![ServerMessage::PlayerList(vec![PlayerListEntry {
                connection_id: id,
                name: "Diver".to_string(),
            }])]
        );
        assert!(server.voice().queue_id(id).is_some());
    }

    #[test]
    fn test_out_of_order_step_resets_and_blocks_traffic() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let admission = server.connect(socket(2, 4000), now).unwrap();
        let id = admission.id;

        let err = server.handle_packet(id, &init(content()), now).unwrap_err();
        assert!(matches!(err, NetError::ProtocolOrderViolation { .. }));
        assert_eq!(server.client(id).unwrap().lifecycle().state(), LifecycleState::Pending);

        let voice = ClientMessage::Voice {
            queue: 0,
            payload: VoicePayload {
                latest_sequence: 1,
                frames: vec![vec![1, 2, 3]],
            }
            .encode(),
        };
        let err = server.handle_packet(id, &data(&voice), now).unwrap_err();
        assert!(matches!(err, NetError::NotActive));
        assert_eq!(server.client(id).unwrap().malformed_count(), 0);
    }

    #[test]
    fn test_too_many_violations_disconnects() {
        let settings = ServerSettings {
            max_init_retries: 1,
            ..ServerSettings::default()
        };
        let mut server = ReplicationServer::new(settings);
        let now = Instant::now();
        let admission = server.connect(socket(2, 4000), now).unwrap();

        let _ = server.handle_packet(admission.id, &init(ClientInitStep::Success), now);
        let _ = server.handle_packet(admission.id, &init(ClientInitStep::Success), now);
        assert!(server.client(admission.id).is_none());

        let last = drain(&admission.outbound).pop().unwrap();
        assert_eq!(
            last,
            ServerPacket::Disconnect(DisconnectPacket::with_reason(DisconnectReason::ProtocolViolation))
        );
    }

    #[test]
    fn test_password_challenge() {
        let settings = ServerSettings {
            password: Some("hunter2".to_string()),
            ..ServerSettings::default()
        };
        let mut server = ReplicationServer::new(settings);
        let now = Instant::now();
        let admission = server.connect(socket(2, 4000), now).unwrap();
        let id = admission.id;

        server.handle_packet(id, &init(auth("Diver")), now).unwrap();
        server.handle_packet(id, &init(content()), now).unwrap();
        let salt = drain(&admission.outbound)
            .into_iter()
            .find_map(|packet| match packet {
                ServerPacket::Initialization(ServerInitStep::Password { salt, attempts_left }) => {
                    assert_eq!(attempts_left, 3);
                    Some(salt)
                }
                _ => None,
            })
            .unwrap();

        let wrong = ClientInitStep::Password {
            digest: password_digest(salt, "hunter3"),
        };
        server.handle_packet(id, &init(wrong), now).unwrap();
        let salt = match drain(&admission.outbound).pop().unwrap() {
            ServerPacket::Initialization(ServerInitStep::Password { salt, attempts_left }) => {
                assert_eq!(attempts_left, 2);
                salt
            }
            other => panic!("expected challenge, got {other:?}"),
        };

        let right = ClientInitStep::Password {
            digest: password_digest(salt, "hunter2"),
        };
        server.handle_packet(id, &init(right), now).unwrap();
        assert_eq!(server.active_count(), 1);
    }

    #[test]
    fn test_malformed_budget() {
        let settings = ServerSettings {
            max_malformed_messages: 2,
            ..ServerSettings::default()
        };
        let mut server = ReplicationServer::new(settings);
        let now = Instant::now();
        let (id, outbound) = join(&mut server, socket(2, 4000), "Diver", now);
        drain(&outbound);

        let garbage = encode_client_packet(&ClientPacket::Data(vec![0xEE]));
        for _ in 0..2 {
            assert!(matches!(
                server.handle_packet(id, &garbage, now),
                Err(NetError::MalformedPayload(_))
            ));
        }
        assert_eq!(server.client(id).unwrap().malformed_count(), 2);

        let _ = server.handle_packet(id, &garbage, now);
        assert!(server.client(id).is_none());
        assert_eq!(
            drain(&outbound).pop().unwrap(),
            ServerPacket::Disconnect(DisconnectPacket::with_reason(DisconnectReason::MalformedData))
        );
    }

    #[test]
    fn test_ban_blocks_host_until_unban() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let (id, outbound) = join(&mut server, socket(2, 4000), "Griefer", now);

        assert!(server.ban(id, "flooding ballast"));
        assert_eq!(server.client_count(), 0);
        match drain(&outbound).pop().unwrap() {
            ServerPacket::Disconnect(packet) => {
                assert_eq!(packet.reason, DisconnectReason::Banned);
                assert_eq!(packet.message, "flooding ballast");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }

        // Another port on the same host is still banned.
        assert!(matches!(server.connect(socket(2, 4001), now), Err(NetError::Banned)));
        let (key, record) = server.bans().next().unwrap();
        assert_eq!(record.name, "Griefer");

        let key = *key;
        assert!(server.unban(&key).is_some());
        assert!(server.connect(socket(2, 4001), now).unwrap().accepted);
    }

    #[test]
    fn test_server_full() {
        let settings = ServerSettings {
            max_players: 1,
            ..ServerSettings::default()
        };
        let mut server = ReplicationServer::new(settings);
        let now = Instant::now();
        let first = server.connect(socket(2, 4000), now).unwrap();
        assert!(first.accepted);

        let second = server.connect(socket(3, 4000), now).unwrap();
        assert!(!second.accepted);
        assert_eq!(server.client_count(), 1);
        assert_eq!(
            drain(&second.outbound),
            vec![ServerPacket::Disconnect(DisconnectPacket::with_reason(DisconnectReason::ServerFull))]
        );
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let endpoint = socket(2, 4000);
        let (old, old_outbound) = join(&mut server, endpoint, "Diver", now);

        let fresh = server.connect(endpoint, now).unwrap();
        assert_ne!(fresh.id, old);
        assert!(server.client(old).is_none());
        assert_eq!(server.connection_for(&endpoint.key()), Some(fresh.id));
        assert!(old_outbound.try_drain().is_empty());
        assert!(server.voice().queue_id(old).is_none());
    }

    #[test]
    fn test_tick_sends_full_state_then_dirty_events() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let walls = server
            .entities_mut()
            .insert(ReplicatedEntity::LevelWalls(LevelWalls::new(vec![
                DestructibleWall::moving(Vec2::ZERO, 100.0),
            ])))
            .unwrap();
        let body = server
            .entities_mut()
            .insert(ReplicatedEntity::PhysicsBody(ReplicatedBody::new(
                Box::new(PhysicsBodyState::default()),
                Default::default(),
            )))
            .unwrap();

        let (_, outbound) = join(&mut server, socket(2, 4000), "Diver", now);
        drain(&outbound);

        // Late joiner: full state of every entity.
        assert_eq!(server.replication_tick(), 2);
        let first = outbound.try_drain();
        assert_eq!(first.len(), 2);

        // Clean tick: only the physics body.
        assert_eq!(server.replication_tick(), 1);
        let packets = drain(&outbound);
        assert_eq!(
            messages(&packets)
                .into_iter()
                .map(|message| match message {
                    ServerMessage::EntityEvent { entity, .. } => entity,
                    other => panic!("unexpected {other:?}"),
                })
                .collect::<Vec<_>>(),
            vec![body]
        );

        server.entities_mut().mark_dirty(walls, EventHint::WallDamaged(0));
        assert_eq!(server.replication_tick(), 2);
        assert_eq!(server.tick(), SimTick(3));
    }

    #[test]
    fn test_voice_relayed_without_echo() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let (speaker, speaker_out) = join(&mut server, socket(2, 4000), "Speaker", now);
        let (_listener, listener_out) = join(&mut server, socket(3, 4000), "Listener", now);
        drain(&speaker_out);
        drain(&listener_out);

        let queue = server.voice().queue_id(speaker).unwrap();
        let upload = ClientMessage::Voice {
            queue,
            payload: VoicePayload {
                latest_sequence: 7,
                frames: vec![vec![9; 40]],
            }
            .encode(),
        };
        server.handle_packet(speaker, &data(&upload), now).unwrap();

        let later = now + Duration::from_millis(100);
        assert_eq!(server.flush_voice(later), 1);
        assert!(speaker_out.try_drain().is_empty());
        let relayed = listener_out.try_drain();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].delivery, DeliveryMethod::Unreliable);
        match messages(&[decode_server_packet(&relayed[0].bytes).unwrap()]).pop().unwrap() {
            ServerMessage::Voice { queue: got, payload } => {
                assert_eq!(got, queue);
                assert_eq!(VoicePayload::decode(&payload).unwrap().latest_sequence, 7);
            }
            other => panic!("expected voice, got {other:?}"),
        }

        // Nothing new: nothing sent.
        assert_eq!(server.flush_voice(later + Duration::from_millis(100)), 0);
    }

    #[test]
    fn test_voice_upload_to_foreign_queue_is_malformed() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let (a, _a_out) = join(&mut server, socket(2, 4000), "A", now);
        let (b, _b_out) = join(&mut server, socket(3, 4000), "B", now);

        let foreign = server.voice().queue_id(b).unwrap();
        let upload = ClientMessage::Voice {
            queue: foreign,
            payload: VoicePayload {
                latest_sequence: 1,
                frames: vec![vec![1]],
            }
            .encode(),
        };
        assert!(matches!(
            server.handle_packet(a, &data(&upload), now),
            Err(NetError::MalformedPayload(_))
        ));
        assert_eq!(server.client(a).unwrap().malformed_count(), 1);
    }

    #[test]
    fn test_ledger_flushes_on_interval() {
        let settings = ServerSettings {
            ledger_sync_interval_ticks: 2,
            ..ServerSettings::default()
        };
        let mut server = ReplicationServer::new(settings);
        let now = Instant::now();
        let (_, outbound) = join(&mut server, socket(2, 4000), "Diver", now);
        drain(&outbound);

        let wallet = server.wallet(None);
        wallet.enqueue(WalletChange::balance(10));
        wallet.enqueue(WalletChange {
            balance: Delta::Set(5),
            reward_distribution: Delta::Set(1),
        });

        server.replication_tick();
        assert!(messages(&drain(&outbound)).is_empty());

        server.replication_tick();
        let synced = messages(&drain(&outbound));
        assert_eq!(synced.len(), 1);
        match &synced[0] {
            ServerMessage::LedgerSync(bytes) => {
                let message = WalletSyncMessage::decode(bytes).unwrap();
                assert_eq!(message.delta.balance, Delta::Set(5));
                assert_eq!(message.delta.reward_distribution, Delta::Set(1));
            }
            other => panic!("expected ledger sync, got {other:?}"),
        }
    }

    #[test]
    fn test_relay_timeout() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let admission = server.connect(RemoteEndpoint::PeerRelay(PeerId(77)), now).unwrap();
        let id = admission.id;

        // Relay sessions open with ConnectionStarted.
        assert!(admission.outbound.try_drain().is_empty());
        server
            .handle_packet(id, &init(ClientInitStep::ConnectionStarted), now)
            .unwrap();

        let heartbeat = encode_client_packet(&ClientPacket::Heartbeat);
        server
            .handle_packet(id, &heartbeat, now + Duration::from_secs(4))
            .unwrap();
        assert!(server.check_timeouts(now + Duration::from_secs(8)).is_empty());

        assert_eq!(server.check_timeouts(now + Duration::from_secs(9)), vec![id]);
        assert!(server.client(id).is_none());
        assert_eq!(
            drain(&admission.outbound).pop().unwrap(),
            ServerPacket::Disconnect(DisconnectPacket::with_reason(DisconnectReason::Timeout))
        );
    }

    #[test]
    fn test_shutdown_notifies_everyone() {
        let mut server = ReplicationServer::new(ServerSettings::default());
        let now = Instant::now();
        let (_, a) = join(&mut server, socket(2, 4000), "A", now);
        let b = server.connect(socket(3, 4000), now).unwrap();

        server.shutdown();
        assert_eq!(server.client_count(), 0);
        let farewell = ServerPacket::Disconnect(DisconnectPacket::with_reason(DisconnectReason::ServerShutdown));
        assert_eq!(drain(&a).pop().unwrap(), farewell);
        assert_eq!(drain(&b.outbound).pop().unwrap(), farewell);
    }
}
