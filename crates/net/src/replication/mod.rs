//! Entity replication.
//!
//! Every replicated entity is one of a closed set of kinds. The server calls
//! [`ReplicatedEntity::produce`] per entity per client and ships the bytes in
//! an `EntityEvent` message; the receiver routes them by entity id to
//! [`ReplicatedEntity::consume`].
//!
//! Reliable kinds only replicate when marked dirty. Physics bodies are
//! unreliable and replicate every tick; each snapshot is authoritative.

pub mod physics;
pub mod power;
pub mod structure;
pub mod walls;

use crate::bitstream::{BitReader, BitWriter};
use crate::error::ReplicationError;
use crate::protocol::DeliveryMethod;
use hullsync_core::{ConnectionId, EntityId};
use std::collections::BTreeMap;
use tracing::trace;

pub use physics::{PhysicsBody, PhysicsBodyState, PhysicsLimits, ReplicatedBody};
pub use power::{PowerGrid, PowerGrids};
pub use structure::Structure;
pub use walls::{DestructibleWall, LevelWalls};

/// Kind of a replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Rigid body snapshot.
    PhysicsBody,
    /// Electrical grids.
    PowerGrid,
    /// Destructible level walls.
    LevelWalls,
    /// Sectioned hull structure.
    Structure,
}

impl EntityKind {
    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::PhysicsBody => "PhysicsBody",
            EntityKind::PowerGrid => "PowerGrid",
            EntityKind::LevelWalls => "LevelWalls",
            EntityKind::Structure => "Structure",
        }
    }
}

/// What changed, so `produce` can pick the smallest event shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventHint {
    /// Send the full state.
    State,
    /// One wall of [`LevelWalls`] changed damage.
    WallDamaged(u16),
    /// One section of a [`Structure`] changed damage.
    SectionDamaged(u16),
}

/// A replicated entity.
#[derive(Debug)]
pub enum ReplicatedEntity {
    /// Rigid body.
    PhysicsBody(ReplicatedBody),
    /// Electrical grids.
    PowerGrid(PowerGrids),
    /// Destructible walls.
    LevelWalls(LevelWalls),
    /// Hull structure.
    Structure(Structure),
}

impl ReplicatedEntity {
    /// Kind of this entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            ReplicatedEntity::PhysicsBody(_) => EntityKind::PhysicsBody,
            ReplicatedEntity::PowerGrid(_) => EntityKind::PowerGrid,
            ReplicatedEntity::LevelWalls(_) => EntityKind::LevelWalls,
            ReplicatedEntity::Structure(_) => EntityKind::Structure,
        }
    }

    /// Delivery method for this entity's events.
    pub fn delivery(&self) -> DeliveryMethod {
        match self {
            ReplicatedEntity::PhysicsBody(_) => DeliveryMethod::Unreliable,
            _ => DeliveryMethod::Reliable,
        }
    }

    /// Encode an event for `client`.
    ///
    /// Hints that do not apply to this kind, or name a missing index,
    /// produce the full state.
    pub fn produce(&self, client: ConnectionId, hint: EventHint) -> Vec<u8> {
        let mut writer = BitWriter::new();
        match (self, hint) {
            (ReplicatedEntity::PhysicsBody(body), _) => body.produce(&mut writer),
            (ReplicatedEntity::PowerGrid(grids), _) => grids.produce(&mut writer),
            (ReplicatedEntity::LevelWalls(walls), EventHint::WallDamaged(index))
                if usize::from(index) < walls.walls().len() =>
            {
                walls.write_damage(&mut writer, index)
            }
            (ReplicatedEntity::LevelWalls(walls), _) => walls.write_state(&mut writer),
            (ReplicatedEntity::Structure(structure), EventHint::SectionDamaged(index))
                if structure.has_section(index) =>
            {
                structure.write_section(&mut writer, index)
            }
            (ReplicatedEntity::Structure(structure), _) => structure.write_all(&mut writer),
        }
        trace!(%client, kind = self.kind().name(), ?hint, len = writer.byte_len(), "produced event");
        writer.into_bytes()
    }

    /// Apply an event produced by the server.
    pub fn consume(&mut self, bytes: &[u8]) -> Result<(), ReplicationError> {
        let mut reader = BitReader::new(bytes);
        match self {
            ReplicatedEntity::PhysicsBody(body) => body.consume(&mut reader)?,
            ReplicatedEntity::PowerGrid(grids) => grids.consume(&mut reader)?,
            ReplicatedEntity::LevelWalls(walls) => walls.consume(&mut reader)?,
            ReplicatedEntity::Structure(structure) => structure.consume(&mut reader)?,
        }
        Ok(())
    }

    /// Whether clients may write events for this entity.
    pub fn accepts_client_writes(&self) -> bool {
        false
    }

    /// Apply an event written by a client.
    pub fn consume_client(&mut self, client: ConnectionId, bytes: &[u8]) -> Result<(), ReplicationError> {
        if !self.accepts_client_writes() {
            return Err(ReplicationError::ClientWriteRejected(self.kind().name()));
        }
        trace!(%client, kind = self.kind().name(), "client event");
        self.consume(bytes)
    }
}

/// Event waiting to be produced for every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    /// Target entity.
    pub entity: EntityId,
    /// What changed.
    pub hint: EventHint,
}

#[derive(Debug)]
struct Slot {
    entity: ReplicatedEntity,
    dirty: Vec<EventHint>,
}

/// Owned collection of replicated entities, with dirty tracking.
///
/// Iteration is in entity id order.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    slots: BTreeMap<EntityId, Slot>,
    next_id: u16,
}

impl EntityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity under a fresh id. `None` when ids are exhausted.
    pub fn insert(&mut self, entity: ReplicatedEntity) -> Option<EntityId> {
        for _ in 0..=u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            let id = EntityId(self.next_id);
            if !id.is_null() && !self.slots.contains_key(&id) {
                self.insert_with_id(id, entity);
                return Some(id);
            }
        }
        None
    }

    /// Register an entity under a known id, replacing any previous one.
    ///
    /// New entities start dirty so late joiners get their state.
    pub fn insert_with_id(&mut self, id: EntityId, entity: ReplicatedEntity) {
        self.slots.insert(
            id,
            Slot {
                entity,
                dirty: vec![EventHint::State],
            },
        );
    }

    /// Remove an entity.
    pub fn remove(&mut self, id: EntityId) -> Option<ReplicatedEntity> {
        self.slots.remove(&id).map(|slot| slot.entity)
    }

    /// Look up an entity.
    pub fn get(&self, id: EntityId) -> Option<&ReplicatedEntity> {
        self.slots.get(&id).map(|slot| &slot.entity)
    }

    /// Look up an entity mutably.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut ReplicatedEntity> {
        self.slots.get_mut(&id).map(|slot| &mut slot.entity)
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.slots.keys().copied()
    }

    /// Queue an event for `id`. Returns false for unknown ids.
    pub fn mark_dirty(&mut self, id: EntityId, hint: EventHint) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        if slot.dirty.contains(&EventHint::State) {
            return true;
        }
        if hint == EventHint::State {
            slot.dirty.clear();
        }
        if !slot.dirty.contains(&hint) {
            slot.dirty.push(hint);
        }
        true
    }

    /// Mark every entity for a full resend.
    pub fn mark_all_dirty(&mut self) {
        for slot in self.slots.values_mut() {
            slot.dirty.clear();
            slot.dirty.push(EventHint::State);
        }
    }

    /// Take this tick's events: every unreliable entity plus queued events
    /// of reliable ones.
    pub fn take_pending(&mut self) -> Vec<PendingEvent> {
        let mut events = Vec::new();
        for (&entity, slot) in self.slots.iter_mut() {
            if slot.entity.delivery() == DeliveryMethod::Unreliable {
                slot.dirty.clear();
                events.push(PendingEvent {
                    entity,
                    hint: EventHint::State,
                });
            } else {
                events.extend(slot.dirty.drain(..).map(|hint| PendingEvent { entity, hint }));
            }
        }
        events
    }

    /// Route a server event to its entity.
    pub fn apply(&mut self, id: EntityId, bytes: &[u8]) -> Result<(), ReplicationError> {
        self.get_mut(id)
            .ok_or(ReplicationError::UnknownEntity(id))?
            .consume(bytes)
    }

    /// Route a client-written event to its entity.
    pub fn apply_client(
        &mut self,
        client: ConnectionId,
        id: EntityId,
        bytes: &[u8],
    ) -> Result<(), ReplicationError> {
        self.get_mut(id)
            .ok_or(ReplicationError::UnknownEntity(id))?
            .consume_client(client, bytes)
    }
}
