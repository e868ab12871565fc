//! Destructible level walls.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::ReplicationError;
use glam::Vec2;
use hullsync_core::math::inverse_lerp;
use std::f32::consts::TAU;

/// Event kind: one wall's damage.
pub const WALL_DAMAGE: u8 = 0;
/// Event kind: positions and move state of every moving wall.
pub const WALL_STATE: u8 = 1;

const UNKNOWN_WALL: u16 = u16::MAX;
const MOVE_STATE_BITS: u32 = 16;

/// One destructible wall.
#[derive(Debug, Clone, PartialEq)]
pub struct DestructibleWall {
    /// World position.
    pub position: Vec2,
    /// Phase of the wall's movement cycle, radians.
    pub move_state: f32,
    /// Accumulated damage.
    pub damage: f32,
    /// Damage at which the wall breaks.
    pub max_health: f32,
    /// Static walls never move and are skipped by state events.
    pub is_static: bool,
}

impl DestructibleWall {
    /// Static wall at `position`.
    pub fn fixed(position: Vec2, max_health: f32) -> Self {
        Self {
            position,
            move_state: 0.0,
            damage: 0.0,
            max_health,
            is_static: true,
        }
    }

    /// Moving wall at `position`.
    pub fn moving(position: Vec2, max_health: f32) -> Self {
        Self {
            is_static: false,
            ..Self::fixed(position, max_health)
        }
    }
}

/// All destructible walls of a level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelWalls {
    walls: Vec<DestructibleWall>,
}

impl LevelWalls {
    /// Wrap the level's walls.
    pub fn new(walls: Vec<DestructibleWall>) -> Self {
        Self { walls }
    }

    /// All walls.
    pub fn walls(&self) -> &[DestructibleWall] {
        &self.walls
    }

    /// Mutable access to one wall.
    pub fn wall_mut(&mut self, index: usize) -> Option<&mut DestructibleWall> {
        self.walls.get_mut(index)
    }

    pub(crate) fn write_damage(&self, writer: &mut BitWriter, index: u16) {
        writer.write_u8(WALL_DAMAGE);
        match self.walls.get(usize::from(index)) {
            Some(wall) if index != UNKNOWN_WALL => {
                writer.write_u16(index);
                let ratio = inverse_lerp(0.0, wall.max_health, wall.damage);
                writer.write_u8((ratio * 255.0).clamp(0.0, 255.0) as u8);
            }
            _ => {
                writer.write_u16(UNKNOWN_WALL);
                writer.write_u8(0);
            }
        }
    }

    pub(crate) fn write_state(&self, writer: &mut BitWriter) {
        writer.write_u8(WALL_STATE);
        for wall in self.walls.iter().filter(|wall| !wall.is_static) {
            writer.write_f32(wall.position.x);
            writer.write_f32(wall.position.y);
            writer.write_ranged_single(wall.move_state.clamp(0.0, TAU), 0.0, TAU, MOVE_STATE_BITS);
        }
        writer.write_pad_bits();
    }

    pub(crate) fn consume(&mut self, reader: &mut BitReader<'_>) -> Result<(), ReplicationError> {
        match reader.read_u8()? {
            WALL_DAMAGE => {
                let index = reader.read_u16()?;
                let damage = reader.read_u8()?;
                if index == UNKNOWN_WALL {
                    return Ok(());
                }
                if let Some(wall) = self.walls.get_mut(usize::from(index)) {
                    wall.damage = f32::from(damage) / 255.0 * wall.max_health;
                }
                Ok(())
            }
            WALL_STATE => {
                let moving = self.walls.iter().filter(|wall| !wall.is_static).count();
                let mut states = Vec::with_capacity(moving);
                for _ in 0..moving {
                    let x = reader.read_f32()?;
                    let y = reader.read_f32()?;
                    let move_state = reader.read_ranged_single(0.0, TAU, MOVE_STATE_BITS)?;
                    states.push((Vec2::new(x, y), move_state));
                }
                reader.read_pad_bits();

                let walls = self.walls.iter_mut().filter(|wall| !wall.is_static);
                for (wall, (position, move_state)) in walls.zip(states) {
                    wall.position = position;
                    wall.move_state = move_state;
                }
                Ok(())
            }
            kind => Err(ReplicationError::UnknownEventKind {
                entity: "LevelWalls",
                kind,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level() -> LevelWalls {
        LevelWalls::new(vec![
            DestructibleWall::fixed(Vec2::new(0.0, 0.0), 100.0),
            DestructibleWall::moving(Vec2::new(10.0, -4.0), 200.0),
            DestructibleWall::moving(Vec2::new(-7.5, 3.0), 50.0),
        ])
    }

    #[test]
    fn test_damage_event() {
        let mut server = level();
        server.wall_mut(1).unwrap().damage = 100.0;

        let mut writer = BitWriter::new();
        server.write_damage(&mut writer, 1);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![WALL_DAMAGE, 1, 0, 127]);

        let mut client = level();
        client.consume(&mut BitReader::new(&bytes)).unwrap();
        let damage = client.walls()[1].damage;
        assert!((damage - 100.0).abs() < 200.0 / 255.0 + 1e-3);
    }

    #[test]
    fn test_damage_unknown_index() {
        let server = level();
        let mut writer = BitWriter::new();
        server.write_damage(&mut writer, 42);
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[1..3], &UNKNOWN_WALL.to_le_bytes());

        let mut client = level();
        client.consume(&mut BitReader::new(&bytes)).unwrap();
        assert_eq!(client, level());
    }

    #[test]
    fn test_state_skips_static_walls() {
        let mut server = level();
        server.wall_mut(0).unwrap().position = Vec2::new(99.0, 99.0);
        server.wall_mut(2).unwrap().position = Vec2::new(1.0, 2.0);
        server.wall_mut(2).unwrap().move_state = 1.5;

        let mut writer = BitWriter::new();
        server.write_state(&mut writer);
        let bytes = writer.into_bytes();
        // Kind byte plus two moving walls of 10 bytes each.
        assert_eq!(bytes.len(), 1 + 2 * 10);

        let mut client = level();
        client.consume(&mut BitReader::new(&bytes)).unwrap();
        assert_eq!(client.walls()[0].position, Vec2::new(0.0, 0.0));
        assert_eq!(client.walls()[2].position, Vec2::new(1.0, 2.0));
        assert!((client.walls()[2].move_state - 1.5).abs() <= TAU / 65535.0);
    }

    #[test]
    fn test_truncated_state_leaves_walls_unchanged() {
        let mut bytes = vec![WALL_STATE];
        bytes.extend_from_slice(&99.0f32.to_le_bytes());
        bytes.extend_from_slice(&77.0f32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);

        let mut client = level();
        let err = client.consume(&mut BitReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, ReplicationError::Malformed(_)));
        assert_eq!(client, level());
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let mut client = level();
        let err = client.consume(&mut BitReader::new(&[9])).unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownEventKind { kind: 9, .. }));
    }
}
