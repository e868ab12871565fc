//! Hull structure damage.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::ReplicationError;

/// Event kind: damage of one section.
pub const SECTION_DAMAGE: u8 = 0;
/// Event kind: damage of every section.
pub const ALL_SECTIONS: u8 = 1;

const DAMAGE_BITS: u32 = 8;

/// A wall of the hull split into independently damaged sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    max_health: f32,
    damage: Vec<f32>,
}

impl Structure {
    /// Undamaged structure with `sections` sections.
    pub fn new(sections: usize, max_health: f32) -> Self {
        Self {
            max_health,
            damage: vec![0.0; sections],
        }
    }

    /// Number of sections.
    pub fn section_count(&self) -> usize {
        self.damage.len()
    }

    /// Damage of one section.
    pub fn section_damage(&self, index: usize) -> Option<f32> {
        self.damage.get(index).copied()
    }

    /// Set a section's damage, clamped to `[0, max_health]`.
    pub fn set_damage(&mut self, index: usize, damage: f32) {
        if let Some(section) = self.damage.get_mut(index) {
            *section = damage.clamp(0.0, self.max_health);
        }
    }

    fn ratio(&self, index: usize) -> f32 {
        if self.max_health <= 0.0 {
            return 0.0;
        }
        (self.damage[index] / self.max_health).clamp(0.0, 1.0)
    }

    fn max_index(&self) -> i32 {
        self.damage.len().saturating_sub(1) as i32
    }

    /// Whether `index` names a section.
    pub fn has_section(&self, index: u16) -> bool {
        usize::from(index) < self.damage.len()
    }

    pub(crate) fn write_section(&self, writer: &mut BitWriter, index: u16) {
        let index = usize::from(index);
        writer.write_u8(SECTION_DAMAGE);
        writer.write_ranged_integer(index as i32, 0, self.max_index());
        writer.write_ranged_single(self.ratio(index), 0.0, 1.0, DAMAGE_BITS);
        writer.write_pad_bits();
    }

    pub(crate) fn write_all(&self, writer: &mut BitWriter) {
        writer.write_u8(ALL_SECTIONS);
        for index in 0..self.damage.len() {
            writer.write_ranged_single(self.ratio(index), 0.0, 1.0, DAMAGE_BITS);
        }
        writer.write_pad_bits();
    }

    pub(crate) fn consume(&mut self, reader: &mut BitReader<'_>) -> Result<(), ReplicationError> {
        match reader.read_u8()? {
            SECTION_DAMAGE => {
                let index = reader.read_ranged_integer(0, self.max_index())? as usize;
                let ratio = reader.read_ranged_single(0.0, 1.0, DAMAGE_BITS)?;
                reader.read_pad_bits();
                if let Some(section) = self.damage.get_mut(index) {
                    *section = ratio * self.max_health;
                }
                Ok(())
            }
            ALL_SECTIONS => {
                let mut ratios = Vec::with_capacity(self.damage.len());
                for _ in 0..self.damage.len() {
                    ratios.push(reader.read_ranged_single(0.0, 1.0, DAMAGE_BITS)?);
                }
                reader.read_pad_bits();

                for (section, ratio) in self.damage.iter_mut().zip(ratios) {
                    *section = ratio * self.max_health;
                }
                Ok(())
            }
            kind => Err(ReplicationError::UnknownEventKind {
                entity: "Structure",
                kind,
            }),
        }
    }
}
