//! Electrical grid state.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::ReplicationError;

/// Upper bound of the replicated voltage range.
pub const MAX_VOLTAGE: f32 = 1000.0;

const VOLTAGE_BITS: u32 = 16;

/// One connected power grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerGrid {
    /// Grid id, stable for the round.
    pub id: u16,
    /// Grid voltage, `[0, MAX_VOLTAGE]`.
    pub voltage: f32,
    /// Power supplied.
    pub power: f32,
    /// Load drawn.
    pub load: f32,
}

/// Every grid on the submarine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerGrids {
    grids: Vec<PowerGrid>,
}

impl PowerGrids {
    /// Wrap a set of grids.
    pub fn new(grids: Vec<PowerGrid>) -> Self {
        Self { grids }
    }

    /// All grids.
    pub fn grids(&self) -> &[PowerGrid] {
        &self.grids
    }

    /// Replace the grid set.
    pub fn set_grids(&mut self, grids: Vec<PowerGrid>) {
        self.grids = grids;
    }

    pub(crate) fn produce(&self, writer: &mut BitWriter) {
        let count = self.grids.len().min(usize::from(u16::MAX));
        writer.write_u16(count as u16);
        for grid in &self.grids[..count] {
            writer.write_u16(grid.id);
            writer.write_ranged_single(grid.voltage.clamp(0.0, MAX_VOLTAGE), 0.0, MAX_VOLTAGE, VOLTAGE_BITS);
            writer.write_f32(grid.power);
            writer.write_f32(grid.load);
        }
    }

    pub(crate) fn consume(&mut self, reader: &mut BitReader<'_>) -> Result<(), ReplicationError> {
        let count = usize::from(reader.read_u16()?);
        // Each grid takes 12 bytes on the wire.
        let mut grids = Vec::with_capacity(count.min(reader.remaining_bits() / 96));
        for _ in 0..count {
            grids.push(PowerGrid {
                id: reader.read_u16()?,
                voltage: reader.read_ranged_single(0.0, MAX_VOLTAGE, VOLTAGE_BITS)?,
                power: reader.read_f32()?,
                load: reader.read_f32()?,
            });
        }
        self.grids = grids;
        Ok(())
    }
}
