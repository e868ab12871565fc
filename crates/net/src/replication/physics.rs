//! Physics body snapshots.
//!
//! Layout (bit-packed, padded to a byte at the end):
//!
//! | field            | encoding                                    | present when          |
//! |------------------|---------------------------------------------|-----------------------|
//! | position x, y    | f32, f32                                    | always                |
//! | awake            | 1 bit                                       | always                |
//! | fixed rotation   | 1 bit                                       | always                |
//! | rotation         | 8 bits over `[0, 2π]`                       | not fixed rotation    |
//! | linear velocity  | 12 bits per axis over `[-max, max]`         | awake                 |
//! | angular velocity | 8 bits over `[-max_angular, max_angular]`   | awake, not fixed      |

use crate::bitstream::{BitReader, BitWriter, DecodeError};
use glam::Vec2;
use hullsync_core::math::wrap_angle_two_pi;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::fmt;

const ROTATION_BITS: u32 = 8;
const LINEAR_VELOCITY_BITS: u32 = 12;
const ANGULAR_VELOCITY_BITS: u32 = 8;

/// Velocity clamps applied before quantization.
///
/// Both sides must use the same limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsLimits {
    /// Per-axis linear velocity limit.
    pub max_velocity: f32,
    /// Angular velocity limit.
    pub max_angular_velocity: f32,
}

impl Default for PhysicsLimits {
    fn default() -> Self {
        Self {
            max_velocity: 64.0,
            max_angular_velocity: 16.0,
        }
    }
}

/// Observable state of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicsBodyState {
    /// World position.
    pub position: Vec2,
    /// Whether the body is simulated (not sleeping).
    pub awake: bool,
    /// Whether rotation is locked.
    pub fixed_rotation: bool,
    /// Rotation in radians.
    pub rotation: f32,
    /// Linear velocity.
    pub linear_velocity: Vec2,
    /// Angular velocity in radians per second.
    pub angular_velocity: f32,
}

/// The simulation's rigid body, as far as replication cares.
pub trait PhysicsBody: Send + Sync + fmt::Debug {
    /// Read the current state.
    fn snapshot(&self) -> PhysicsBodyState;

    /// Overwrite the state with a decoded snapshot.
    fn apply_snapshot(&mut self, snapshot: &PhysicsBodyState);
}

impl PhysicsBody for PhysicsBodyState {
    fn snapshot(&self) -> PhysicsBodyState {
        *self
    }

    fn apply_snapshot(&mut self, snapshot: &PhysicsBodyState) {
        let rotation = self.rotation;
        *self = *snapshot;
        if snapshot.fixed_rotation {
            self.rotation = rotation;
        }
    }
}

/// Write a snapshot of `state`.
pub fn write_snapshot(writer: &mut BitWriter, state: &PhysicsBodyState, limits: &PhysicsLimits) {
    writer.write_f32(state.position.x);
    writer.write_f32(state.position.y);
    writer.write_bool(state.awake);
    writer.write_bool(state.fixed_rotation);

    if !state.fixed_rotation {
        let rotation = wrap_angle_two_pi(state.rotation);
        writer.write_ranged_single(rotation, 0.0, TAU, ROTATION_BITS);
    }

    if state.awake {
        let max = limits.max_velocity;
        let velocity = state.linear_velocity;
        writer.write_ranged_single(clamp_finite(velocity.x, max), -max, max, LINEAR_VELOCITY_BITS);
        writer.write_ranged_single(clamp_finite(velocity.y, max), -max, max, LINEAR_VELOCITY_BITS);

        if !state.fixed_rotation {
            let max = limits.max_angular_velocity;
            writer.write_ranged_single(
                clamp_finite(state.angular_velocity, max),
                -max,
                max,
                ANGULAR_VELOCITY_BITS,
            );
        }
    }

    writer.write_pad_bits();
}

/// Read a snapshot written by [`write_snapshot`].
///
/// Fields absent from the wire decode as zero.
pub fn read_snapshot(
    reader: &mut BitReader<'_>,
    limits: &PhysicsLimits,
) -> Result<PhysicsBodyState, DecodeError> {
    let x = reader.read_f32()?;
    let y = reader.read_f32()?;
    let awake = reader.read_bool()?;
    let fixed_rotation = reader.read_bool()?;

    let mut state = PhysicsBodyState {
        position: Vec2::new(x, y),
        awake,
        fixed_rotation,
        ..PhysicsBodyState::default()
    };

    if !fixed_rotation {
        let rotation = reader.read_ranged_single(0.0, TAU, ROTATION_BITS)?;
        state.rotation = wrap_angle_two_pi(rotation);
    }

    if awake {
        let max = limits.max_velocity;
        let vx = reader.read_ranged_single(-max, max, LINEAR_VELOCITY_BITS)?;
        let vy = reader.read_ranged_single(-max, max, LINEAR_VELOCITY_BITS)?;
        state.linear_velocity = Vec2::new(vx, vy);

        if !fixed_rotation {
            let max = limits.max_angular_velocity;
            state.angular_velocity = reader.read_ranged_single(-max, max, ANGULAR_VELOCITY_BITS)?;
        }
    }

    reader.read_pad_bits();
    Ok(state)
}

fn clamp_finite(value: f32, max: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-max, max)
    } else {
        0.0
    }
}

/// A replicated body plus the limits used to encode it.
#[derive(Debug)]
pub struct ReplicatedBody {
    body: Box<dyn PhysicsBody>,
    limits: PhysicsLimits,
}

impl ReplicatedBody {
    /// Wrap a simulation body.
    pub fn new(body: Box<dyn PhysicsBody>, limits: PhysicsLimits) -> Self {
        Self { body, limits }
    }

    /// Current state of the wrapped body.
    pub fn state(&self) -> PhysicsBodyState {
        self.body.snapshot()
    }

    /// Mutable access to the wrapped body.
    pub fn body_mut(&mut self) -> &mut dyn PhysicsBody {
        self.body.as_mut()
    }

    pub(crate) fn produce(&self, writer: &mut BitWriter) {
        write_snapshot(writer, &self.body.snapshot(), &self.limits);
    }

    pub(crate) fn consume(&mut self, reader: &mut BitReader<'_>) -> Result<(), DecodeError> {
        let snapshot = read_snapshot(reader, &self.limits)?;
        self.body.apply_snapshot(&snapshot);
        Ok(())
    }
}
