//! Small scalar helpers used by quantized replication.

use std::f32::consts::TAU;

/// Wrap an angle in radians into `[0, 2π)`.
pub fn wrap_angle_two_pi(angle: f32) -> f32 {
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Inverse of linear interpolation: where `value` sits between `a` and `b`.
///
/// Returns 0.0 when the range is empty.
pub fn inverse_lerp(a: f32, b: f32, value: f32) -> f32 {
    if (b - a).abs() <= f32::EPSILON {
        return 0.0;
    }
    (value - a) / (b - a)
}
