//! Blending of coverage and connectivity proposals into one command.

use crate::Velocity;
use std::f64::consts::FRAC_PI_2;

/// Rescale `velocity` onto the circle of radius `limit` when it lies outside it.
///
/// Direction is preserved exactly; a zero vector stays zero.
#[must_use]
pub fn saturate(velocity: Velocity, limit: f64) -> Velocity {
    let norm = velocity.norm();
    if norm > limit && norm > 0.0 {
        velocity.scaled(limit / norm)
    } else {
        velocity
    }
}

/// Combine the lateral coverage and connectivity components.
///
/// When adding the connectivity term would flip the sign of the coverage term,
/// the coverage term wins unchanged.
#[must_use]
pub fn compose_lateral(coverage: f64, connectivity: f64) -> f64 {
    if coverage * (connectivity + coverage) < 0.0 {
        coverage
    } else {
        coverage + connectivity
    }
}

/// Heading of a command, taken as `atan(vy / vx)`.
///
/// `vx == 0` maps to `+-pi/2` by the sign of `vy`, and to 0 when both are zero.
#[must_use]
pub fn heading_of(velocity: Velocity) -> f64 {
    if velocity.vx == 0.0 {
        if velocity.vy > 0.0 {
            FRAC_PI_2
        } else if velocity.vy < 0.0 {
            -FRAC_PI_2
        } else {
            0.0
        }
    } else {
        (velocity.vy / velocity.vx).atan()
    }
}
