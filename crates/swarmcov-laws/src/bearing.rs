//! Coverage law spreading agents' bearings across the sensing arc.

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use swarmcov_core::{ArcConfig, CoverageInputs, CoverageLaw, Velocity};

/// Steers each covering agent laterally towards a bearing slot chosen by rank.
///
/// Agents are ranked by current bearing and assigned evenly spaced target
/// bearings centred on the arc, no further apart than one agent width. The
/// bearing error is converted into a lateral velocity through the local
/// sensitivity of the bearing to `y` and clamped to `max_speed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BearingSpreadLaw {
    /// Proportional gain on the lateral correction, per second.
    pub gain: f64,
    /// Lateral changes smaller than this keep the previous lateral velocity.
    pub hold_tolerance: f64,
}

impl Default for BearingSpreadLaw {
    fn default() -> Self {
        Self {
            gain: 1.0,
            hold_tolerance: 1e-4,
        }
    }
}

impl BearingSpreadLaw {
    pub const KIND: &'static str = "bearing-spread";

    /// Target bearing for each entry of `bearings`, in input order.
    #[must_use]
    pub fn targets(bearings: &[f64], arc: &ArcConfig) -> Vec<f64> {
        let count = bearings.len();
        if count == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..count).collect();
        order.sort_by_key(|&k| (OrderedFloat(bearings[k]), k));

        let spacing = (arc.span() / count as f64).min(arc.agent_width);
        let centre = (arc.start + arc.end) / 2.0;
        let middle = (count as f64 - 1.0) / 2.0;
        let mut targets = vec![0.0; count];
        for (rank, &k) in order.iter().enumerate() {
            targets[k] = centre + (rank as f64 - middle) * spacing;
        }
        targets
    }

    fn lateral(&self, error: f64, dx: f64, dy: f64, limit: f64) -> f64 {
        if dx.abs() <= f64::EPSILON {
            return 0.0;
        }
        // d(bearing)/dy = -dx / r^2
        let range_sq = dx * dx + dy * dy;
        (-self.gain * error * range_sq / dx).clamp(-limit, limit)
    }
}

impl CoverageLaw for BearingSpreadLaw {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity> {
        let targets = Self::targets(inputs.bearings, inputs.arc);
        let origin = inputs.arc.origin;
        let law = *self;
        (0..inputs.positions.len())
            .into_par_iter()
            .map(|k| {
                let position = inputs.positions[k];
                let error = targets[k] - inputs.bearings[k];
                let mut lateral = law.lateral(
                    error,
                    origin.x - position.x,
                    origin.y - position.y,
                    inputs.max_speed,
                );
                if let Some(&previous) = inputs.lateral_velocities.get(k)
                    && (lateral - previous).abs() < law.hold_tolerance
                {
                    lateral = previous;
                }
                Velocity::new(inputs.max_speed, lateral)
            })
            .collect()
    }
}
