//! Connectivity law ascending the gradient of the algebraic connectivity.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use swarmcov_core::{ConnectivityInputs, ConnectivityLaw, Velocity};
use swarmcov_graph::SmoothCutoff;

/// Moves agents along `d(lambda_2)/d(p_i)`, weighted by how close
/// `lambda_2` is to the connectivity floor.
///
/// For a unit Fiedler vector `v`,
/// `d(lambda_2)/d(p_i) = sum_j w'(d_ij) (p_i - p_j) / d_ij * (v_i - v_j)^2`,
/// and the result is scaled by `gain / sinh^2(lambda_2 - epsilon)`, capped at
/// `max_gain` (which also applies at or below the floor).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FiedlerGradientLaw {
    pub gain: f64,
    pub max_gain: f64,
}

impl Default for FiedlerGradientLaw {
    fn default() -> Self {
        Self {
            gain: 1.0,
            max_gain: 1_000.0,
        }
    }
}

impl FiedlerGradientLaw {
    pub const KIND: &'static str = "fiedler-gradient";

    /// Barrier scale applied to the raw gradient.
    #[must_use]
    pub fn scale(&self, fiedler_value: f64, floor: f64) -> f64 {
        let margin = fiedler_value - floor;
        if margin <= 0.0 {
            return self.max_gain;
        }
        let sinh = margin.sinh();
        (self.gain / (sinh * sinh)).min(self.max_gain)
    }
}

impl ConnectivityLaw for FiedlerGradientLaw {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn velocities(&mut self, inputs: &ConnectivityInputs<'_>) -> Vec<Velocity> {
        let count = inputs.positions.len();
        if count < 2 || inputs.graph.len() != count || inputs.fiedler_vector.len() != count {
            return vec![Velocity::zero(); count];
        }
        let scale = self.scale(inputs.fiedler_value, inputs.min_connectivity);
        let radius = inputs.communication_radius;
        let smoothing = inputs.weight_smoothing;
        let vector = inputs.fiedler_vector;

        (0..count)
            .into_par_iter()
            .map(|i| {
                let own = inputs.positions[i];
                let (mut gx, mut gy) = (0.0, 0.0);
                inputs.graph.neighbors(i, &mut |j, distance| {
                    let distance = distance.into_inner();
                    if distance <= 0.0 {
                        return;
                    }
                    let other = inputs.positions[j];
                    let spread = vector[i] - vector[j];
                    let factor = SmoothCutoff::slope(distance, radius, smoothing) * spread * spread
                        / distance;
                    gx += factor * (own.x - other.x);
                    gy += factor * (own.y - other.y);
                });
                Velocity::new(scale * gx, scale * gy)
            })
            .collect()
    }
}
