//! Communication graph construction for formation connectivity analysis.

use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by graph builders.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    /// Indicates configuration values that cannot be used (e.g., non-positive radius).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A position fed to the builder was NaN or infinite.
    #[error("position {index} is not finite")]
    NonFinitePosition { index: usize },
}

/// Weighted, undirected communication graph over a set of positions.
///
/// All three matrices are `n x n` and share the row order of the positions the
/// graph was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationGraph {
    /// Symmetric, non-negative edge weights with a zero diagonal.
    pub adjacency: DMatrix<f64>,
    /// `diag(row sums of adjacency) - adjacency`.
    pub laplacian: DMatrix<f64>,
    /// Pairwise Euclidean distances.
    pub distances: DMatrix<f64>,
}

impl CommunicationGraph {
    /// Graph with no vertices.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            adjacency: DMatrix::zeros(0, 0),
            laplacian: DMatrix::zeros(0, 0),
            distances: DMatrix::zeros(0, 0),
        }
    }

    /// Number of vertices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adjacency.nrows()
    }

    /// Returns true when the graph has no vertices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of undirected edges carrying a positive weight.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        let n = self.len();
        (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .filter(|&(i, j)| self.adjacency[(i, j)] > 0.0)
            .count()
    }

    /// Visit neighbors of `index` with a positive edge weight, passing their distance.
    pub fn neighbors(&self, index: usize, visitor: &mut dyn FnMut(usize, OrderedFloat<f64>)) {
        for other in 0..self.len() {
            if other != index && self.adjacency[(index, other)] > 0.0 {
                visitor(other, OrderedFloat(self.distances[(index, other)]));
            }
        }
    }
}

/// Common behaviour exposed by communication graph builders.
pub trait GraphBuilder: Send + Sync {
    /// Build the weighted graph for `positions` with the given communication
    /// radius and weight smoothing parameter.
    fn build(
        &self,
        positions: &[[f64; 2]],
        radius: f64,
        smoothing: f64,
    ) -> Result<CommunicationGraph, GraphError>;
}

/// Gaussian edge weight shifted and rescaled so it reaches zero exactly at the
/// communication radius.
///
/// With `sigma^2 = -R^2 / (2 ln delta)` the Gaussian equals `delta` at `R`, so
/// `w(d) = (exp(-d^2 / 2 sigma^2) - delta) / (1 - delta)` is 1 at `d = 0`,
/// decays continuously, and is 0 for `d >= R`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SmoothCutoff;

impl SmoothCutoff {
    /// Check radius and smoothing for use with the weight functions.
    pub fn validate(radius: f64, smoothing: f64) -> Result<(), GraphError> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(GraphError::InvalidConfig(
                "communication radius must be positive",
            ));
        }
        if !(smoothing > 0.0 && smoothing < 1.0) {
            return Err(GraphError::InvalidConfig(
                "weight smoothing must lie strictly between 0 and 1",
            ));
        }
        Ok(())
    }

    /// Variance of the underlying Gaussian.
    #[must_use]
    pub fn sigma_squared(radius: f64, smoothing: f64) -> f64 {
        -(radius * radius) / (2.0 * smoothing.ln())
    }

    /// Edge weight at distance `distance`.
    #[must_use]
    pub fn weight(distance: f64, radius: f64, smoothing: f64) -> f64 {
        if distance >= radius {
            return 0.0;
        }
        let gaussian = Self::gaussian(distance, radius, smoothing);
        ((gaussian - smoothing) / (1.0 - smoothing)).max(0.0)
    }

    /// Derivative of [`SmoothCutoff::weight`] with respect to distance.
    ///
    /// Non-positive inside the radius and zero outside it.
    #[must_use]
    pub fn slope(distance: f64, radius: f64, smoothing: f64) -> f64 {
        if distance >= radius {
            return 0.0;
        }
        let sigma_sq = Self::sigma_squared(radius, smoothing);
        let gaussian = Self::gaussian(distance, radius, smoothing);
        -distance / sigma_sq * gaussian / (1.0 - smoothing)
    }

    fn gaussian(distance: f64, radius: f64, smoothing: f64) -> f64 {
        let sigma_sq = Self::sigma_squared(radius, smoothing);
        (-(distance * distance) / (2.0 * sigma_sq)).exp()
    }
}

/// Reference builder using the [`SmoothCutoff`] weight.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SmoothCutoffGraph;

impl SmoothCutoffGraph {
    /// Create a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl GraphBuilder for SmoothCutoffGraph {
    fn build(
        &self,
        positions: &[[f64; 2]],
        radius: f64,
        smoothing: f64,
    ) -> Result<CommunicationGraph, GraphError> {
        SmoothCutoff::validate(radius, smoothing)?;
        if let Some(index) = positions
            .iter()
            .position(|p| !(p[0].is_finite() && p[1].is_finite()))
        {
            return Err(GraphError::NonFinitePosition { index });
        }

        let n = positions.len();
        let mut distances = DMatrix::zeros(n, n);
        let mut adjacency = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = positions[i][0] - positions[j][0];
                let dy = positions[i][1] - positions[j][1];
                let distance = dx.hypot(dy);
                let weight = SmoothCutoff::weight(distance, radius, smoothing);
                distances[(i, j)] = distance;
                distances[(j, i)] = distance;
                adjacency[(i, j)] = weight;
                adjacency[(j, i)] = weight;
            }
        }

        let mut laplacian = -adjacency.clone();
        for i in 0..n {
            laplacian[(i, i)] = adjacency.row(i).sum();
        }

        Ok(CommunicationGraph {
            adjacency,
            laplacian,
            distances,
        })
    }
}
