//! Algebraic connectivity tracking over the communication graph.

use nalgebra::{DMatrix, SymmetricEigen};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use swarmcov_graph::{CommunicationGraph, GraphBuilder, GraphError};

/// Eigenvalues below this are treated as zero modes of the Laplacian.
pub const DEGENERACY_TOLERANCE: f64 = 1e-9;

/// Spectral conditions worth reporting to the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Degeneracy {
    /// The graph splits into `zero_modes` connected components.
    Disconnected { zero_modes: usize },
}

/// Graph and sorted Laplacian spectrum for one epoch's active agents.
#[derive(Debug, Clone)]
pub struct ConnectivitySnapshot {
    members: Vec<usize>,
    graph: CommunicationGraph,
    eigenvalues: Vec<f64>,
    eigenvectors: DMatrix<f64>,
}

impl ConnectivitySnapshot {
    /// Build the graph over `positions` and decompose its Laplacian.
    ///
    /// `members[k]` is the arena index of the agent at `positions[k]`.
    /// Eigenpairs are sorted by ascending eigenvalue and round-off negatives
    /// are clamped to zero.
    pub fn track(
        builder: &dyn GraphBuilder,
        members: Vec<usize>,
        positions: &[[f64; 2]],
        radius: f64,
        smoothing: f64,
    ) -> Result<Self, GraphError> {
        debug_assert_eq!(members.len(), positions.len());
        let graph = builder.build(positions, radius, smoothing)?;
        let n = graph.len();
        if n == 0 {
            return Ok(Self {
                members,
                graph,
                eigenvalues: Vec::new(),
                eigenvectors: DMatrix::zeros(0, 0),
            });
        }

        let symmetric = (&graph.laplacian + graph.laplacian.transpose()) * 0.5;
        let eigen = SymmetricEigen::new(symmetric);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&k| OrderedFloat(eigen.eigenvalues[k]));

        let eigenvalues = order
            .iter()
            .map(|&k| eigen.eigenvalues[k].max(0.0))
            .collect();
        let eigenvectors = DMatrix::from_fn(n, n, |row, col| eigen.eigenvectors[(row, order[col])]);

        Ok(Self {
            members,
            graph,
            eigenvalues,
            eigenvectors,
        })
    }

    /// Arena indices of the agents in the graph, in graph row order.
    #[must_use]
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    #[must_use]
    pub fn graph(&self) -> &CommunicationGraph {
        &self.graph
    }

    /// Laplacian eigenvalues in ascending order.
    #[must_use]
    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Eigenvectors as columns, in the same order as [`Self::eigenvalues`].
    #[must_use]
    pub fn eigenvectors(&self) -> &DMatrix<f64> {
        &self.eigenvectors
    }

    /// Second-smallest eigenvalue; `None` with fewer than two members.
    #[must_use]
    pub fn fiedler_value(&self) -> Option<f64> {
        self.eigenvalues.get(1).copied()
    }

    /// Eigenvector paired with the Fiedler value, or zeros with fewer than two members.
    #[must_use]
    pub fn fiedler_vector(&self) -> Vec<f64> {
        let n = self.members.len();
        if n < 2 {
            return vec![0.0; n];
        }
        self.eigenvectors.column(1).iter().copied().collect()
    }

    #[must_use]
    pub fn degeneracy(&self) -> Option<Degeneracy> {
        if self.eigenvalues.len() < 2 {
            return None;
        }
        let zero_modes = self
            .eigenvalues
            .iter()
            .filter(|&&value| value < DEGENERACY_TOLERANCE)
            .count();
        (zero_modes > 1).then_some(Degeneracy::Disconnected { zero_modes })
    }
}
