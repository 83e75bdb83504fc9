//! Reference control laws plugged into swarmcov formations.

mod bearing;
mod gradient;

pub use bearing::BearingSpreadLaw;
pub use gradient::FiedlerGradientLaw;

use swarmcov_core::ControlLaws;
use swarmcov_graph::SmoothCutoffGraph;

/// Smooth-cutoff graph with the bearing-spread and Fiedler-gradient laws at their defaults.
#[must_use]
pub fn reference_laws() -> ControlLaws {
    ControlLaws {
        graph: Box::new(SmoothCutoffGraph::new()),
        coverage: Box::new(BearingSpreadLaw::default()),
        connectivity: Box::new(FiedlerGradientLaw::default()),
    }
}
