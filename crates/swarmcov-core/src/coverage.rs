//! Arc coverage metrics.

use crate::ArcConfig;
use ordered_float::OrderedFloat;

/// Share of the arc covered by the sub-arcs of agents at `bearings`.
///
/// Each agent covers `arc.agent_width` centred on its bearing. Overlap between
/// neighbouring sub-arcs and the parts spilling past either end of the arc are
/// removed before dividing by the arc span. Bearings outside the open arc do not
/// contribute.
#[must_use]
pub fn coverage_ratio(bearings: &[f64], arc: &ArcConfig) -> f64 {
    let span = arc.span();
    if span <= 0.0 {
        return 0.0;
    }
    let mut inside: Vec<f64> = bearings
        .iter()
        .copied()
        .filter(|&b| b > arc.start && b < arc.end)
        .collect();
    if inside.is_empty() {
        return 0.0;
    }
    inside.sort_by_key(|&b| OrderedFloat(b));

    let width = arc.agent_width;
    let half = width / 2.0;
    let mut overlap = 0.0;
    let first = inside[0];
    if first - arc.start < half {
        overlap += arc.start - first + half;
    }
    for pair in inside.windows(2) {
        if pair[1] - pair[0] < width {
            overlap += pair[0] + width - pair[1];
        }
    }
    let last = inside[inside.len() - 1];
    if arc.end - last < half {
        overlap += last + half - arc.end;
    }

    (width * inside.len() as f64 - overlap) / span
}

/// Fraction of `ratios` at or above `threshold`.
#[must_use]
pub fn time_above(ratios: &[f64], threshold: f64) -> f64 {
    if ratios.is_empty() {
        return 0.0;
    }
    let hits = ratios.iter().filter(|&&ratio| ratio >= threshold).count();
    hits as f64 / ratios.len() as f64
}
