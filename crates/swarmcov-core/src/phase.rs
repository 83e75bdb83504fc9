//! Flight-phase state machine and launch scheduling.

use crate::{CoverageConfig, Epoch, Position, Velocity};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

/// Slack subtracted before rounding a launch time up to an epoch so that
/// exact multiples of `dt` are not pushed one epoch late by round-off.
const LAUNCH_EPSILON: f64 = 1e-9;

/// Flight phase of a single agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlightPhase {
    /// Waiting for its launch slot; holds position.
    #[default]
    Stay,
    /// Sweeping the arc under the control laws.
    Cover,
    /// Flying the fixed return pattern.
    Back,
}

impl FlightPhase {
    /// Only covering agents take part in the communication graph and the laws.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Cover)
    }

    /// Lower-case label used in logs and storage.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stay => "stay",
            Self::Cover => "cover",
            Self::Back => "back",
        }
    }
}

/// Field boundaries driving the Cover/Back transitions and the return pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhaseBoundary {
    /// Cover agents with `x` beyond this switch to Back.
    pub exit_x: f64,
    /// Back agents whose `x` lies in this closed interval switch to Cover.
    pub return_window: (f64, f64),
    /// Far edge of the field used by the return pattern.
    pub far_x: f64,
    /// Lateral edge of the field used by the return pattern.
    pub lateral_y: f64,
}

impl Default for PhaseBoundary {
    fn default() -> Self {
        Self {
            exit_x: 2.5,
            return_window: (0.0, 18_000.0),
            far_x: 18_000.0,
            lateral_y: 2.5,
        }
    }
}

/// Transition and return-velocity rules shared by every agent of a formation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseRules {
    launch_interval: f64,
    dt: f64,
    return_speed: f64,
    boundary: PhaseBoundary,
}

impl PhaseRules {
    #[must_use]
    pub const fn new(
        launch_interval: f64,
        dt: f64,
        return_speed: f64,
        boundary: PhaseBoundary,
    ) -> Self {
        Self {
            launch_interval,
            dt,
            return_speed,
            boundary,
        }
    }

    #[must_use]
    pub fn from_config(config: &CoverageConfig) -> Self {
        Self::new(
            config.launch_interval,
            config.dt,
            config.return_speed,
            config.phases,
        )
    }

    #[must_use]
    pub const fn boundary(&self) -> &PhaseBoundary {
        &self.boundary
    }

    /// First epoch at which the agent in `slot` may leave Stay.
    #[must_use]
    pub fn launch_epoch(&self, slot: usize) -> u64 {
        let raw = slot as f64 * self.launch_interval / self.dt;
        (raw - LAUNCH_EPSILON).ceil().max(0.0) as u64
    }

    /// Apply at most one transition for an agent at `epoch`.
    #[must_use]
    pub fn transition(
        &self,
        phase: FlightPhase,
        epoch: Epoch,
        slot: usize,
        position: Position,
    ) -> FlightPhase {
        match phase {
            FlightPhase::Stay if epoch.0 >= self.launch_epoch(slot) => FlightPhase::Cover,
            FlightPhase::Cover if position.x > self.boundary.exit_x => FlightPhase::Back,
            FlightPhase::Back
                if (self.boundary.return_window.0..=self.boundary.return_window.1)
                    .contains(&position.x) =>
            {
                FlightPhase::Cover
            }
            other => other,
        }
    }

    /// Velocity and heading of the fixed return pattern at `position`.
    #[must_use]
    pub fn return_velocity(&self, position: Position) -> (Velocity, f64) {
        let v = self.return_speed;
        let Position { x, y } = position;
        let b = &self.boundary;
        if x < 0.0 && y < 0.0 {
            (Velocity::new(v, 0.0), 0.0)
        } else if x < 0.0 && y > 0.0 {
            (Velocity::new(0.0, -v), -FRAC_PI_2)
        } else if x > b.far_x && y < b.lateral_y {
            (Velocity::new(0.0, v), FRAC_PI_2)
        } else if x > 0.0 && y >= b.lateral_y {
            (Velocity::new(-v, 0.0), PI)
        } else {
            (Velocity::zero(), 0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> PhaseRules {
        PhaseRules::new(20.0, 0.1, 0.2, PhaseBoundary::default())
    }

    #[test]
    fn launches_are_staggered_by_interval() {
        let rules = rules();
        assert_eq!(rules.launch_epoch(0), 0);
        assert_eq!(rules.launch_epoch(1), 200);
        assert_eq!(rules.launch_epoch(2), 400);

        let origin = Position::new(-1.0, 0.0);
        assert_eq!(
            rules.transition(FlightPhase::Stay, Epoch(399), 2, origin),
            FlightPhase::Stay
        );
        assert_eq!(
            rules.transition(FlightPhase::Stay, Epoch(400), 2, origin),
            FlightPhase::Cover
        );
    }

    #[test]
    fn one_transition_per_epoch() {
        let rules = rules();
        let beyond_exit = Position::new(3.0, 0.0);
        assert_eq!(
            rules.transition(FlightPhase::Stay, Epoch(0), 0, beyond_exit),
            FlightPhase::Cover
        );
        assert_eq!(
            rules.transition(FlightPhase::Cover, Epoch(1), 0, beyond_exit),
            FlightPhase::Back
        );
        // The default return window also contains the exit point.
        assert_eq!(
            rules.transition(FlightPhase::Back, Epoch(2), 0, beyond_exit),
            FlightPhase::Cover
        );
        assert_eq!(
            rules.transition(FlightPhase::Back, Epoch(2), 0, Position::new(-0.5, 1.0)),
            FlightPhase::Back
        );
        assert_eq!(
            rules.transition(FlightPhase::Cover, Epoch(2), 0, Position::new(2.5, 0.0)),
            FlightPhase::Cover
        );
    }

    #[test]
    fn return_pattern_by_quadrant() {
        let rules = rules();
        let cases = [
            (Position::new(-1.0, -1.0), Velocity::new(0.2, 0.0), 0.0),
            (Position::new(-1.0, 1.0), Velocity::new(0.0, -0.2), -FRAC_PI_2),
            (Position::new(20_000.0, 1.0), Velocity::new(0.0, 0.2), FRAC_PI_2),
            (Position::new(3.0, 2.5), Velocity::new(-0.2, 0.0), PI),
            (Position::new(3.0, 1.0), Velocity::zero(), 0.0),
            (Position::new(0.0, 0.0), Velocity::zero(), 0.0),
        ];
        for (position, velocity, heading) in cases {
            assert_eq!(rules.return_velocity(position), (velocity, heading), "{position:?}");
        }
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(FlightPhase::Back.label(), "back");
        assert!(FlightPhase::Cover.is_active());
        assert!(!FlightPhase::Stay.is_active());
    }
}
