//! Core types and the epoch stepper for connectivity-preserving arc coverage.

pub mod compose;
pub mod connectivity;
pub mod coverage;
pub mod history;
pub mod membership;
pub mod phase;

use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashSet;
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;
use swarmcov_graph::{CommunicationGraph, GraphBuilder, GraphError};
use thiserror::Error;
use tracing::{debug, info};

pub use compose::{compose_lateral, heading_of, saturate};
pub use connectivity::{ConnectivitySnapshot, DEGENERACY_TOLERANCE, Degeneracy};
pub use coverage::{coverage_ratio, time_above};
pub use history::{HistoryError, HistorySample, Track};
pub use membership::{DepartedAgent, MembershipEvent, MembershipSchedule, RemovedReporting};
pub use phase::{FlightPhase, PhaseBoundary, PhaseRules};

/// Slack added before flooring `total_time / dt` so exact multiples survive round-off.
const HORIZON_EPSILON: f64 = 1e-9;

/// Longest run a formation accepts, in epochs. Histories are preallocated to this length.
pub const MAX_HORIZON: u64 = 100_000;

new_key_type! {
    /// Internal generational handle of an agent in the arena.
    pub struct AgentId;
}

/// Stable external identifier of a drone, taken from configuration.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct DroneId(pub u32);

impl fmt::Display for DroneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one launch batch; each batch runs on its own worker.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct BatchId(pub u32);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control epoch counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Returns the next sequential epoch.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Position of this epoch in a history buffer.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Planar position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub const fn to_array(self) -> [f64; 2] {
        [self.x, self.y]
    }

    /// Forward-Euler step along `velocity` for `dt`.
    #[must_use]
    pub fn advance(self, velocity: Velocity, dt: f64) -> Self {
        Self::new(self.x + velocity.vx * dt, self.y + velocity.vy * dt)
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Planar velocity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
}

impl Velocity {
    #[must_use]
    pub const fn new(vx: f64, vy: f64) -> Self {
        Self { vx, vy }
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self { vx: 0.0, vy: 0.0 }
    }

    #[must_use]
    pub fn norm(self) -> f64 {
        self.vx.hypot(self.vy)
    }

    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.vx * factor, self.vy * factor)
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.vx.is_finite() && self.vy.is_finite()
    }
}

/// Scalar state of one agent (its history lives alongside in the arena).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AgentData {
    pub drone: DroneId,
    /// Configured index; fixes the launch time.
    pub launch_slot: usize,
    pub position: Position,
    pub velocity: Velocity,
    pub bearing: f64,
    pub heading: f64,
    pub phase: FlightPhase,
}

/// Structure-of-arrays storage for live agents.
#[derive(Debug, Default)]
pub struct AgentColumns {
    drones: Vec<DroneId>,
    launch_slots: Vec<usize>,
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    bearings: Vec<f64>,
    headings: Vec<f64>,
    phases: Vec<FlightPhase>,
    tracks: Vec<Track>,
}

impl AgentColumns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            drones: Vec::with_capacity(capacity),
            launch_slots: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            bearings: Vec::with_capacity(capacity),
            headings: Vec::with_capacity(capacity),
            phases: Vec::with_capacity(capacity),
            tracks: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData, track: Track) {
        self.drones.push(agent.drone);
        self.launch_slots.push(agent.launch_slot);
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.bearings.push(agent.bearing);
        self.headings.push(agent.heading);
        self.phases.push(agent.phase);
        self.tracks.push(track);
        self.debug_assert_coherent();
    }

    /// Move the row at `from` into position `to`; the row previously at `to`
    /// ends up at `from` and is expected to be truncated away.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.drones[to] = self.drones[from];
        self.launch_slots[to] = self.launch_slots[from];
        self.positions[to] = self.positions[from];
        self.velocities[to] = self.velocities[from];
        self.bearings[to] = self.bearings[from];
        self.headings[to] = self.headings[from];
        self.phases[to] = self.phases[from];
        self.tracks.swap(from, to);
    }

    /// Truncate all columns to the provided length.
    pub fn truncate(&mut self, len: usize) {
        self.drones.truncate(len);
        self.launch_slots.truncate(len);
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.bearings.truncate(len);
        self.headings.truncate(len);
        self.phases.truncate(len);
        self.tracks.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            drone: self.drones[index],
            launch_slot: self.launch_slots[index],
            position: self.positions[index],
            velocity: self.velocities[index],
            bearing: self.bearings[index],
            heading: self.headings[index],
            phase: self.phases[index],
        }
    }

    /// Store the integrated state of row `index` and append it to its track at `epoch`.
    pub fn commit(
        &mut self,
        index: usize,
        epoch: Epoch,
        sample: HistorySample,
    ) -> Result<(), HistoryError> {
        self.tracks[index].record(epoch, sample)?;
        self.positions[index] = sample.position;
        self.velocities[index] = sample.command;
        self.bearings[index] = sample.bearing;
        self.headings[index] = sample.heading;
        Ok(())
    }

    #[must_use]
    pub fn drones(&self) -> &[DroneId] {
        &self.drones
    }

    #[must_use]
    pub fn launch_slots(&self) -> &[usize] {
        &self.launch_slots
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    #[must_use]
    pub fn bearings(&self) -> &[f64] {
        &self.bearings
    }

    #[must_use]
    pub fn headings(&self) -> &[f64] {
        &self.headings
    }

    #[must_use]
    pub fn phases(&self) -> &[FlightPhase] {
        &self.phases
    }

    #[must_use]
    pub fn phases_mut(&mut self) -> &mut [FlightPhase] {
        &mut self.phases
    }

    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.drones.len());
        debug_assert_eq!(self.positions.len(), self.launch_slots.len());
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.bearings.len());
        debug_assert_eq!(self.positions.len(), self.headings.len());
        debug_assert_eq!(self.positions.len(), self.phases.len());
        debug_assert_eq!(self.positions.len(), self.tracks.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug, Default)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl AgentArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: AgentColumns::with_capacity(capacity),
        }
    }

    /// Number of live agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over live agent handles in dense order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Handle of the live agent flying as `drone`.
    #[must_use]
    pub fn find_drone(&self, drone: DroneId) -> Option<AgentId> {
        let index = self.columns.drones.iter().position(|&d| d == drone)?;
        Some(self.handles[index])
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData, track: Track) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent, track);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove all agents whose ids are contained in `dead`, preserving order.
    pub fn remove_many(&mut self, dead: &HashSet<AgentId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len().saturating_sub(write);
        self.handles.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// History buffer of `id`.
    #[must_use]
    pub fn track(&self, id: AgentId) -> Option<&Track> {
        let index = self.index_of(id)?;
        self.columns.tracks.get(index)
    }
}

/// Errors raised while validating configuration or constructing a formation.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("formation has no agents")]
    EmptyFormation,
    #[error("drone id {0} is configured more than once")]
    DuplicateDrone(DroneId),
    #[error("membership event at epoch {epoch} drops agent {index} of only {agents} agents")]
    UnknownMember {
        epoch: u64,
        index: usize,
        agents: usize,
    },
    #[error("agent index {index} is dropped by more than one membership event")]
    DuplicateMember { index: usize },
}

/// Sensing arc swept by the formation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArcConfig {
    /// Point bearings are measured from.
    pub origin: Position,
    /// Lower arc bound in radians.
    pub start: f64,
    /// Upper arc bound in radians.
    pub end: f64,
    /// Angular width covered by one agent, in radians.
    pub agent_width: f64,
    pub sensing_radius: f64,
}

impl Default for ArcConfig {
    fn default() -> Self {
        Self {
            origin: Position::new(8.0, 0.5),
            start: 165.0_f64.to_radians(),
            end: 195.0_f64.to_radians(),
            agent_width: 4.0_f64.to_radians(),
            sensing_radius: 2.0,
        }
    }
}

impl ArcConfig {
    #[must_use]
    pub fn span(&self) -> f64 {
        self.end - self.start
    }

    /// `pi + atan((cy - y) / (cx - x))`, with the limiting angle when `x == cx`.
    #[must_use]
    pub fn bearing_of(&self, position: Position) -> f64 {
        let dy = self.origin.y - position.y;
        let dx = self.origin.x - position.x;
        if dx == 0.0 {
            return if dy > 0.0 {
                PI + FRAC_PI_2
            } else if dy < 0.0 {
                PI - FRAC_PI_2
            } else {
                PI
            };
        }
        PI + (dy / dx).atan()
    }
}

/// Immutable parameters of one formation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoverageConfig {
    /// Epoch length in seconds.
    pub dt: f64,
    /// Run length in seconds; the horizon is `floor(total_time / dt)` epochs.
    pub total_time: f64,
    pub communication_radius: f64,
    /// Weight value of the unshifted Gaussian at the communication radius.
    pub weight_smoothing: f64,
    /// Connectivity floor the connectivity law guards.
    pub min_connectivity: f64,
    /// Seconds between consecutive launch slots.
    pub launch_interval: f64,
    pub max_speed: f64,
    pub return_speed: f64,
    /// Clamp applied to the connectivity velocity, after the lateral gain.
    ///
    /// The default of 0.01 keeps the connectivity correction an order of
    /// magnitude below `max_speed`.
    pub connectivity_speed_limit: f64,
    /// Multiplier on the connectivity lateral component before clamping.
    ///
    /// With the default clamp, any pull stronger than the limit only has its
    /// direction tilted towards the lateral axis; weaker pulls are also
    /// amplified. Set the limit to `max_speed` to let the gain scale the
    /// correction freely.
    pub connectivity_lateral_gain: f64,
    pub arc: ArcConfig,
    pub phases: PhaseBoundary,
    /// Finish early once any live agent's x exceeds this.
    pub completion_x: Option<f64>,
    pub membership: Vec<MembershipEvent>,
    pub removed_reporting: RemovedReporting,
    /// Wall-clock budget for one epoch, enforced by the supervisor.
    pub epoch_timeout_ms: u64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            dt: 0.1,
            total_time: 1000.0,
            communication_radius: 1.5,
            weight_smoothing: 0.1,
            min_connectivity: 0.1,
            launch_interval: 20.0,
            max_speed: 0.2,
            return_speed: 0.2,
            connectivity_speed_limit: 0.01,
            connectivity_lateral_gain: 10.0,
            arc: ArcConfig::default(),
            phases: PhaseBoundary::default(),
            completion_x: None,
            membership: Vec::new(),
            removed_reporting: RemovedReporting::Frozen,
            epoch_timeout_ms: 10_000,
        }
    }
}

impl CoverageConfig {
    /// Number of epochs in a full run.
    #[must_use]
    pub fn horizon(&self) -> u64 {
        (self.total_time / self.dt + HORIZON_EPSILON).floor() as u64
    }

    /// Reject parameter combinations the stepper cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(ConfigError::Invalid("dt must be positive"));
        }
        if !(self.total_time.is_finite() && self.total_time >= 0.0) {
            return Err(ConfigError::Invalid("total_time must be non-negative"));
        }
        if self.horizon() > MAX_HORIZON {
            return Err(ConfigError::Invalid(
                "total_time / dt exceeds the maximum horizon",
            ));
        }
        if !(self.communication_radius.is_finite() && self.communication_radius > 0.0) {
            return Err(ConfigError::Invalid("communication_radius must be positive"));
        }
        if !(self.weight_smoothing > 0.0 && self.weight_smoothing < 1.0) {
            return Err(ConfigError::Invalid(
                "weight_smoothing must lie strictly between 0 and 1",
            ));
        }
        if !(self.min_connectivity.is_finite() && self.min_connectivity >= 0.0) {
            return Err(ConfigError::Invalid("min_connectivity must be non-negative"));
        }
        if !(self.launch_interval.is_finite() && self.launch_interval >= 0.0) {
            return Err(ConfigError::Invalid("launch_interval must be non-negative"));
        }
        if !(self.max_speed.is_finite() && self.max_speed > 0.0) {
            return Err(ConfigError::Invalid("max_speed must be positive"));
        }
        if !(self.return_speed.is_finite() && self.return_speed >= 0.0) {
            return Err(ConfigError::Invalid("return_speed must be non-negative"));
        }
        if !(self.connectivity_speed_limit.is_finite() && self.connectivity_speed_limit >= 0.0) {
            return Err(ConfigError::Invalid(
                "connectivity_speed_limit must be non-negative",
            ));
        }
        if !self.connectivity_lateral_gain.is_finite() {
            return Err(ConfigError::Invalid(
                "connectivity_lateral_gain must be finite",
            ));
        }
        if !(self.arc.span() > 0.0 && self.arc.agent_width > 0.0) {
            return Err(ConfigError::Invalid(
                "arc must have a positive span and agent width",
            ));
        }
        if !(self.arc.origin.is_finite() && self.arc.sensing_radius > 0.0) {
            return Err(ConfigError::Invalid(
                "arc origin must be finite and sensing radius positive",
            ));
        }
        if self.phases.return_window.0 > self.phases.return_window.1 {
            return Err(ConfigError::Invalid("return_window must be ordered"));
        }
        if self.completion_x.is_some_and(|x| !x.is_finite()) {
            return Err(ConfigError::Invalid("completion_x must be finite"));
        }
        if self.epoch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("epoch_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Initial placement of one configured agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    pub id: DroneId,
    pub position: Position,
}

/// Per-epoch command for one drone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ControlCommand {
    pub drone: DroneId,
    pub epoch: Epoch,
    /// Position after integrating this epoch's command.
    pub position: Position,
    pub heading: f64,
    pub velocity: Velocity,
}

/// Inputs handed to a coverage law, one entry per covering agent.
#[derive(Debug, Clone, Copy)]
pub struct CoverageInputs<'a> {
    pub positions: &'a [Position],
    pub bearings: &'a [f64],
    /// Lateral coverage velocity recorded at the current epoch.
    pub lateral_velocities: &'a [f64],
    pub headings: &'a [f64],
    pub arc: &'a ArcConfig,
    pub max_speed: f64,
}

/// Produces velocities that spread covering agents over the arc.
///
/// Implementations must return one velocity per agent with `|vx| <= max_speed`.
pub trait CoverageLaw: Send {
    fn kind(&self) -> &'static str;

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity>;
}

/// Inputs handed to a connectivity law, one entry per covering agent.
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityInputs<'a> {
    /// Algebraic connectivity broadcast to every agent (0 with fewer than two).
    pub fiedler_value: f64,
    pub fiedler_vector: &'a [f64],
    pub positions: &'a [Position],
    pub graph: &'a CommunicationGraph,
    pub communication_radius: f64,
    pub weight_smoothing: f64,
    pub min_connectivity: f64,
}

/// Produces velocities that keep the communication graph connected.
///
/// Output magnitude is unbounded; the stepper applies gain and clamping.
pub trait ConnectivityLaw: Send {
    fn kind(&self) -> &'static str;

    fn velocities(&mut self, inputs: &ConnectivityInputs<'_>) -> Vec<Velocity>;
}

/// Graph builder and control laws plugged into a formation.
pub struct ControlLaws {
    pub graph: Box<dyn GraphBuilder>,
    pub coverage: Box<dyn CoverageLaw>,
    pub connectivity: Box<dyn ConnectivityLaw>,
}

impl fmt::Debug for ControlLaws {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLaws")
            .field("coverage", &self.coverage.kind())
            .field("connectivity", &self.connectivity.kind())
            .finish_non_exhaustive()
    }
}

/// Summary of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: Epoch,
    pub live: usize,
    /// Agents in the Cover phase.
    pub active: usize,
    pub fiedler_value: Option<f64>,
    pub coverage: f64,
    /// Commands emitted this epoch, including frozen departed agents.
    pub commands: usize,
    /// Drones removed at the start of this epoch.
    pub departed: Vec<DroneId>,
}

/// Receives every command and epoch report a formation emits.
pub trait CommandSink: Send {
    fn publish(&mut self, command: ControlCommand);

    fn on_epoch(&mut self, _report: &EpochReport) {}
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl CommandSink for NullSink {
    fn publish(&mut self, _command: ControlCommand) {}
}

/// Why a formation stopped stepping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Horizon,
    CoverageComplete,
}

/// Result of a single call to [`Formation::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum EpochOutcome {
    Advanced(EpochReport),
    /// The epoch ran, but the active graph was not connected.
    Degenerate {
        report: EpochReport,
        degeneracy: Degeneracy,
    },
    Finished(FinishReason),
}

/// Faults that end a formation run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("communication graph rebuild failed at epoch {epoch}: {source}")]
    Graph { epoch: u64, source: GraphError },
    #[error("{law} returned {actual} velocities for {expected} covering agents")]
    LawShape {
        law: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("non-finite state for drone {drone} at epoch {epoch}")]
    NonFinite { drone: DroneId, epoch: u64 },
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Aggregate over the epochs of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub epochs: u64,
    pub commands: usize,
    pub degenerate_epochs: u64,
    pub min_fiedler: Option<f64>,
    pub finish: Option<FinishReason>,
}

impl RunSummary {
    /// Fold one epoch report into the summary.
    pub fn absorb(&mut self, report: &EpochReport, degenerate: bool) {
        self.epochs += 1;
        self.commands += report.commands;
        if degenerate {
            self.degenerate_epochs += 1;
        }
        if let Some(value) = report.fiedler_value {
            self.min_fiedler = Some(self.min_fiedler.map_or(value, |min| min.min(value)));
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ControlPlan {
    coverage: Velocity,
    connectivity: Velocity,
    command: Velocity,
    heading: f64,
}

/// A formation of agents stepped epoch by epoch.
pub struct Formation {
    config: CoverageConfig,
    rules: PhaseRules,
    horizon: u64,
    epoch: Epoch,
    agents: AgentArena,
    roster: Vec<AgentId>,
    schedule: MembershipSchedule,
    departed: Vec<DepartedAgent>,
    laws: ControlLaws,
    sink: Box<dyn CommandSink>,
    fiedler_history: Vec<f64>,
    coverage_history: Vec<f64>,
}

impl fmt::Debug for Formation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formation")
            .field("epoch", &self.epoch)
            .field("horizon", &self.horizon)
            .field("live", &self.agents.len())
            .field("departed", &self.departed.len())
            .field("laws", &self.laws)
            .finish_non_exhaustive()
    }
}

impl Formation {
    /// Validate `config` and place `agents` in the Stay phase at epoch 0.
    pub fn new(
        config: CoverageConfig,
        agents: &[AgentSpec],
        laws: ControlLaws,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if agents.is_empty() {
            return Err(ConfigError::EmptyFormation);
        }
        let mut seen = HashSet::with_capacity(agents.len());
        for spec in agents {
            if !seen.insert(spec.id) {
                return Err(ConfigError::DuplicateDrone(spec.id));
            }
            if !spec.position.is_finite() {
                return Err(ConfigError::Invalid("agent positions must be finite"));
            }
        }
        let schedule = MembershipSchedule::new(&config.membership, agents.len())?;

        let horizon = config.horizon();
        let capacity = usize::try_from(horizon)
            .ok()
            .and_then(|epochs| epochs.checked_add(1))
            .ok_or(ConfigError::Invalid(
                "total_time / dt exceeds the maximum horizon",
            ))?;
        let seed_velocity = Velocity::new(config.max_speed, 0.0);
        let mut arena = AgentArena::with_capacity(agents.len());
        let roster = agents
            .iter()
            .enumerate()
            .map(|(slot, spec)| {
                let bearing = config.arc.bearing_of(spec.position);
                let seed = HistorySample {
                    position: spec.position,
                    bearing,
                    coverage: seed_velocity,
                    connectivity: Velocity::zero(),
                    command: seed_velocity,
                    heading: 0.0,
                };
                let agent = AgentData {
                    drone: spec.id,
                    launch_slot: slot,
                    position: spec.position,
                    velocity: Velocity::zero(),
                    bearing,
                    heading: 0.0,
                    phase: FlightPhase::Stay,
                };
                arena.insert(agent, Track::seeded(capacity, seed))
            })
            .collect();

        info!(
            agents = agents.len(),
            horizon,
            coverage_law = laws.coverage.kind(),
            connectivity_law = laws.connectivity.kind(),
            "formation initialised"
        );

        Ok(Self {
            rules: PhaseRules::from_config(&config),
            config,
            horizon,
            epoch: Epoch::zero(),
            agents: arena,
            roster,
            schedule,
            departed: Vec::new(),
            laws,
            sink: Box::new(NullSink),
            fiedler_history: Vec::with_capacity(capacity),
            coverage_history: Vec::with_capacity(capacity),
        })
    }

    /// Replace the command sink.
    pub fn set_sink(&mut self, sink: Box<dyn CommandSink>) {
        self.sink = sink;
    }

    /// Builder-style variant of [`Formation::set_sink`].
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn CommandSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    /// Next epoch to be stepped.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub const fn horizon(&self) -> u64 {
        self.horizon
    }

    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Agents removed so far, in removal order.
    #[must_use]
    pub fn departed(&self) -> &[DepartedAgent] {
        &self.departed
    }

    /// Algebraic connectivity per stepped epoch (0 with fewer than two covering agents).
    #[must_use]
    pub fn fiedler_history(&self) -> &[f64] {
        &self.fiedler_history
    }

    /// Coverage ratio per stepped epoch.
    #[must_use]
    pub fn coverage_history(&self) -> &[f64] {
        &self.coverage_history
    }

    /// Scalar state of the live agent flying as `drone`.
    #[must_use]
    pub fn agent(&self, drone: DroneId) -> Option<AgentData> {
        self.agents.snapshot(self.agents.find_drone(drone)?)
    }

    /// History of the live agent flying as `drone`.
    #[must_use]
    pub fn track(&self, drone: DroneId) -> Option<&Track> {
        self.agents.track(self.agents.find_drone(drone)?)
    }

    /// Step until the formation finishes.
    pub fn run_to_end(&mut self) -> Result<RunSummary, StepError> {
        let mut summary = RunSummary::default();
        loop {
            match self.step()? {
                EpochOutcome::Advanced(report) => summary.absorb(&report, false),
                EpochOutcome::Degenerate { report, .. } => summary.absorb(&report, true),
                EpochOutcome::Finished(reason) => {
                    summary.finish = Some(reason);
                    return Ok(summary);
                }
            }
        }
    }

    /// Execute one control epoch.
    pub fn step(&mut self) -> Result<EpochOutcome, StepError> {
        let epoch = self.epoch;
        if epoch.0 >= self.horizon {
            return Ok(EpochOutcome::Finished(FinishReason::Horizon));
        }
        if let Some(limit) = self.config.completion_x
            && self.agents.columns().positions().iter().any(|p| p.x > limit)
        {
            info!(epoch = epoch.0, limit, "coverage complete");
            return Ok(EpochOutcome::Finished(FinishReason::CoverageComplete));
        }

        self.stage_phases(epoch);
        let departed = self.stage_membership(epoch);
        let snapshot = self.stage_connectivity(epoch)?;
        let (coverage, connectivity) = self.stage_laws(epoch, &snapshot)?;
        let plans = self.stage_compose(&snapshot, &coverage, &connectivity);
        self.stage_integrate(epoch, &plans)?;
        let commands = self.stage_emit(epoch);

        let bearings = self.agents.columns().bearings();
        let active_bearings: Vec<f64> = snapshot.members().iter().map(|&i| bearings[i]).collect();
        let coverage = coverage_ratio(&active_bearings, &self.config.arc);
        let fiedler_value = snapshot.fiedler_value();
        self.fiedler_history.push(fiedler_value.unwrap_or(0.0));
        self.coverage_history.push(coverage);

        let report = EpochReport {
            epoch,
            live: self.agents.len(),
            active: snapshot.members().len(),
            fiedler_value,
            coverage,
            commands,
            departed,
        };
        self.sink.on_epoch(&report);
        self.epoch = epoch.next();

        Ok(match snapshot.degeneracy() {
            Some(degeneracy) => EpochOutcome::Degenerate { report, degeneracy },
            None => EpochOutcome::Advanced(report),
        })
    }

    fn stage_phases(&mut self, epoch: Epoch) {
        let rules = self.rules;
        let columns = self.agents.columns_mut();
        for index in 0..columns.len() {
            let current = columns.phases()[index];
            let next = rules.transition(
                current,
                epoch,
                columns.launch_slots()[index],
                columns.positions()[index],
            );
            if next != current {
                debug!(
                    epoch = epoch.0,
                    drone = %columns.drones()[index],
                    from = current.label(),
                    to = next.label(),
                    "phase transition"
                );
                columns.phases_mut()[index] = next;
            }
        }
    }

    fn stage_membership(&mut self, epoch: Epoch) -> Vec<DroneId> {
        let due = self.schedule.take_due(epoch);
        if due.is_empty() {
            return Vec::new();
        }
        let departed = membership::depart(&mut self.agents, &self.roster, &due, epoch);
        let drones: Vec<DroneId> = departed.iter().map(|agent| agent.drone).collect();
        info!(
            epoch = epoch.0,
            removed = ?drones,
            live = self.agents.len(),
            "membership change applied"
        );
        self.departed.extend(departed);
        drones
    }

    fn stage_connectivity(&self, epoch: Epoch) -> Result<ConnectivitySnapshot, StepError> {
        let columns = self.agents.columns();
        let members: Vec<usize> = columns
            .phases()
            .iter()
            .enumerate()
            .filter(|(_, phase)| phase.is_active())
            .map(|(index, _)| index)
            .collect();
        let positions: Vec<[f64; 2]> = members
            .iter()
            .map(|&index| columns.positions()[index].to_array())
            .collect();
        let snapshot = ConnectivitySnapshot::track(
            self.laws.graph.as_ref(),
            members,
            &positions,
            self.config.communication_radius,
            self.config.weight_smoothing,
        )
        .map_err(|source| StepError::Graph {
            epoch: epoch.0,
            source,
        })?;
        debug!(
            epoch = epoch.0,
            active = snapshot.members().len(),
            edges = snapshot.graph().edge_count(),
            fiedler = ?snapshot.fiedler_value(),
            "connectivity tracked"
        );
        Ok(snapshot)
    }

    fn stage_laws(
        &mut self,
        epoch: Epoch,
        snapshot: &ConnectivitySnapshot,
    ) -> Result<(Vec<Velocity>, Vec<Velocity>), StepError> {
        let members = snapshot.members();
        if members.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let columns = self.agents.columns();
        let count = members.len();
        let mut positions = Vec::with_capacity(count);
        let mut bearings = Vec::with_capacity(count);
        let mut lateral = Vec::with_capacity(count);
        let mut headings = Vec::with_capacity(count);
        for &index in members {
            let track = &columns.tracks()[index];
            let sample = track.sample(epoch).unwrap_or(track.latest());
            positions.push(columns.positions()[index]);
            bearings.push(sample.bearing);
            lateral.push(sample.coverage.vy);
            headings.push(sample.heading);
        }

        let coverage = self.laws.coverage.velocities(&CoverageInputs {
            positions: &positions,
            bearings: &bearings,
            lateral_velocities: &lateral,
            headings: &headings,
            arc: &self.config.arc,
            max_speed: self.config.max_speed,
        });
        check_shape(self.laws.coverage.kind(), count, coverage.len())?;

        let fiedler_vector = snapshot.fiedler_vector();
        let connectivity = self.laws.connectivity.velocities(&ConnectivityInputs {
            fiedler_value: snapshot.fiedler_value().unwrap_or(0.0),
            fiedler_vector: &fiedler_vector,
            positions: &positions,
            graph: snapshot.graph(),
            communication_radius: self.config.communication_radius,
            weight_smoothing: self.config.weight_smoothing,
            min_connectivity: self.config.min_connectivity,
        });
        check_shape(self.laws.connectivity.kind(), count, connectivity.len())?;

        Ok((coverage, connectivity))
    }

    fn stage_compose(
        &self,
        snapshot: &ConnectivitySnapshot,
        coverage: &[Velocity],
        connectivity: &[Velocity],
    ) -> Vec<ControlPlan> {
        let config = &self.config;
        let columns = self.agents.columns();
        let mut plans: Vec<ControlPlan> = columns
            .phases()
            .iter()
            .zip(columns.positions())
            .map(|(&phase, &position)| match phase {
                FlightPhase::Back => {
                    let (command, heading) = self.rules.return_velocity(position);
                    ControlPlan {
                        command,
                        heading,
                        ..ControlPlan::default()
                    }
                }
                FlightPhase::Stay | FlightPhase::Cover => ControlPlan::default(),
            })
            .collect();

        for (k, &index) in snapshot.members().iter().enumerate() {
            let proposal = coverage[k];
            let mut pull = connectivity[k];
            pull.vy *= config.connectivity_lateral_gain;
            let pull = saturate(pull, config.connectivity_speed_limit);
            let command = Velocity::new(config.max_speed, compose_lateral(proposal.vy, pull.vy));
            plans[index] = ControlPlan {
                coverage: Velocity::new(config.max_speed, proposal.vy),
                connectivity: pull,
                command,
                heading: heading_of(command),
            };
        }
        plans
    }

    fn stage_integrate(&mut self, epoch: Epoch, plans: &[ControlPlan]) -> Result<(), StepError> {
        let next = epoch.next();
        let dt = self.config.dt;
        let arc = self.config.arc;
        let columns = self.agents.columns_mut();

        let mut samples = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            let position = columns.positions()[index].advance(plan.command, dt);
            let finite = position.is_finite()
                && plan.command.is_finite()
                && plan.coverage.is_finite()
                && plan.connectivity.is_finite()
                && plan.heading.is_finite();
            if !finite {
                return Err(StepError::NonFinite {
                    drone: columns.drones()[index],
                    epoch: epoch.0,
                });
            }
            samples.push(HistorySample {
                position,
                bearing: arc.bearing_of(position),
                coverage: plan.coverage,
                connectivity: plan.connectivity,
                command: plan.command,
                heading: plan.heading,
            });
        }
        for (index, sample) in samples.into_iter().enumerate() {
            columns.commit(index, next, sample)?;
        }
        Ok(())
    }

    fn stage_emit(&mut self, epoch: Epoch) -> usize {
        let columns = self.agents.columns();
        let mut emitted = 0;
        for index in 0..columns.len() {
            self.sink.publish(ControlCommand {
                drone: columns.drones()[index],
                epoch,
                position: columns.positions()[index],
                heading: columns.headings()[index],
                velocity: columns.velocities()[index],
            });
            emitted += 1;
        }
        if self.config.removed_reporting == RemovedReporting::Frozen {
            for departed in &self.departed {
                self.sink.publish(departed.frozen_command(epoch));
                emitted += 1;
            }
        }
        emitted
    }
}

fn check_shape(law: &'static str, expected: usize, actual: usize) -> Result<(), StepError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StepError::LawShape {
            law,
            expected,
            actual,
        })
    }
}
