//! Scheduled, irreversible removal of agents from a formation.

use crate::{
    AgentArena, AgentId, ConfigError, ControlCommand, DroneId, Epoch, Position, Velocity,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Drop the agents at the listed configured indices at `epoch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipEvent {
    pub epoch: u64,
    /// Indices into the formation's configured agent list.
    pub drop: Vec<usize>,
}

/// What to emit for agents after they leave the formation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemovedReporting {
    /// Keep emitting the cached final state every epoch.
    #[default]
    Frozen,
    /// Stop emitting departed agents.
    Omit,
}

/// Final state of an agent at the moment it was removed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DepartedAgent {
    pub drone: DroneId,
    pub position: Position,
    pub velocity: Velocity,
    pub heading: f64,
    pub removed_at: Epoch,
}

impl DepartedAgent {
    /// Command repeating the cached state at `epoch`.
    #[must_use]
    pub fn frozen_command(&self, epoch: Epoch) -> ControlCommand {
        ControlCommand {
            drone: self.drone,
            epoch,
            position: self.position,
            heading: self.heading,
            velocity: self.velocity,
        }
    }
}

/// Pending membership events ordered by epoch.
#[derive(Debug, Clone, Default)]
pub struct MembershipSchedule {
    pending: VecDeque<MembershipEvent>,
}

impl MembershipSchedule {
    /// Validate `events` against a formation of `agents` configured agents.
    ///
    /// Every index must exist and may be dropped at most once across all events.
    pub fn new(events: &[MembershipEvent], agents: usize) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for event in events {
            for &index in &event.drop {
                if index >= agents {
                    return Err(ConfigError::UnknownMember {
                        epoch: event.epoch,
                        index,
                        agents,
                    });
                }
                if !seen.insert(index) {
                    return Err(ConfigError::DuplicateMember { index });
                }
            }
        }
        let mut sorted = events.to_vec();
        sorted.sort_by_key(|event| event.epoch);
        Ok(Self {
            pending: sorted.into(),
        })
    }

    /// Number of events not yet applied.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pop every event scheduled at or before `epoch` and return their indices.
    pub fn take_due(&mut self, epoch: Epoch) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(event) = self.pending.front() {
            if event.epoch > epoch.0 {
                break;
            }
            if let Some(event) = self.pending.pop_front() {
                due.extend(event.drop);
            }
        }
        due
    }
}

/// Remove the agents at configured `indices` in one compaction.
///
/// `roster` maps configured indices to arena handles. Indices whose agent is no
/// longer live are skipped.
pub fn depart(
    arena: &mut AgentArena,
    roster: &[AgentId],
    indices: &[usize],
    epoch: Epoch,
) -> Vec<DepartedAgent> {
    let mut dead = HashSet::with_capacity(indices.len());
    let mut departed = Vec::with_capacity(indices.len());
    for &index in indices {
        let Some(&id) = roster.get(index) else {
            continue;
        };
        let Some(agent) = arena.snapshot(id) else {
            continue;
        };
        if dead.insert(id) {
            departed.push(DepartedAgent {
                drone: agent.drone,
                position: agent.position,
                velocity: agent.velocity,
                heading: agent.heading,
                removed_at: epoch,
            });
        }
    }
    arena.remove_many(&dead);
    departed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentData, HistorySample, Track};

    fn arena_of(count: usize) -> (AgentArena, Vec<AgentId>) {
        let mut arena = AgentArena::with_capacity(count);
        let roster = (0..count)
            .map(|k| {
                let agent = AgentData {
                    drone: DroneId(k as u32 + 10),
                    launch_slot: k,
                    position: Position::new(k as f64, 0.0),
                    ..AgentData::default()
                };
                let track = Track::seeded(8, HistorySample::default());
                arena.insert(agent, track)
            })
            .collect();
        (arena, roster)
    }

    #[test]
    fn removes_configured_indices_and_keeps_identities() {
        let (mut arena, roster) = arena_of(6);
        let departed = depart(&mut arena, &roster, &[2, 3, 4], Epoch(100));

        assert_eq!(arena.len(), 3);
        let drones: Vec<DroneId> = arena.columns().drones().to_vec();
        assert_eq!(drones, vec![DroneId(10), DroneId(11), DroneId(15)]);
        assert_eq!(arena.columns().tracks().len(), 3);
        assert_eq!(arena.index_of(roster[5]), Some(2));
        assert!(!arena.contains(roster[3]));

        let gone: Vec<DroneId> = departed.iter().map(|d| d.drone).collect();
        assert_eq!(gone, vec![DroneId(12), DroneId(13), DroneId(14)]);
        assert_eq!(departed[1].position, Position::new(3.0, 0.0));
        assert_eq!(departed[1].removed_at, Epoch(100));
    }

    #[test]
    fn departing_twice_is_a_no_op() {
        let (mut arena, roster) = arena_of(3);
        assert_eq!(depart(&mut arena, &roster, &[1], Epoch(1)).len(), 1);
        assert!(depart(&mut arena, &roster, &[1], Epoch(2)).is_empty());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn schedule_validates_and_orders_events() {
        let events = vec![
            MembershipEvent {
                epoch: 50,
                drop: vec![4],
            },
            MembershipEvent {
                epoch: 10,
                drop: vec![0, 1],
            },
        ];
        let mut schedule = MembershipSchedule::new(&events, 5).expect("schedule");
        assert_eq!(schedule.len(), 2);
        assert!(schedule.take_due(Epoch(9)).is_empty());
        assert_eq!(schedule.take_due(Epoch(10)), vec![0, 1]);
        assert!(schedule.take_due(Epoch(10)).is_empty());
        assert_eq!(schedule.take_due(Epoch(60)), vec![4]);
        assert!(schedule.is_empty());

        assert!(matches!(
            MembershipSchedule::new(&events, 4),
            Err(ConfigError::UnknownMember { index: 4, .. })
        ));
        let duplicate = vec![
            MembershipEvent {
                epoch: 1,
                drop: vec![0],
            },
            MembershipEvent {
                epoch: 2,
                drop: vec![0],
            },
        ];
        assert!(matches!(
            MembershipSchedule::new(&duplicate, 4),
            Err(ConfigError::DuplicateMember { index: 0 })
        ));
    }

    #[test]
    fn frozen_command_repeats_cached_state() {
        let departed = DepartedAgent {
            drone: DroneId(3),
            position: Position::new(1.0, 2.0),
            velocity: Velocity::new(0.2, -0.1),
            heading: -0.46,
            removed_at: Epoch(100),
        };
        let command = departed.frozen_command(Epoch(250));
        assert_eq!(command.epoch, Epoch(250));
        assert_eq!(command.position, departed.position);
        assert_eq!(command.velocity, departed.velocity);
    }
}
