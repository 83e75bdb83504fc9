//! Formation files and the seeded demo formation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use swarmcov_core::{AgentSpec, CoverageConfig, DroneId, Formation, MembershipEvent, Position};

/// Agents removed by the demo formation, as configured indices.
pub const DEMO_DROP: [usize; 3] = [2, 3, 4];
/// Epoch at which the demo removal happens.
pub const DEMO_DROP_EPOCH: u64 = 101;

const DEMO_SPACING: f64 = 0.4;
const DEMO_JITTER: f64 = 0.05;

/// On-disk description of one formation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FormationFile {
    #[serde(default)]
    pub config: CoverageConfig,
    pub agents: Vec<AgentSpec>,
}

impl FormationFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read formation file {}", path.display()))?;
        let file: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse formation file {}", path.display()))?;
        file.config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok(file)
    }

    /// Seeded line of `count` agents staged behind the exit line.
    ///
    /// Formations of at least six agents also get the reference removal of
    /// agents 2, 3 and 4.
    #[must_use]
    pub fn demo(count: usize, seed: u64, config: CoverageConfig) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let centre = config.arc.origin.y;
        let middle = (count as f64 - 1.0) / 2.0;
        let agents = (0..count)
            .map(|k| {
                let jitter_x = rng.random_range(-DEMO_JITTER..=DEMO_JITTER);
                let jitter_y = rng.random_range(-DEMO_JITTER..=DEMO_JITTER);
                AgentSpec {
                    id: DroneId(k as u32),
                    position: Position::new(
                        jitter_x,
                        centre + (k as f64 - middle) * DEMO_SPACING + jitter_y,
                    ),
                }
            })
            .collect();

        let mut config = config;
        if count >= 6 && config.membership.is_empty() {
            config.membership.push(MembershipEvent {
                epoch: DEMO_DROP_EPOCH,
                drop: DEMO_DROP.to_vec(),
            });
        }
        Self { config, agents }
    }

    /// Shift drone ids into the block owned by `batch`.
    ///
    /// Each batch gets `max_id + 1` consecutive ids, so batches built from the
    /// same file never share a drone id, even when the file's ids have gaps.
    pub fn for_batch(mut self, batch: u32) -> Result<Self> {
        let Some(max_id) = self.agents.iter().map(|agent| agent.id.0).max() else {
            return Ok(self);
        };
        let offset = max_id
            .checked_add(1)
            .and_then(|span| span.checked_mul(batch))
            .with_context(|| format!("drone ids of batch {batch} overflow u32"))?;
        for agent in &mut self.agents {
            let id = agent
                .id
                .0
                .checked_add(offset)
                .with_context(|| format!("drone id {} overflows in batch {batch}", agent.id))?;
            agent.id = DroneId(id);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Formation> {
        let agents = self.agents.len();
        Formation::new(self.config, &self.agents, swarmcov_laws::reference_laws())
            .with_context(|| format!("failed to build formation of {agents} agents"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn demo_is_deterministic_per_seed() {
        let a = FormationFile::demo(6, 7, CoverageConfig::default());
        let b = FormationFile::demo(6, 7, CoverageConfig::default());
        let c = FormationFile::demo(6, 8, CoverageConfig::default());
        assert_eq!(a, b);
        assert_ne!(a.agents, c.agents);
        assert_eq!(a.config.membership.len(), 1);
        assert_eq!(a.config.membership[0].drop, DEMO_DROP.to_vec());
    }

    #[test]
    fn small_demo_has_no_removal() {
        let demo = FormationFile::demo(4, 1, CoverageConfig::default());
        assert_eq!(demo.agents.len(), 4);
        assert!(demo.config.membership.is_empty());
    }

    #[test]
    fn demo_neighbours_start_in_range() {
        let demo = FormationFile::demo(8, 3, CoverageConfig::default());
        for pair in demo.agents.windows(2) {
            let gap = pair[0].position.distance_to(pair[1].position);
            assert!(gap < demo.config.communication_radius, "gap {gap}");
        }
    }

    #[test]
    fn loads_partial_file_with_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "config": {{ "total_time": 5.0, "removed_reporting": "omit" }},
                "agents": [
                    {{ "id": 4, "position": {{ "x": 0.0, "y": 0.5 }} }},
                    {{ "id": 9, "position": {{ "x": 0.0, "y": 0.9 }} }}
                ]
            }}"#
        )?;
        let loaded = FormationFile::load(file.path())?;
        assert_eq!(loaded.config.total_time, 5.0);
        assert_eq!(loaded.config.dt, 0.1);
        assert_eq!(loaded.agents[1].id, DroneId(9));

        let formation = loaded.build()?;
        assert_eq!(formation.horizon(), 50);
        Ok(())
    }

    #[test]
    fn rejects_invalid_config() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "config": {{ "dt": 0.0 }}, "agents": [] }}"#)?;
        let err = FormationFile::load(file.path()).expect_err("dt of zero is invalid");
        assert!(format!("{err:#}").contains("dt must be positive"));
        Ok(())
    }

    fn ids(file: &FormationFile) -> Vec<u32> {
        file.agents.iter().map(|a| a.id.0).collect()
    }

    #[test]
    fn batches_get_disjoint_id_blocks() -> Result<()> {
        let demo = FormationFile::demo(3, 0, CoverageConfig::default());
        assert_eq!(ids(&demo.clone().for_batch(0)?), vec![0, 1, 2]);
        assert_eq!(ids(&demo.for_batch(2)?), vec![6, 7, 8]);

        let mut sparse = FormationFile::demo(2, 0, CoverageConfig::default());
        sparse.agents[0].id = DroneId(0);
        sparse.agents[1].id = DroneId(10);
        let first = ids(&sparse.clone().for_batch(0)?);
        let second = ids(&sparse.for_batch(1)?);
        assert_eq!(second, vec![11, 21]);
        assert!(first.iter().all(|id| !second.contains(id)));
        Ok(())
    }

    #[test]
    fn id_overflow_is_an_error() {
        let mut file = FormationFile::demo(1, 0, CoverageConfig::default());
        file.agents[0].id = DroneId(u32::MAX / 2);
        assert!(file.clone().for_batch(1).is_ok());
        assert!(file.for_batch(3).is_err());

        let mut last = FormationFile::demo(1, 0, CoverageConfig::default());
        last.agents[0].id = DroneId(u32::MAX);
        assert!(last.for_batch(1).is_err());
    }
}
