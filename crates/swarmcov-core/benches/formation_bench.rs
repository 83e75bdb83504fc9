use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::time::Duration;
use swarmcov_core::{
    AgentSpec, ConnectivityInputs, ConnectivityLaw, ControlLaws, CoverageConfig, CoverageInputs,
    CoverageLaw, DroneId, Formation, Position, Velocity,
};
use swarmcov_graph::SmoothCutoffGraph;

struct HoldCoverage;

impl CoverageLaw for HoldCoverage {
    fn kind(&self) -> &'static str {
        "hold"
    }

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity> {
        inputs
            .lateral_velocities
            .iter()
            .map(|&vy| Velocity::new(inputs.max_speed, vy))
            .collect()
    }
}

struct FiedlerNudge;

impl ConnectivityLaw for FiedlerNudge {
    fn kind(&self) -> &'static str {
        "fiedler-nudge"
    }

    fn velocities(&mut self, inputs: &ConnectivityInputs<'_>) -> Vec<Velocity> {
        inputs
            .fiedler_vector
            .iter()
            .map(|&component| Velocity::new(0.0, -component * inputs.fiedler_value))
            .collect()
    }
}

fn formation(agents: usize) -> Formation {
    let config = CoverageConfig {
        launch_interval: 0.0,
        total_time: 100.0,
        ..CoverageConfig::default()
    };
    let specs: Vec<AgentSpec> = (0..agents)
        .map(|k| AgentSpec {
            id: DroneId(k as u32),
            position: Position::new(-1.0, 0.5 + 0.8 * (k as f64 - agents as f64 / 2.0)),
        })
        .collect();
    let laws = ControlLaws {
        graph: Box::new(SmoothCutoffGraph::new()),
        coverage: Box::new(HoldCoverage),
        connectivity: Box::new(FiedlerNudge),
    };
    Formation::new(config, &specs, laws).expect("formation")
}

fn bench_formation_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("formation_step");
    let samples: usize = std::env::var("SWARMCOV_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    group.sample_size(samples);
    group.measurement_time(Duration::from_secs(5));
    let steps = 64;
    for agents in [6_usize, 24, 96] {
        group.bench_function(format!("steps{steps}_agents{agents}"), |b| {
            b.iter_batched(
                || formation(agents),
                |mut formation| {
                    for _ in 0..steps {
                        let _ = formation.step().expect("step");
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_formation_steps);
criterion_main!(benches);
