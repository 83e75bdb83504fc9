use std::thread;
use std::time::{Duration, Instant};

use swarmcov_app::{
    BatchStatus, BatchWorker, CancelToken, FormationFile, StreamPublisher, Supervisor,
    SupervisorConfig, WorkerExit, WorkerMessage, create_stream, drain_pending, sort_commands,
};
use swarmcov_core::{
    AgentSpec, BatchId, ConnectivityInputs, ConnectivityLaw, ControlLaws, CoverageConfig,
    CoverageInputs, CoverageLaw, DroneId, FinishReason, Formation, Position, Velocity,
};
use swarmcov_graph::SmoothCutoffGraph;

struct Cruise;

impl CoverageLaw for Cruise {
    fn kind(&self) -> &'static str {
        "cruise"
    }

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity> {
        vec![Velocity::new(inputs.max_speed, 0.0); inputs.positions.len()]
    }
}

struct PanicAfter(usize);

impl CoverageLaw for PanicAfter {
    fn kind(&self) -> &'static str {
        "panic-after"
    }

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity> {
        if self.0 == 0 {
            panic!("coverage law exploded");
        }
        self.0 -= 1;
        vec![Velocity::new(inputs.max_speed, 0.0); inputs.positions.len()]
    }
}

struct NotANumber;

impl CoverageLaw for NotANumber {
    fn kind(&self) -> &'static str {
        "nan"
    }

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity> {
        vec![Velocity::new(inputs.max_speed, f64::NAN); inputs.positions.len()]
    }
}

struct Sleepy(Duration);

impl CoverageLaw for Sleepy {
    fn kind(&self) -> &'static str {
        "sleepy"
    }

    fn velocities(&mut self, inputs: &CoverageInputs<'_>) -> Vec<Velocity> {
        thread::sleep(self.0);
        vec![Velocity::new(inputs.max_speed, 0.0); inputs.positions.len()]
    }
}

struct Idle;

impl ConnectivityLaw for Idle {
    fn kind(&self) -> &'static str {
        "idle"
    }

    fn velocities(&mut self, inputs: &ConnectivityInputs<'_>) -> Vec<Velocity> {
        vec![Velocity::zero(); inputs.positions.len()]
    }
}

fn formation(coverage: Box<dyn CoverageLaw>, total_time: f64) -> Formation {
    let config = CoverageConfig {
        launch_interval: 0.0,
        total_time,
        ..CoverageConfig::default()
    };
    let agents: Vec<AgentSpec> = (0..3)
        .map(|k| AgentSpec {
            id: DroneId(k),
            position: Position::new(0.0, 0.1 + 0.4 * k as f64),
        })
        .collect();
    let laws = ControlLaws {
        graph: Box::new(SmoothCutoffGraph::new()),
        coverage,
        connectivity: Box::new(Idle),
    };
    Formation::new(config, &agents, laws).expect("formation")
}

fn quick_config() -> SupervisorConfig {
    SupervisorConfig {
        epoch_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(1),
    }
}

#[test]
fn panicking_batch_does_not_disturb_its_sibling() {
    let mut supervisor = Supervisor::new(quick_config());
    supervisor
        .launch(BatchId(0), formation(Box::new(PanicAfter(3)), 1.0))
        .expect("launch panicking batch");
    supervisor
        .launch(BatchId(1), formation(Box::new(Cruise), 1.0))
        .expect("launch healthy batch");

    let mut healthy_commands = Vec::new();
    let outcomes = supervisor.run(|message| {
        if let WorkerMessage::Command { batch, command } = message
            && batch == BatchId(1)
        {
            healthy_commands.push(command);
        }
    });

    assert_eq!(outcomes.len(), 2);
    match &outcomes[0].status {
        BatchStatus::Exited {
            exit: WorkerExit::Panicked { epoch, message },
        } => {
            assert_eq!(*epoch, 3);
            assert!(message.contains("exploded"));
        }
        other => panic!("unexpected status {other:?}"),
    }
    // Commands emitted before the panic stay emitted.
    assert_eq!(outcomes[0].commands, 9);

    assert!(outcomes[1].is_completed());
    assert_eq!(outcomes[1].coverage.len(), 10);
    assert_eq!(healthy_commands.len(), 30);

    let mut sorted = healthy_commands.clone();
    sort_commands(&mut sorted);
    assert_eq!(sorted, healthy_commands);
}

#[test]
fn non_finite_state_faults_only_that_batch() {
    let mut supervisor = Supervisor::new(quick_config());
    supervisor
        .launch(BatchId(7), formation(Box::new(NotANumber), 1.0))
        .expect("launch");
    supervisor
        .launch(BatchId(8), formation(Box::new(Cruise), 0.5))
        .expect("launch");
    let outcomes = supervisor.run(|_| {});

    match &outcomes[0].status {
        BatchStatus::Exited {
            exit: WorkerExit::Faulted { epoch, error },
        } => {
            assert_eq!(*epoch, 0);
            assert!(error.contains("non-finite"), "{error}");
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(outcomes[0].commands, 0);
    match &outcomes[1].status {
        BatchStatus::Exited {
            exit: WorkerExit::Completed { summary },
        } => {
            assert_eq!(summary.epochs, 5);
            assert_eq!(summary.finish, Some(FinishReason::Horizon));
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[test]
fn stalled_batch_is_cancelled_after_the_epoch_timeout() {
    let config = SupervisorConfig {
        epoch_timeout: Duration::from_millis(150),
        poll_interval: Duration::from_millis(2),
    };
    let mut supervisor = Supervisor::new(config);
    supervisor
        .launch(
            BatchId(0),
            formation(Box::new(Sleepy(Duration::from_secs(2))), 100.0),
        )
        .expect("launch slow batch");
    supervisor
        .launch(BatchId(1), formation(Box::new(Cruise), 1.0))
        .expect("launch healthy batch");

    let started = Instant::now();
    let outcomes = supervisor.run(|_| {});
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(outcomes[0].status, BatchStatus::TimedOut { epoch: 0 });
    assert!(outcomes[1].is_completed());
}

#[test]
fn cancelled_worker_stops_between_epochs() {
    let (tx, rx) = create_stream();
    let cancel = CancelToken::new();
    cancel.cancel();
    let worker = BatchWorker::spawn(
        BatchId(2),
        formation(Box::new(Cruise), 10.0),
        StreamPublisher::new(BatchId(2), tx),
        cancel,
    )
    .expect("spawn");
    assert_eq!(worker.batch(), BatchId(2));

    let exit = worker.join();
    assert_eq!(exit, WorkerExit::Cancelled { epoch: 0 });

    let mut messages = Vec::new();
    assert!(!drain_pending(&rx, &mut messages));
    assert_eq!(messages.len(), 1);
    assert!(matches!(
        &messages[0],
        WorkerMessage::Exit {
            exit: WorkerExit::Cancelled { .. },
            ..
        }
    ));
}

#[test]
fn demo_formation_runs_through_the_removal() {
    let mut file = FormationFile::demo(6, 11, CoverageConfig::default());
    file.config.total_time = 12.0;
    let mut supervisor = Supervisor::new(quick_config());
    supervisor
        .launch(BatchId(0), file.build().expect("build"))
        .expect("launch");

    let mut departed = Vec::new();
    let outcomes = supervisor.run(|message| {
        if let WorkerMessage::Epoch { report, .. } = message {
            departed.extend(report.departed);
        }
    });

    assert!(outcomes[0].is_completed());
    assert_eq!(outcomes[0].coverage.len(), 120);
    assert_eq!(departed, vec![DroneId(2), DroneId(3), DroneId(4)]);
    // Frozen reporting keeps all six drones on the stream.
    assert_eq!(outcomes[0].commands, 120 * 6);
}
