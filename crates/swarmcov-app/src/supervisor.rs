use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use serde::Serialize;
use swarmcov_core::{BatchId, CoverageConfig, Formation};
use tracing::{debug, info, warn};

use crate::command::{MessageReceiver, StreamPublisher, WorkerMessage, create_stream, drain_pending};
use crate::worker::{BatchWorker, CancelToken, WorkerExit};

/// Timing knobs for [`Supervisor::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Longest a worker may sit on one epoch before it is cancelled.
    pub epoch_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            epoch_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub fn from_config(config: &CoverageConfig) -> Self {
        Self {
            epoch_timeout: Duration::from_millis(config.epoch_timeout_ms),
            ..Self::default()
        }
    }
}

/// Final state of one batch as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchStatus {
    Exited { exit: WorkerExit },
    /// The worker overran the epoch timeout and was abandoned.
    TimedOut { epoch: u64 },
    /// The worker's stream closed without an exit message.
    Lost,
}

/// Per-batch tally gathered from the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub batch: BatchId,
    pub status: BatchStatus,
    pub commands: usize,
    /// Coverage ratio of every reported epoch, in order.
    pub coverage: Vec<f64>,
}

impl BatchOutcome {
    fn pending(batch: BatchId) -> Self {
        Self {
            batch,
            status: BatchStatus::Lost,
            commands: 0,
            coverage: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(&self.status, BatchStatus::Exited { exit } if exit.is_completed())
    }

    /// Fraction of reported epochs with coverage at or above `threshold`.
    #[must_use]
    pub fn time_above(&self, threshold: f64) -> f64 {
        swarmcov_core::time_above(&self.coverage, threshold)
    }
}

struct Supervised {
    worker: BatchWorker,
    rx: MessageReceiver,
    outcome: BatchOutcome,
    settled: bool,
    last_epoch: u64,
    last_progress: Instant,
}

/// Launches batch workers and watches them until each has exited or timed out.
///
/// Every worker streams into its own channel, so a flooding batch never
/// delays another batch's messages.
pub struct Supervisor {
    config: SupervisorConfig,
    workers: Vec<Supervised>,
    index: HashMap<BatchId, usize>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            workers: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start `formation` on its own worker thread.
    pub fn launch(&mut self, batch: BatchId, formation: Formation) -> Result<()> {
        if self.index.contains_key(&batch) {
            bail!("batch {batch} launched twice");
        }
        let (tx, rx) = create_stream();
        let publisher = StreamPublisher::new(batch, tx);
        let worker = BatchWorker::spawn(batch, formation, publisher, CancelToken::new())?;
        debug!(batch = %batch, "batch worker launched");
        self.attach(worker, rx);
        Ok(())
    }

    fn attach(&mut self, worker: BatchWorker, rx: MessageReceiver) {
        let batch = worker.batch();
        self.index.insert(batch, self.workers.len());
        self.workers.push(Supervised {
            last_epoch: worker.progress().epoch(),
            worker,
            rx,
            outcome: BatchOutcome::pending(batch),
            settled: false,
            last_progress: Instant::now(),
        });
    }

    /// Forward every streamed message to `consumer` until all batches settle.
    ///
    /// Outcomes are returned in launch order.
    pub fn run(mut self, mut consumer: impl FnMut(WorkerMessage)) -> Vec<BatchOutcome> {
        let mut buffer = Vec::new();
        loop {
            for slot in 0..self.workers.len() {
                if self.workers[slot].settled {
                    continue;
                }
                let open = drain_pending(&self.workers[slot].rx, &mut buffer);
                for message in buffer.drain(..) {
                    self.observe(&message);
                    consumer(message);
                }
                let entry = &mut self.workers[slot];
                if !open && !entry.settled {
                    warn!(batch = %entry.outcome.batch, "result stream closed without exit status");
                    entry.settled = true;
                }
            }

            self.enforce_timeout(Instant::now());
            if self.workers.iter().all(|entry| entry.settled) {
                break;
            }
            thread::sleep(self.config.poll_interval);
        }

        self.workers
            .into_iter()
            .map(|entry| {
                match entry.outcome.status {
                    BatchStatus::TimedOut { .. } => entry.worker.detach(),
                    _ => {
                        entry.worker.join();
                    }
                }
                entry.outcome
            })
            .collect()
    }

    fn observe(&mut self, message: &WorkerMessage) {
        let Some(&slot) = self.index.get(&message.batch()) else {
            warn!(batch = %message.batch(), "message from unknown batch");
            return;
        };
        let entry = &mut self.workers[slot];
        match message {
            WorkerMessage::Command { .. } => entry.outcome.commands += 1,
            WorkerMessage::Epoch { report, .. } => entry.outcome.coverage.push(report.coverage),
            WorkerMessage::Exit { exit, .. } => {
                if !entry.settled {
                    entry.outcome.status = BatchStatus::Exited { exit: exit.clone() };
                    entry.settled = true;
                }
            }
        }
    }

    fn enforce_timeout(&mut self, now: Instant) {
        let timeout = self.config.epoch_timeout;
        for entry in self.workers.iter_mut().filter(|entry| !entry.settled) {
            let epoch = entry.worker.progress().epoch();
            if epoch != entry.last_epoch {
                entry.last_epoch = epoch;
                entry.last_progress = now;
                continue;
            }
            if entry.worker.progress().is_done() {
                continue;
            }
            let stalled = now.saturating_duration_since(entry.last_progress);
            if stalled > timeout {
                warn!(
                    batch = %entry.outcome.batch,
                    epoch,
                    stalled_ms = stalled.as_millis() as u64,
                    "epoch timeout exceeded; cancelling batch"
                );
                entry.worker.cancel();
                entry.outcome.status = BatchStatus::TimedOut { epoch };
                entry.settled = true;
            }
        }
        if self.workers.iter().all(|entry| entry.settled) {
            let completed = self
                .workers
                .iter()
                .filter(|entry| entry.outcome.is_completed())
                .count();
            info!(
                batches = self.workers.len(),
                completed, "all batches settled"
            );
        }
    }
}
