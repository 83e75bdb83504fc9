use crossfire::mpmc;
use crossfire::{MRx, MTx, TryRecvError, detect_backoff_cfg};
use swarmcov_core::{BatchId, CommandSink, ControlCommand, EpochReport};
use tracing::warn;

use crate::worker::WorkerExit;

/// Everything a batch worker streams back to the consumer.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Command {
        batch: BatchId,
        command: ControlCommand,
    },
    Epoch {
        batch: BatchId,
        report: EpochReport,
    },
    /// Last message of a batch.
    Exit { batch: BatchId, exit: WorkerExit },
}

impl WorkerMessage {
    #[must_use]
    pub fn batch(&self) -> BatchId {
        match self {
            Self::Command { batch, .. } | Self::Epoch { batch, .. } | Self::Exit { batch, .. } => {
                *batch
            }
        }
    }
}

pub type MessageSender = MTx<WorkerMessage>;
pub type MessageReceiver = MRx<WorkerMessage>;

/// Unbounded stream; publishing never blocks the stepper.
pub fn create_stream() -> (MessageSender, MessageReceiver) {
    detect_backoff_cfg();
    mpmc::unbounded_blocking()
}

/// [`CommandSink`] forwarding a formation's output onto a stream.
#[derive(Clone)]
pub struct StreamPublisher {
    batch: BatchId,
    tx: MessageSender,
}

impl StreamPublisher {
    #[must_use]
    pub fn new(batch: BatchId, tx: MessageSender) -> Self {
        Self { batch, tx }
    }

    #[must_use]
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    /// Send the worker's final message.
    pub fn exit(&self, exit: WorkerExit) {
        let batch = self.batch;
        if self.tx.send(WorkerMessage::Exit { batch, exit }).is_err() {
            warn!(batch = %batch, "result stream disconnected; exit status dropped");
        }
    }
}

impl CommandSink for StreamPublisher {
    fn publish(&mut self, command: ControlCommand) {
        let batch = self.batch;
        if self
            .tx
            .send(WorkerMessage::Command { batch, command })
            .is_err()
        {
            warn!(
                batch = %batch,
                epoch = command.epoch.0,
                drone = %command.drone,
                "result stream disconnected; command dropped"
            );
        }
    }

    fn on_epoch(&mut self, report: &EpochReport) {
        let batch = self.batch;
        let message = WorkerMessage::Epoch {
            batch,
            report: report.clone(),
        };
        if self.tx.send(message).is_err() {
            warn!(
                batch = %batch,
                epoch = report.epoch.0,
                "result stream disconnected; epoch report dropped"
            );
        }
    }
}

/// Pull every message currently queued. Returns `false` once all senders are gone.
pub fn drain_pending(receiver: &MessageReceiver, out: &mut Vec<WorkerMessage>) -> bool {
    loop {
        match receiver.try_recv() {
            Ok(message) => out.push(message),
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

/// Order commands by epoch, then drone, keeping arrival order for ties.
pub fn sort_commands(commands: &mut [ControlCommand]) {
    commands.sort_by_key(|command| (command.epoch, command.drone));
}
