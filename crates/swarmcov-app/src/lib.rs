//! Batch runner plumbing: result streaming, fault-isolated workers and the
//! supervisor that enforces the per-epoch timeout.

pub mod command;
pub mod formation;
pub mod supervisor;
pub mod worker;

pub use command::{
    MessageReceiver, MessageSender, StreamPublisher, WorkerMessage, create_stream, drain_pending,
    sort_commands,
};
pub use formation::FormationFile;
pub use supervisor::{BatchOutcome, BatchStatus, Supervisor, SupervisorConfig};
pub use worker::{BatchWorker, CancelToken, WorkerExit, WorkerProgress};
