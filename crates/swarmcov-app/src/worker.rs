//! One OS thread per launch batch, isolated behind `catch_unwind`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::Serialize;
use swarmcov_core::{BatchId, EpochOutcome, Formation, RunSummary};
use tracing::{debug, error, info, warn};

use crate::command::StreamPublisher;

const THREAD_PREFIX: &str = "swarmcov-batch-";

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Route panics on batch threads into a per-thread backtrace slot; other
/// threads keep the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let on_worker = thread::current()
                .name()
                .is_some_and(|name| name.starts_with(THREAD_PREFIX));
            if on_worker {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// How a batch worker ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerExit {
    Completed { summary: RunSummary },
    Faulted { epoch: u64, error: String },
    Panicked { epoch: u64, message: String },
    Cancelled { epoch: u64 },
}

impl WorkerExit {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Cooperative cancellation flag, checked between epochs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Progress counters a worker publishes for its supervisor.
#[derive(Debug, Default)]
pub struct WorkerProgress {
    epoch: AtomicU64,
    done: AtomicBool,
}

impl WorkerProgress {
    /// Next epoch the worker will step.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn advance(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
    }
}

/// Handle to a formation stepping on its own thread.
pub struct BatchWorker {
    batch: BatchId,
    cancel: CancelToken,
    progress: Arc<WorkerProgress>,
    handle: Option<JoinHandle<WorkerExit>>,
}

impl BatchWorker {
    /// Start stepping `formation` until it finishes, faults or is cancelled.
    ///
    /// Every command and epoch report goes through `publisher`, followed by a
    /// final [`WorkerExit`].
    pub fn spawn(
        batch: BatchId,
        mut formation: Formation,
        publisher: StreamPublisher,
        cancel: CancelToken,
    ) -> Result<Self> {
        install_panic_hook();
        let progress = Arc::new(WorkerProgress::default());
        progress.advance(formation.epoch().0);

        let exit_publisher = publisher.clone();
        formation.set_sink(Box::new(publisher));
        let thread_progress = Arc::clone(&progress);
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("{THREAD_PREFIX}{batch}"))
            .spawn(move || {
                let exit = run_batch(batch, &mut formation, &thread_cancel, &thread_progress);
                thread_progress.finish();
                exit_publisher.exit(exit.clone());
                exit
            })
            .with_context(|| format!("failed to spawn worker thread for batch {batch}"))?;

        Ok(Self {
            batch,
            cancel,
            progress,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn progress(&self) -> &WorkerProgress {
        &self.progress
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the thread and return its exit status.
    pub fn join(mut self) -> WorkerExit {
        let epoch = self.progress.epoch();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|payload| WorkerExit::Panicked {
                epoch,
                message: panic_message(payload.as_ref()),
            }),
            None => WorkerExit::Cancelled { epoch },
        }
    }

    /// Stop tracking the thread without waiting for it.
    pub fn detach(mut self) {
        self.cancel.cancel();
        self.handle.take();
    }
}

fn run_batch(
    batch: BatchId,
    formation: &mut Formation,
    cancel: &CancelToken,
    progress: &WorkerProgress,
) -> WorkerExit {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut summary = RunSummary::default();
        loop {
            let epoch = formation.epoch().0;
            if cancel.is_cancelled() {
                warn!(batch = %batch, epoch, "batch cancelled");
                return WorkerExit::Cancelled { epoch };
            }
            match formation.step() {
                Ok(EpochOutcome::Advanced(report)) => summary.absorb(&report, false),
                Ok(EpochOutcome::Degenerate { report, degeneracy }) => {
                    warn!(
                        batch = %batch,
                        epoch,
                        ?degeneracy,
                        active = report.active,
                        "communication graph degenerate"
                    );
                    summary.absorb(&report, true);
                }
                Ok(EpochOutcome::Finished(reason)) => {
                    summary.finish = Some(reason);
                    info!(
                        batch = %batch,
                        epochs = summary.epochs,
                        commands = summary.commands,
                        degenerate = summary.degenerate_epochs,
                        min_fiedler = ?summary.min_fiedler,
                        ?reason,
                        "batch completed"
                    );
                    return WorkerExit::Completed { summary };
                }
                Err(err) => {
                    error!(
                        batch = %batch,
                        epoch,
                        error = %err,
                        backtrace = %Backtrace::force_capture(),
                        "batch faulted"
                    );
                    return WorkerExit::Faulted {
                        epoch,
                        error: err.to_string(),
                    };
                }
            }
            progress.advance(formation.epoch().0);
        }
    }));

    outcome.unwrap_or_else(|payload| {
        let epoch = formation.epoch().0;
        let message = panic_message(payload.as_ref());
        let backtrace = PANIC_TRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| "backtrace unavailable".to_string());
        error!(batch = %batch, epoch, %message, %backtrace, "batch panicked");
        debug!(batch = %batch, "worker state discarded after panic");
        WorkerExit::Panicked { epoch, message }
    })
}
