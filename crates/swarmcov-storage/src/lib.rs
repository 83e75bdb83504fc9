//! DuckDB-backed record and replay of formation commands.

#[cfg(target_os = "windows")]
#[link(name = "rstrtmgr")]
unsafe extern "system" {}

use duckdb::{Connection, Transaction, params};
use std::{
    path::Path,
    sync::mpsc,
    thread,
};
use swarmcov_core::{
    BatchId, CommandSink, ControlCommand, DroneId, Epoch, EpochReport, Position, Velocity,
};
use thiserror::Error;
use tracing::{error, warn};

const DEFAULT_COMMAND_BUFFER: usize = 1024;
const DEFAULT_EPOCH_BUFFER: usize = 64;

const COMMAND_SELECT: &str = "select batch, epoch, drone, position_x, position_y, heading,
        velocity_x, velocity_y
     from commands";

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
struct CommandRow {
    batch: i64,
    epoch: i64,
    drone: i64,
    position_x: f64,
    position_y: f64,
    heading: f64,
    velocity_x: f64,
    velocity_y: f64,
}

impl CommandRow {
    fn new(batch: BatchId, command: &ControlCommand) -> Self {
        Self {
            batch: i64::from(batch.0),
            epoch: command.epoch.0 as i64,
            drone: i64::from(command.drone.0),
            position_x: command.position.x,
            position_y: command.position.y,
            heading: command.heading,
            velocity_x: command.velocity.vx,
            velocity_y: command.velocity.vy,
        }
    }
}

#[derive(Debug, Clone)]
struct EpochRow {
    batch: i64,
    epoch: i64,
    live: i64,
    active: i64,
    fiedler: Option<f64>,
    coverage: f64,
    commands: i64,
    departed: String,
}

impl EpochRow {
    fn new(batch: BatchId, report: &EpochReport) -> Self {
        let departed = report
            .departed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Self {
            batch: i64::from(batch.0),
            epoch: report.epoch.0 as i64,
            live: report.live as i64,
            active: report.active as i64,
            fiedler: report.fiedler_value,
            coverage: report.coverage,
            commands: report.commands as i64,
            departed,
        }
    }
}

#[derive(Debug, Default)]
struct StoreBuffer {
    commands: Vec<CommandRow>,
    epochs: Vec<EpochRow>,
}

impl StoreBuffer {
    fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.epochs.is_empty()
    }

    fn clear(&mut self) {
        self.commands.clear();
        self.epochs.clear();
    }
}

/// A command read back from storage, tagged with its batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedCommand {
    pub batch: BatchId,
    pub command: ControlCommand,
}

/// Per-batch aggregates over the `epochs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub batch: BatchId,
    pub epochs: i64,
    pub commands: i64,
    pub last_epoch: Option<i64>,
    pub min_fiedler: Option<f64>,
    pub mean_coverage: Option<f64>,
}

/// DuckDB command store with buffered writes.
pub struct CommandStore {
    conn: Connection,
    buffer: StoreBuffer,
    batch: BatchId,
    command_flush_threshold: usize,
    epoch_flush_threshold: usize,
}

impl CommandStore {
    /// Open or create a database at `path` with default buffering thresholds.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_thresholds(path, DEFAULT_COMMAND_BUFFER, DEFAULT_EPOCH_BUFFER)
    }

    /// Open or create a database at `path`, flushing after `commands` command
    /// rows or `epochs` epoch rows are buffered.
    pub fn with_thresholds(
        path: impl AsRef<Path>,
        commands: usize,
        epochs: usize,
    ) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, commands, epochs)
    }

    /// Transient in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(
            Connection::open_in_memory()?,
            DEFAULT_COMMAND_BUFFER,
            DEFAULT_EPOCH_BUFFER,
        )
    }

    fn from_connection(
        conn: Connection,
        commands: usize,
        epochs: usize,
    ) -> Result<Self, StorageError> {
        let mut store = Self {
            conn,
            buffer: StoreBuffer::default(),
            batch: BatchId::default(),
            command_flush_threshold: commands.max(1),
            epoch_flush_threshold: epochs.max(1),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "create table if not exists commands (
                batch bigint not null,
                epoch bigint not null,
                drone bigint not null,
                position_x double not null,
                position_y double not null,
                heading double not null,
                velocity_x double not null,
                velocity_y double not null,
                primary key (batch, epoch, drone)
            );
            create table if not exists epochs (
                batch bigint not null,
                epoch bigint not null,
                live bigint not null,
                active bigint not null,
                fiedler double,
                coverage double not null,
                commands bigint not null,
                departed varchar not null,
                primary key (batch, epoch)
            );",
        )?;
        Ok(())
    }

    /// Batch that [`CommandSink`] writes are attributed to.
    #[must_use]
    pub const fn batch(&self) -> BatchId {
        self.batch
    }

    pub fn select_batch(&mut self, batch: BatchId) {
        self.batch = batch;
    }

    /// Buffer one command for `batch`.
    pub fn record_command(
        &mut self,
        batch: BatchId,
        command: &ControlCommand,
    ) -> Result<(), StorageError> {
        self.buffer.commands.push(CommandRow::new(batch, command));
        self.maybe_flush()
    }

    /// Buffer one epoch summary for `batch`.
    pub fn record_epoch(
        &mut self,
        batch: BatchId,
        report: &EpochReport,
    ) -> Result<(), StorageError> {
        self.buffer.epochs.push(EpochRow::new(batch, report));
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.commands.len() >= self.command_flush_threshold
            || self.buffer.epochs.len() >= self.epoch_flush_threshold
        {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_commands(tx: &Transaction<'_>, rows: &[CommandRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into commands (
                batch, epoch, drone, position_x, position_y, heading, velocity_x, velocity_y
            ) values (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.batch,
                row.epoch,
                row.drone,
                row.position_x,
                row.position_y,
                row.heading,
                row.velocity_x,
                row.velocity_y,
            ])?;
        }
        Ok(())
    }

    fn insert_epochs(tx: &Transaction<'_>, rows: &[EpochRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into epochs (
                batch, epoch, live, active, fiedler, coverage, commands, departed
            ) values (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.batch,
                row.epoch,
                row.live,
                row.active,
                row.fiedler,
                row.coverage,
                row.commands,
                row.departed,
            ])?;
        }
        Ok(())
    }

    /// Force buffered rows to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::insert_commands(&tx, &self.buffer.commands)?;
        Self::insert_epochs(&tx, &self.buffer.epochs)?;
        tx.commit()?;
        self.buffer.clear();
        Ok(())
    }

    /// Recorded commands ordered by batch, epoch and drone; all batches when `batch` is `None`.
    pub fn load_commands(
        &mut self,
        batch: Option<BatchId>,
    ) -> Result<Vec<RecordedCommand>, StorageError> {
        self.flush()?;
        let mut commands = Vec::new();
        match batch {
            Some(batch) => {
                let mut stmt = self.conn.prepare(&format!(
                    "{COMMAND_SELECT} where batch = ? order by epoch, drone"
                ))?;
                let mut rows = stmt.query(params![i64::from(batch.0)])?;
                while let Some(row) = rows.next()? {
                    commands.push(recorded_from_row(row)?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{COMMAND_SELECT} order by batch, epoch, drone"))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    commands.push(recorded_from_row(row)?);
                }
            }
        }
        Ok(commands)
    }

    /// Aggregates per recorded batch, ordered by batch.
    pub fn batch_summaries(&mut self) -> Result<Vec<BatchSummary>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select batch,
                    count(*) as epochs,
                    cast(sum(commands) as bigint) as commands,
                    max(epoch) as last_epoch,
                    min(fiedler) as min_fiedler,
                    avg(coverage) as mean_coverage
             from epochs
             group by batch
             order by batch",
        )?;
        let mut rows = stmt.query([])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(BatchSummary {
                batch: BatchId(row.get::<_, i64>(0)? as u32),
                epochs: row.get(1)?,
                commands: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                last_epoch: row.get(3)?,
                min_fiedler: row.get(4)?,
                mean_coverage: row.get(5)?,
            });
        }
        Ok(summaries)
    }
}

fn recorded_from_row(row: &duckdb::Row<'_>) -> Result<RecordedCommand, duckdb::Error> {
    Ok(RecordedCommand {
        batch: BatchId(row.get::<_, i64>(0)? as u32),
        command: ControlCommand {
            epoch: Epoch(row.get::<_, i64>(1)? as u64),
            drone: DroneId(row.get::<_, i64>(2)? as u32),
            position: Position::new(row.get(3)?, row.get(4)?),
            heading: row.get(5)?,
            velocity: Velocity::new(row.get(6)?, row.get(7)?),
        },
    })
}

impl Drop for CommandStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(error = %err, "failed to flush command store on drop");
        }
    }
}

impl CommandSink for CommandStore {
    fn publish(&mut self, command: ControlCommand) {
        if let Err(err) = self.record_command(self.batch, &command) {
            warn!(
                batch = %self.batch,
                epoch = command.epoch.0,
                error = %err,
                "failed to record command"
            );
        }
    }

    fn on_epoch(&mut self, report: &EpochReport) {
        if let Err(err) = self.record_epoch(self.batch, report) {
            warn!(
                batch = %self.batch,
                epoch = report.epoch.0,
                error = %err,
                "failed to record epoch summary"
            );
        }
    }
}

#[derive(Debug)]
enum StoreCommand {
    Command(BatchId, ControlCommand),
    Epoch(BatchId, EpochReport),
    Flush,
    Shutdown,
}

/// Background writer owning a [`CommandStore`].
pub struct StorePipeline {
    tx: mpsc::Sender<StoreCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StorePipeline {
    /// Create a pipeline writing to `path` with default buffering thresholds.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_store(CommandStore::open(path)?)
    }

    /// Create a pipeline with explicit thresholds.
    pub fn with_thresholds(
        path: impl AsRef<Path>,
        commands: usize,
        epochs: usize,
    ) -> Result<Self, StorageError> {
        Self::from_store(CommandStore::with_thresholds(path, commands, epochs)?)
    }

    pub fn from_store(store: CommandStore) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel::<StoreCommand>();
        let handle = thread::Builder::new()
            .name("swarmcov-store-writer".into())
            .spawn(move || {
                let mut store = store;
                while let Ok(command) = rx.recv() {
                    let result = match command {
                        StoreCommand::Command(batch, command) => {
                            store.record_command(batch, &command)
                        }
                        StoreCommand::Epoch(batch, report) => store.record_epoch(batch, &report),
                        StoreCommand::Flush => store.flush(),
                        StoreCommand::Shutdown => {
                            if let Err(err) = store.flush() {
                                error!(error = %err, "failed to flush command store on shutdown");
                            }
                            break;
                        }
                    };
                    if let Err(err) = result {
                        error!(error = %err, "command store write failed");
                    }
                }
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn store writer thread: {err}"))
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Request an immediate flush of buffered rows.
    pub fn flush(&self) {
        let _ = self.tx.send(StoreCommand::Flush);
    }

    pub fn record_command(&self, batch: BatchId, command: ControlCommand) {
        if self.tx.send(StoreCommand::Command(batch, command)).is_err() {
            warn!(batch = %batch, epoch = command.epoch.0, "store writer closed; command dropped");
        }
    }

    pub fn record_epoch(&self, batch: BatchId, report: EpochReport) {
        let epoch = report.epoch.0;
        if self.tx.send(StoreCommand::Epoch(batch, report)).is_err() {
            warn!(batch = %batch, epoch, "store writer closed; epoch summary dropped");
        }
    }

    /// A [`CommandSink`] feeding this pipeline under `batch`.
    #[must_use]
    pub fn sink(&self, batch: BatchId) -> PipelineSink {
        PipelineSink {
            tx: self.tx.clone(),
            batch,
        }
    }
}

impl Drop for StorePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(StoreCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            error!(?err, "store writer thread panicked");
        }
    }
}

/// Sink handle forwarding to a [`StorePipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSink {
    tx: mpsc::Sender<StoreCommand>,
    batch: BatchId,
}

impl CommandSink for PipelineSink {
    fn publish(&mut self, command: ControlCommand) {
        if self.tx.send(StoreCommand::Command(self.batch, command)).is_err() {
            warn!(
                batch = %self.batch,
                epoch = command.epoch.0,
                "store writer closed; command dropped"
            );
        }
    }

    fn on_epoch(&mut self, report: &EpochReport) {
        if self
            .tx
            .send(StoreCommand::Epoch(self.batch, report.clone()))
            .is_err()
        {
            warn!(
                batch = %self.batch,
                epoch = report.epoch.0,
                "store writer closed; epoch summary dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(drone: u32, epoch: u64, x: f64) -> ControlCommand {
        ControlCommand {
            drone: DroneId(drone),
            epoch: Epoch(epoch),
            position: Position::new(x, 0.5),
            heading: 0.1,
            velocity: Velocity::new(0.2, 0.02),
        }
    }

    fn report(epoch: u64, fiedler: Option<f64>, coverage: f64) -> EpochReport {
        EpochReport {
            epoch: Epoch(epoch),
            live: 2,
            active: 2,
            fiedler_value: fiedler,
            coverage,
            commands: 2,
            departed: vec![DroneId(4), DroneId(5)],
        }
    }

    #[test]
    fn commands_load_back_in_epoch_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut store = CommandStore::with_thresholds(dir.path().join("commands.duckdb"), 2, 2)?;

        store.record_command(BatchId(1), &command(2, 1, 0.4))?;
        store.record_command(BatchId(1), &command(1, 1, 0.3))?;
        store.record_command(BatchId(0), &command(7, 0, 0.1))?;
        store.record_command(BatchId(1), &command(1, 0, 0.2))?;

        let all = store.load_commands(None)?;
        let keys: Vec<(u32, u64, u32)> = all
            .iter()
            .map(|r| (r.batch.0, r.command.epoch.0, r.command.drone.0))
            .collect();
        assert_eq!(keys, vec![(0, 0, 7), (1, 0, 1), (1, 1, 1), (1, 1, 2)]);
        assert_eq!(all[2].command, command(1, 1, 0.3));

        let only = store.load_commands(Some(BatchId(0)))?;
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].command.position, Position::new(0.1, 0.5));
        Ok(())
    }

    #[test]
    fn epoch_summaries_aggregate_per_batch() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = CommandStore::open_in_memory()?;
        store.record_epoch(BatchId(3), &report(0, None, 0.1))?;
        store.record_epoch(BatchId(3), &report(1, Some(0.4), 0.3))?;
        store.record_epoch(BatchId(3), &report(2, Some(0.2), 0.5))?;

        let summaries = store.batch_summaries()?;
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.batch, BatchId(3));
        assert_eq!(summary.epochs, 3);
        assert_eq!(summary.commands, 6);
        assert_eq!(summary.last_epoch, Some(2));
        assert_eq!(summary.min_fiedler, Some(0.2));
        assert!((summary.mean_coverage.expect("coverage") - 0.3).abs() < 1e-12);

        let departed: String =
            store
                .conn
                .query_row("select departed from epochs where epoch = 1", [], |row| {
                    row.get(0)
                })?;
        assert_eq!(departed, "4,5");
        Ok(())
    }

    #[test]
    fn store_acts_as_command_sink() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = CommandStore::open_in_memory()?;
        store.select_batch(BatchId(9));
        store.publish(command(1, 0, 1.0));
        store.on_epoch(&report(0, Some(0.5), 0.2));

        let loaded = store.load_commands(Some(BatchId(9)))?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.batch_summaries()?[0].batch, BatchId(9));
        Ok(())
    }

    #[test]
    fn pipeline_writes_through_on_flush() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipeline.duckdb");
        {
            let pipeline = StorePipeline::with_thresholds(&path, 1_000, 1_000)?;
            pipeline.record_command(BatchId(2), command(0, 0, 0.1));
            pipeline.record_command(BatchId(2), command(1, 0, 0.2));
            pipeline.record_epoch(BatchId(2), report(0, Some(0.3), 0.4));
            pipeline.flush();
            pipeline.record_command(BatchId(2), command(0, 1, 0.3));
        }

        let mut store = CommandStore::open(&path)?;
        assert_eq!(store.load_commands(Some(BatchId(2)))?.len(), 3);
        let summaries = store.batch_summaries()?;
        assert_eq!(summaries[0].epochs, 1);
        assert_eq!(summaries[0].min_fiedler, Some(0.3));
        Ok(())
    }
}
