//! Partition assembly
//!
//! Opening a partition runs, in order:
//!
//! 1. Recovery of the runtime directory from the newest snapshot that opens
//! 2. Opening the state database (fresh if there was no snapshot)
//! 3. Opening the log stream, its commit position at least the recovered
//!    snapshot position, and its appender
//! 4. Starting the snapshot director
//!
//! Recovery exhaustion aborts the open; it is never treated as an empty
//! partition.

use std::sync::Arc;

use tracing::{info, warn};

use partstate_core::{ConfigError, PartitionConfig, Position, SnapshotRestoreInfo};
use partstate_durability::{
    SnapshotDirector, SnapshotDirectorHandle, SnapshotError, StateSnapshotController, StateStorage,
};
use partstate_logstream::{FsLogStorage, LogStream, LogStreamError};
use partstate_scheduler::{ActorError, ActorScheduler};
use partstate_storage::{DbOptions, StateDb, TableDbFactory};

/// Errors opening, running or closing a partition.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Snapshot, recovery or state database failure
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Log stream failure
    #[error(transparent)]
    LogStream(#[from] LogStreamError),

    /// Scheduler failure
    #[error(transparent)]
    Actor(#[from] ActorError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for partition operations
pub type PartitionResult<T> = Result<T, PartitionError>;

/// An open partition: state database, snapshots, log stream, snapshot director.
pub struct Partition {
    config: PartitionConfig,
    controller: Arc<StateSnapshotController>,
    db: Arc<StateDb>,
    stream: LogStream,
    director: SnapshotDirectorHandle,
    recovered_position: Option<Position>,
}

impl Partition {
    /// A scheduler sized by `config.scheduler_threads`.
    pub fn scheduler(config: &PartitionConfig) -> PartitionResult<ActorScheduler> {
        config.validate()?;
        let scheduler = ActorScheduler::builder()
            .name("partition")
            .thread_count(config.scheduler_threads)
            .build()?;
        Ok(scheduler)
    }

    /// Recover and open the partition described by `config`.
    pub fn open(config: PartitionConfig, scheduler: &ActorScheduler) -> PartitionResult<Self> {
        config.validate()?;

        let storage = StateStorage::new(config.runtime_directory(), config.snapshots_directory())?;
        let factory = Arc::new(TableDbFactory::new(
            DbOptions::default().with_table_size_limit(config.table_size_limit as usize),
        ));
        let controller = Arc::new(StateSnapshotController::new(
            storage,
            factory,
            config.max_snapshots,
        )?);

        let recovered_position = controller.recover()?;
        let db = controller.open_db()?;

        let log = Arc::new(FsLogStorage::open(config.log_directory(), config.log_segment_size)?);
        let mut builder = LogStream::builder(log);
        if let Some(position) = recovered_position {
            builder = builder.commit_position(position);
        }
        let stream = builder.build(scheduler)?;
        stream.open_appender().join()??;

        let commit = stream.clone();
        let director = SnapshotDirector::new(
            controller.clone(),
            move || commit.commit_position(),
            config.snapshot_period(),
        )
        .start(scheduler)?;

        info!(
            target: "partstate::recovery",
            data_dir = %config.data_dir.display(),
            recovered_position = ?recovered_position,
            commit_position = ?stream.commit_position(),
            "Opened partition"
        );
        Ok(Partition {
            config,
            controller,
            db,
            stream,
            director,
            recovered_position,
        })
    }

    /// Configuration the partition was opened with.
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// The live state database.
    pub fn db(&self) -> &Arc<StateDb> {
        &self.db
    }

    /// The partition's log stream.
    pub fn log_stream(&self) -> &LogStream {
        &self.stream
    }

    /// The snapshot controller.
    pub fn snapshot_controller(&self) -> &Arc<StateSnapshotController> {
        &self.controller
    }

    /// Handle of the running snapshot director.
    pub fn snapshot_director(&self) -> &SnapshotDirectorHandle {
        &self.director
    }

    /// Position of the snapshot the state was recovered from.
    pub fn recovered_position(&self) -> Option<Position> {
        self.recovered_position
    }

    /// Snapshot at the current commit position now.
    ///
    /// Returns the snapshot position, or `None` if nothing was committed
    /// since the last snapshot.
    pub fn snapshot_now(&self) -> PartitionResult<Option<Position>> {
        Ok(self.director.snapshot_now().join()??)
    }

    /// Restore info of the newest valid snapshot.
    pub fn restore_info(&self) -> PartitionResult<SnapshotRestoreInfo> {
        Ok(self.controller.latest_snapshot_restore_info()?)
    }

    /// Stop the director, close the log stream and the state database.
    pub fn close(self) -> PartitionResult<()> {
        if let Err(e) = self.director.close().join() {
            warn!(target: "partstate::snapshot", error = %e, "Snapshot director did not close cleanly");
        }
        self.stream.close().join()?;
        self.controller.close()?;
        info!(
            target: "partstate::recovery",
            data_dir = %self.config.data_dir.display(),
            "Closed partition"
        );
        Ok(())
    }
}
