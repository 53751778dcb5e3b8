//! Snapshot and recovery errors

use std::io;

use partstate_core::{Position, RestoreInfoError};
use partstate_storage::DbError;

/// Errors returned by the snapshot controller and the snapshot director.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Operation not allowed in the controller's current state
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// Another snapshot is being written
    #[error("A snapshot is already in progress")]
    SnapshotInProgress,

    /// The target snapshot directory already exists
    #[error("Snapshot {0} already exists")]
    AlreadyExists(Position),

    /// Every snapshot candidate failed to open
    #[error("Failed to recover from snapshots (tried {attempted:?})")]
    RecoveryFailed {
        /// Candidate positions, newest first
        attempted: Vec<Position>,
    },

    /// Position without a signed wire representation
    #[error("Snapshot position {0} is out of range")]
    PositionOutOfRange(Position),

    /// Restore info could not be built
    #[error(transparent)]
    RestoreInfo(#[from] RestoreInfoError),

    /// Retention limit below one
    #[error("Maximum snapshot count must be at least 1, got {0}")]
    InvalidMaxSnapshots(usize),

    /// State database failure
    #[error("State database error: {0}")]
    Db(#[from] DbError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The director actor is gone
    #[error("Snapshot director unavailable: {0}")]
    Actor(#[from] partstate_scheduler::ActorError),
}

impl SnapshotError {
    /// True for precondition violations that touched no disk state.
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            SnapshotError::IllegalState(_)
                | SnapshotError::SnapshotInProgress
                | SnapshotError::PositionOutOfRange(_)
        )
    }
}

/// Result alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;
