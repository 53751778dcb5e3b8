//! State snapshot controller
//!
//! Owns the partition's database handle and the snapshot directories.
//!
//! # Snapshot commit protocol
//!
//! 1. The database writes a checkpoint into `<snapshots>/<name>-tmp`
//! 2. Every file of the checkpoint is fsynced
//! 3. The directory is renamed to `<snapshots>/<position>`
//! 4. The snapshots directory is fsynced
//!
//! A position-named directory is therefore always complete. A crash leaves
//! at most a `-tmp` directory behind, which retention never touches.
//!
//! # Recovery
//!
//! Valid snapshots are tried newest first: the runtime directory is wiped,
//! seeded with the candidate's files and opened. A candidate that fails to
//! open as corrupt is skipped. Once one opens, the newer corrupt candidates
//! are deleted. If all fail, nothing is deleted and recovery is fatal.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use partstate_core::{is_valid_position, Position, SnapshotRestoreInfo};
use partstate_storage::{DbFactory, StateDb};

use crate::error::{SnapshotError, SnapshotResult};
use crate::retention::snapshots_to_prune;
use crate::storage::StateStorage;

/// Name of the temporary snapshot written by [`StateSnapshotController::take_temp_snapshot`].
pub const PENDING_SNAPSHOT_NAME: &str = "pending";

#[derive(Default)]
struct ControllerState {
    db: Option<Arc<StateDb>>,
    /// Staging directory of the snapshot being written, if any
    in_flight: Option<PathBuf>,
    /// A completed temporary snapshot waits for `move_valid_snapshot`
    pending_temp: bool,
}

/// Lifecycle of the state database and its snapshots.
///
/// Methods take `&self` so the controller can be shared between the
/// partition and its snapshot director; lifecycle changes (open, close,
/// recover, retention) are serialized internally.
pub struct StateSnapshotController {
    storage: StateStorage,
    factory: Arc<dyn DbFactory>,
    max_snapshots: usize,
    state: Mutex<ControllerState>,
}

struct InFlight<'a> {
    controller: &'a StateSnapshotController,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.controller.state.lock().in_flight = None;
    }
}

impl StateSnapshotController {
    /// Create a controller keeping at most `max_snapshots` valid snapshots.
    pub fn new(
        storage: StateStorage,
        factory: Arc<dyn DbFactory>,
        max_snapshots: usize,
    ) -> SnapshotResult<Self> {
        if max_snapshots == 0 {
            return Err(SnapshotError::InvalidMaxSnapshots(max_snapshots));
        }
        Ok(StateSnapshotController {
            storage,
            factory,
            max_snapshots,
            state: Mutex::new(ControllerState::default()),
        })
    }

    /// The directories this controller manages.
    pub fn storage(&self) -> &StateStorage {
        &self.storage
    }

    /// Retention limit.
    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Open the database in the runtime directory, or return the open one.
    pub fn open_db(&self) -> SnapshotResult<Arc<StateDb>> {
        let mut state = self.state.lock();
        if let Some(db) = &state.db {
            return Ok(db.clone());
        }
        let db = self.factory.open(self.storage.runtime_directory())?;
        info!(
            target: "partstate::snapshot",
            path = %self.storage.runtime_directory().display(),
            "Opened runtime state database"
        );
        state.db = Some(db.clone());
        Ok(db)
    }

    /// True while a database handle is open.
    pub fn is_db_opened(&self) -> bool {
        self.state.lock().db.is_some()
    }

    /// The open database handle, if any.
    pub fn db(&self) -> Option<Arc<StateDb>> {
        self.state.lock().db.clone()
    }

    fn opened_db(&self) -> SnapshotResult<Arc<StateDb>> {
        self.db()
            .ok_or(SnapshotError::IllegalState("cannot take a snapshot of a closed database"))
    }

    fn begin_snapshot(&self, staging: &Path) -> SnapshotResult<InFlight<'_>> {
        let mut state = self.state.lock();
        if state.in_flight.is_some() {
            return Err(SnapshotError::SnapshotInProgress);
        }
        state.in_flight = Some(staging.to_path_buf());
        Ok(InFlight { controller: self })
    }

    fn write_checkpoint(&self, db: &StateDb, staging: &Path) -> SnapshotResult<()> {
        if staging.exists() {
            // Left by an interrupted write of the same snapshot.
            fs::remove_dir_all(staging)?;
        }
        if let Err(e) = db.checkpoint(staging) {
            let _ = fs::remove_dir_all(staging);
            return Err(e.into());
        }
        Ok(())
    }

    fn commit_directory(&self, from: &Path, to: &Path) -> SnapshotResult<()> {
        fs::rename(from, to)?;
        fs::File::open(self.storage.snapshots_directory())?.sync_all()?;
        Ok(())
    }

    /// Write a snapshot of the open database as the valid snapshot `position`.
    ///
    /// A no-op if that snapshot already exists.
    pub fn take_snapshot(&self, position: Position) -> SnapshotResult<()> {
        check_position(position)?;
        let db = self.opened_db()?;
        let target = self.storage.snapshot_directory_for(position);
        if target.exists() {
            debug!(target: "partstate::snapshot", position, "Snapshot already exists, skipping");
            return Ok(());
        }

        let staging = self.storage.tmp_snapshot_directory_for(&position.to_string());
        let _in_flight = self.begin_snapshot(&staging)?;
        self.write_checkpoint(&db, &staging)?;
        self.commit_directory(&staging, &target)?;

        info!(
            target: "partstate::snapshot",
            position,
            path = %target.display(),
            "Took snapshot"
        );
        Ok(())
    }

    /// Write a snapshot not yet bound to a position.
    ///
    /// Replaces a previous pending temporary snapshot. Returns its directory.
    pub fn take_temp_snapshot(&self) -> SnapshotResult<PathBuf> {
        let db = self.opened_db()?;
        let staging = self.storage.tmp_snapshot_directory_for(PENDING_SNAPSHOT_NAME);
        let _in_flight = self.begin_snapshot(&staging)?;

        self.state.lock().pending_temp = false;
        self.write_checkpoint(&db, &staging)?;
        self.state.lock().pending_temp = true;

        debug!(target: "partstate::snapshot", path = %staging.display(), "Took temporary snapshot");
        Ok(staging)
    }

    /// Promote the pending temporary snapshot to the valid snapshot `position`.
    pub fn move_valid_snapshot(&self, position: Position) -> SnapshotResult<()> {
        check_position(position)?;
        let mut state = self.state.lock();
        if !state.pending_temp {
            return Err(SnapshotError::IllegalState("no temporary snapshot to move"));
        }
        let target = self.storage.snapshot_directory_for(position);
        if target.exists() {
            return Err(SnapshotError::AlreadyExists(position));
        }

        let pending = self.storage.tmp_snapshot_directory_for(PENDING_SNAPSHOT_NAME);
        self.commit_directory(&pending, &target)?;
        state.pending_temp = false;

        info!(
            target: "partstate::snapshot",
            position,
            path = %target.display(),
            "Committed temporary snapshot"
        );
        Ok(())
    }

    /// Delete the oldest valid snapshots beyond the retention limit.
    ///
    /// Returns the deleted positions, newest first. Temporary directories
    /// are left alone.
    pub fn ensure_max_snapshot_count(&self) -> SnapshotResult<Vec<Position>> {
        let _state = self.state.lock();
        let positions = self.storage.list_valid()?;
        let pruned = snapshots_to_prune(&positions, self.max_snapshots);
        for position in &pruned {
            fs::remove_dir_all(self.storage.snapshot_directory_for(*position))?;
            debug!(target: "partstate::snapshot", position, "Deleted snapshot beyond retention");
        }
        if !pruned.is_empty() {
            info!(
                target: "partstate::snapshot",
                deleted = pruned.len(),
                kept = positions.len() - pruned.len(),
                "Enforced snapshot retention"
            );
        }
        Ok(pruned)
    }

    /// Delete `-tmp` directories not modified for `max_age`.
    ///
    /// The snapshot currently being written and a pending temporary snapshot
    /// are skipped. Returns the number of directories removed.
    pub fn remove_orphaned_temp_snapshots(&self, max_age: Duration) -> SnapshotResult<usize> {
        let state = self.state.lock();
        let pending = self.storage.tmp_snapshot_directory_for(PENDING_SNAPSHOT_NAME);
        let now = SystemTime::now();
        let mut removed = 0;

        for dir in self.storage.list_temporary()? {
            if state.in_flight.as_deref() == Some(dir.as_path())
                || (state.pending_temp && dir == pending)
            {
                continue;
            }
            let modified = fs::metadata(&dir)?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= max_age {
                fs::remove_dir_all(&dir)?;
                removed += 1;
                debug!(target: "partstate::snapshot", path = %dir.display(), "Removed orphaned temporary snapshot");
            }
        }
        Ok(removed)
    }

    /// Rebuild the runtime directory from the newest snapshot that opens.
    ///
    /// Returns the recovered position, or `None` if there were no snapshots
    /// (the runtime directory is then empty and the database stays closed).
    /// The database is left open after a successful recovery.
    pub fn recover(&self) -> SnapshotResult<Option<Position>> {
        let mut state = self.state.lock();
        if state.db.is_some() {
            return Err(SnapshotError::IllegalState("cannot recover while the database is open"));
        }

        let mut candidates = self.storage.list_valid()?;
        candidates.reverse();
        self.storage.wipe_runtime()?;

        if candidates.is_empty() {
            info!(target: "partstate::recovery", "No snapshot to recover from");
            return Ok(None);
        }

        let mut corrupted = Vec::new();
        for &position in &candidates {
            let snapshot = self.storage.snapshot_directory_for(position);
            self.storage.wipe_runtime()?;
            self.storage.seed_runtime_from(&snapshot)?;

            match self.factory.open_existing(self.storage.runtime_directory()) {
                Ok(db) => {
                    state.db = Some(db);
                    for stale in &corrupted {
                        fs::remove_dir_all(self.storage.snapshot_directory_for(*stale))?;
                        warn!(target: "partstate::recovery", position = stale, "Deleted corrupted snapshot");
                    }
                    info!(
                        target: "partstate::recovery",
                        position,
                        skipped = corrupted.len(),
                        "Recovered state from snapshot"
                    );
                    return Ok(Some(position));
                }
                Err(e) if e.is_corruption() => {
                    warn!(
                        target: "partstate::recovery",
                        position,
                        error = %e,
                        "Snapshot is corrupted, trying an older one"
                    );
                    corrupted.push(position);
                }
                Err(e) => {
                    self.storage.wipe_runtime()?;
                    return Err(e.into());
                }
            }
        }

        self.storage.wipe_runtime()?;
        error!(
            target: "partstate::recovery",
            attempted = ?candidates,
            "Failed to recover from snapshots"
        );
        Err(SnapshotError::RecoveryFailed {
            attempted: candidates,
        })
    }

    /// Number of valid snapshots.
    pub fn valid_snapshots_count(&self) -> SnapshotResult<usize> {
        Ok(self.storage.list_valid()?.len())
    }

    /// Highest valid snapshot position.
    pub fn last_valid_snapshot_position(&self) -> SnapshotResult<Option<Position>> {
        Ok(self.storage.list_valid()?.last().copied())
    }

    /// Directory of the highest valid snapshot.
    pub fn last_valid_snapshot_directory(&self) -> SnapshotResult<Option<PathBuf>> {
        Ok(self
            .last_valid_snapshot_position()?
            .map(|p| self.storage.snapshot_directory_for(p)))
    }

    /// Position and file count of the newest valid snapshot.
    pub fn latest_snapshot_restore_info(&self) -> SnapshotResult<SnapshotRestoreInfo> {
        match self.last_valid_snapshot_position()? {
            None => Ok(SnapshotRestoreInfo::Null),
            Some(position) => {
                let dir = self.storage.snapshot_directory_for(position);
                let files = StateStorage::count_files(&dir)?;
                Ok(SnapshotRestoreInfo::new(position, files)?)
            }
        }
    }

    /// Close the database if open. Idempotent.
    pub fn close(&self) -> SnapshotResult<()> {
        let db = self.state.lock().db.take();
        if let Some(db) = db {
            db.close()?;
            info!(target: "partstate::snapshot", "Closed runtime state database");
        }
        Ok(())
    }
}

fn check_position(position: Position) -> SnapshotResult<()> {
    if is_valid_position(position) {
        Ok(())
    } else {
        Err(SnapshotError::PositionOutOfRange(position))
    }
}

impl Drop for StateSnapshotController {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "partstate::snapshot", error = %e, "Failed to close state database");
        }
    }
}
