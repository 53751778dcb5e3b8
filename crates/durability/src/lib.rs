//! Durability layer for partition state
//!
//! This crate manages the partition's state on disk:
//! - [`StateStorage`]: runtime and snapshot directories, naming rules
//! - [`StateSnapshotController`]: database lifecycle, snapshots, retention,
//!   recovery and restore info
//! - [`SnapshotDirector`]: actor taking periodic snapshots at the commit
//!   position
//!
//! # Directory layout
//!
//! ```text
//! <root>/runtime/                  -- live database files
//! <root>/snapshots/<position>/     -- valid snapshot
//! <root>/snapshots/<position>-tmp/ -- uncommitted snapshot
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod director;
pub mod error;
pub mod retention;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::{StateSnapshotController, PENDING_SNAPSHOT_NAME};
pub use director::{CommitPositionSource, SnapshotDirector, SnapshotDirectorHandle};
pub use error::{SnapshotError, SnapshotResult};
pub use retention::snapshots_to_prune;
pub use storage::{SnapshotEntry, StateStorage, TMP_SNAPSHOT_SUFFIX};
