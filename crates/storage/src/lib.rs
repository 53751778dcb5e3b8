//! Embedded state database for partitions
//!
//! [`StateDb`] is an ordered key-value store bound to one directory (the
//! partition's runtime directory). It provides:
//! - Column families (`ColumnFamily(u8)`) as key namespaces
//! - Atomic [`WriteBatch`]es, logged to a CRC-framed WAL before they apply
//! - Sorted, CRC-protected tables plus an atomically swapped MANIFEST
//! - Consistent point-in-time [`checkpoint`](StateDb::checkpoint)s into any
//!   directory, which is what snapshots are made of
//! - Corruption detection on open, reported as [`DbError::Corruption`]
//!
//! An exclusive `fs2` lock on `<dir>/LOCK` guarantees at most one open
//! handle per directory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod db;
pub mod error;
pub mod factory;
pub mod format;
mod wal;

pub use batch::{BatchOp, ColumnFamily, WriteBatch};
pub use db::{DbOptions, StateDb, DEFAULT_TABLE_SIZE_LIMIT, DEFAULT_WAL_FLUSH_THRESHOLD};
pub use error::{DbError, DbResult, FormatError};
pub use factory::{DbFactory, TableDbFactory};
