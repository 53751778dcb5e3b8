//! Opening databases
//!
//! Components that open databases (the snapshot controller above all) take
//! a [`DbFactory`] instead of calling [`StateDb::open`] directly, so tests
//! can inject failures and callers can choose options per partition.

use std::path::Path;
use std::sync::Arc;

use crate::db::{DbOptions, StateDb};
use crate::error::DbResult;

/// Opens a [`StateDb`] in a directory.
pub trait DbFactory: Send + Sync {
    /// Open (or create) the database in `path`.
    fn open(&self, path: &Path) -> DbResult<Arc<StateDb>>;

    /// Open the database in `path` without ever creating one.
    fn open_existing(&self, path: &Path) -> DbResult<Arc<StateDb>>;
}

/// Factory opening the table-backed [`StateDb`] with fixed options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableDbFactory {
    options: DbOptions,
}

impl TableDbFactory {
    /// Factory using `options` for every database it opens.
    pub fn new(options: DbOptions) -> Self {
        TableDbFactory { options }
    }

    /// Options passed to every open.
    pub fn options(&self) -> DbOptions {
        self.options
    }
}

impl DbFactory for TableDbFactory {
    fn open(&self, path: &Path) -> DbResult<Arc<StateDb>> {
        StateDb::open(path, self.options).map(Arc::new)
    }

    fn open_existing(&self, path: &Path) -> DbResult<Arc<StateDb>> {
        StateDb::open_existing(path, self.options).map(Arc::new)
    }
}
