//! Committed-entry reader

use std::sync::Arc;

use partstate_core::Position;

use crate::error::LogStreamResult;
use crate::storage::{FsLogStorage, LoggedEntry};
use crate::stream::{StreamShared, FIRST_POSITION};

/// Iterates entries in position order, never past the commit position.
///
/// The iterator ends when it catches up with the commit position; once the
/// commit position moves, calling `next` again continues where it stopped.
pub struct LogStreamReader {
    storage: Arc<FsLogStorage>,
    shared: Arc<StreamShared>,
    next: Position,
}

impl LogStreamReader {
    pub(crate) fn new(storage: Arc<FsLogStorage>, shared: Arc<StreamShared>) -> Self {
        LogStreamReader {
            storage,
            shared,
            next: FIRST_POSITION,
        }
    }

    /// Continue at the first entry at or after `position`.
    pub fn seek(&mut self, position: Position) {
        self.next = position;
    }

    /// Continue after the current commit position.
    pub fn seek_to_end(&mut self) {
        self.next = self
            .shared
            .commit_position()
            .map_or(FIRST_POSITION, |p| p + 1);
    }

    /// Position the next read starts at.
    pub fn position(&self) -> Position {
        self.next
    }

    fn read_next(&mut self) -> LogStreamResult<Option<LoggedEntry>> {
        let commit = match self.shared.commit_position() {
            Some(commit) if commit >= self.next => commit,
            _ => return Ok(None),
        };
        match self.storage.read_from(self.next)? {
            Some(entry) if entry.position <= commit => {
                self.next = entry.position + 1;
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }
}

impl Iterator for LogStreamReader {
    type Item = LogStreamResult<LoggedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}
