//! State database errors

use std::io;
use std::path::PathBuf;

/// Problems found while decoding an on-disk file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// File ended before the structure was complete
    #[error("unexpected end of data")]
    Truncated,

    /// Magic bytes do not match
    #[error("invalid magic bytes: expected {expected:?}, found {found:?}")]
    InvalidMagic {
        /// Expected magic
        expected: [u8; 4],
        /// Magic found in the file
        found: [u8; 4],
    },

    /// Format version is newer than this build understands
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// CRC does not match the contents
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// CRC stored in the file
        stored: u32,
        /// CRC computed over the contents
        computed: u32,
    },

    /// File belongs to another database
    #[error("database uuid mismatch")]
    UuidMismatch,

    /// Trailing bytes after the last record
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    /// Unknown write operation tag
    #[error("unknown operation tag {0}")]
    UnknownOperation(u8),

    /// A file listed in the manifest is missing or has the wrong size
    #[error("table {file} missing or resized (expected {expected_size} bytes)")]
    MissingTable {
        /// Table file name
        file: String,
        /// Size recorded in the manifest
        expected_size: u64,
    },

    /// No MANIFEST where a database was expected
    #[error("MANIFEST missing")]
    MissingManifest,
}

/// Errors returned by [`StateDb`](crate::StateDb).
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another handle holds the directory lock
    #[error("database directory {} is locked by another handle", .0.display())]
    Locked(PathBuf),

    /// A file failed validation
    #[error("corrupted database file {}: {source}", .path.display())]
    Corruption {
        /// Offending file
        path: PathBuf,
        /// What was wrong with it
        #[source]
        source: FormatError,
    },

    /// Checkpoint target directory already exists
    #[error("checkpoint target {} already exists", .0.display())]
    CheckpointTargetExists(PathBuf),

    /// The handle was closed
    #[error("database is closed")]
    Closed,
}

impl DbError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, source: FormatError) -> Self {
        DbError::Corruption {
            path: path.into(),
            source,
        }
    }

    /// True if the error means the files on disk cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, DbError::Corruption { .. })
    }
}

/// Result alias for state database operations.
pub type DbResult<T> = Result<T, DbError>;
