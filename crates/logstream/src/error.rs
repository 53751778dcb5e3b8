//! Log stream errors

use std::path::PathBuf;

use partstate_core::{EventType, Position, RegistryError};
use partstate_scheduler::ActorError;

/// Errors of the log storage, the log stream and its readers and writers.
#[derive(Debug, thiserror::Error)]
pub enum LogStreamError {
    /// Append attempted before `open_appender` completed or after close
    #[error("Log appender is not open")]
    AppenderClosed,

    /// Operation on a closed stream
    #[error("Log stream is closed")]
    StreamClosed,

    /// Positions written to storage must strictly increase
    #[error("Position {position} does not follow last written position {last}")]
    NonMonotonicPosition {
        /// Rejected position
        position: Position,
        /// Last position in storage
        last: Position,
    },

    /// Position without a signed wire representation
    #[error("Position {0} is out of range")]
    PositionOutOfRange(Position),

    /// Entry larger than the storage accepts
    #[error("Entry of {len} bytes exceeds the maximum of {max}")]
    EntryTooLarge {
        /// Payload length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// A failed write could not be rolled back; the segment takes no more appends
    #[error("Log segment '{}' is unusable after a failed write", .path.display())]
    SegmentUnusable {
        /// Segment file
        path: PathBuf,
    },

    /// A log segment failed validation
    #[error("Corrupted log segment '{}' at offset {offset}: {reason}", .path.display())]
    Corruption {
        /// Segment file
        path: PathBuf,
        /// Byte offset of the bad frame
        offset: u64,
        /// What was wrong
        reason: String,
    },

    /// The distributed log refused or failed an append
    #[error("Replication of position {position} failed: {message}")]
    Replication {
        /// Position of the entry
        position: Position,
        /// Bridge message
        message: String,
    },

    /// Typed record with an event type the registry does not know
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Typed record written with a newer schema than the registry knows
    #[error("{event_type} was written with schema version {written}, newest known is {supported}")]
    UnsupportedSchemaVersion {
        /// Event type of the record
        event_type: EventType,
        /// Version in the record
        written: u16,
        /// Version in the registry
        supported: u16,
    },

    /// Serializing a typed record failed
    #[error("Failed to encode record: {0}")]
    Encode(String),

    /// Deserializing a typed record failed
    #[error("Failed to decode record at position {position}: {message}")]
    Decode {
        /// Position of the record
        position: Position,
        /// Decoder message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scheduler error
    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Result type for log stream operations
pub type LogStreamResult<T> = Result<T, LogStreamError>;
