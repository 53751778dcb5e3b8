//! Snapshot restore info
//!
//! Describes the physical shape of the newest valid snapshot so that a
//! replication/restore protocol can decide what to fetch. The wire record is
//! `{ snapshot_id: i64, num_chunks: i32 }` encoded as MessagePack; the null
//! value is `{ -1, 0 }`.

use serde::{Deserialize, Serialize};

use crate::position::{is_valid_position, position_to_wire, Position, NO_POSITION};

/// Restore info for the newest valid snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRestoreInfo {
    /// No valid snapshot exists yet; nothing to restore.
    Null,
    /// The newest valid snapshot.
    Available {
        /// Position the snapshot was taken at.
        snapshot_id: Position,
        /// Number of files (chunks) in the snapshot directory.
        num_chunks: u32,
    },
}

impl SnapshotRestoreInfo {
    /// Create restore info for an existing snapshot.
    ///
    /// Both values must fit their signed wire fields.
    pub fn new(snapshot_id: Position, num_chunks: usize) -> Result<Self, RestoreInfoError> {
        if !is_valid_position(snapshot_id) {
            return Err(RestoreInfoError::PositionOutOfRange(snapshot_id));
        }
        let num_chunks = u32::try_from(num_chunks)
            .ok()
            .filter(|n| i32::try_from(*n).is_ok())
            .ok_or(RestoreInfoError::TooManyChunks(num_chunks))?;
        Ok(SnapshotRestoreInfo::Available {
            snapshot_id,
            num_chunks,
        })
    }

    /// True if this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, SnapshotRestoreInfo::Null)
    }

    /// Snapshot position on the wire, `-1` when null.
    pub fn snapshot_id(&self) -> i64 {
        match self {
            SnapshotRestoreInfo::Null => NO_POSITION,
            SnapshotRestoreInfo::Available { snapshot_id, .. } => position_to_wire(Some(*snapshot_id)),
        }
    }

    /// Chunk count on the wire, `0` when null.
    pub fn num_chunks(&self) -> i32 {
        match self {
            SnapshotRestoreInfo::Null => 0,
            SnapshotRestoreInfo::Available { num_chunks, .. } => {
                i32::try_from(*num_chunks).unwrap_or(i32::MAX)
            }
        }
    }

    /// Convert to the wire record.
    pub fn to_record(&self) -> RestoreInfoRecord {
        RestoreInfoRecord {
            snapshot_id: self.snapshot_id(),
            num_chunks: self.num_chunks(),
        }
    }

    /// Encode as MessagePack for the restore protocol.
    pub fn encode(&self) -> Result<Vec<u8>, RestoreInfoError> {
        rmp_serde::to_vec(&self.to_record()).map_err(|e| RestoreInfoError::Encode(e.to_string()))
    }

    /// Decode a MessagePack record produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, RestoreInfoError> {
        let record: RestoreInfoRecord =
            rmp_serde::from_slice(bytes).map_err(|e| RestoreInfoError::Decode(e.to_string()))?;
        Self::try_from(record)
    }
}

/// Wire form of [`SnapshotRestoreInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInfoRecord {
    /// Snapshot position, `-1` for null.
    pub snapshot_id: i64,
    /// Number of chunks.
    pub num_chunks: i32,
}

impl TryFrom<RestoreInfoRecord> for SnapshotRestoreInfo {
    type Error = RestoreInfoError;

    fn try_from(record: RestoreInfoRecord) -> Result<Self, Self::Error> {
        // Any negative id is the null sentinel.
        let Ok(snapshot_id) = Position::try_from(record.snapshot_id) else {
            return Ok(SnapshotRestoreInfo::Null);
        };
        let num_chunks = usize::try_from(record.num_chunks)
            .map_err(|_| RestoreInfoError::NegativeChunkCount(record.num_chunks))?;
        SnapshotRestoreInfo::new(snapshot_id, num_chunks)
    }
}

/// Restore info encoding errors
#[derive(Debug, thiserror::Error)]
pub enum RestoreInfoError {
    /// MessagePack encoding failed
    #[error("Failed to encode restore info: {0}")]
    Encode(String),

    /// MessagePack decoding failed
    #[error("Failed to decode restore info: {0}")]
    Decode(String),

    /// Record carried a negative chunk count for a real snapshot
    #[error("Negative chunk count {0} in restore info")]
    NegativeChunkCount(i32),

    /// Snapshot position above the wire range
    #[error("Snapshot position {0} does not fit the restore info record")]
    PositionOutOfRange(Position),

    /// More snapshot files than the wire chunk count can express
    #[error("{0} snapshot chunks do not fit the restore info record")]
    TooManyChunks(usize),
}
