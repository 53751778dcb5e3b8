//! Write-ahead log
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬─────────────────┬───────────────────────────┐
//! │ Length (4 bytes)│ CRC32 (4 bytes) │ Encoded WriteBatch        │
//! └─────────────────┴─────────────────┴───────────────────────────┘
//! ```
//!
//! On replay, an incomplete or CRC-failing *final* record is a torn write and
//! is truncated away. A CRC failure followed by more records means the log
//! was damaged after the fact and the database is corrupt.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::batch::WriteBatch;
use crate::error::{DbError, DbResult, FormatError};

const RECORD_HEADER_SIZE: usize = 8;

/// Open WAL file, append only.
pub(crate) struct Wal {
    file: File,
    path: PathBuf,
    number: u64,
    size: u64,
}

impl Wal {
    /// Open (or create) `path` for appending.
    pub(crate) fn open(path: PathBuf, number: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Wal {
            file,
            path,
            number,
            size,
        })
    }

    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append one batch as a single record.
    pub(crate) fn append(&mut self, batch: &WriteBatch, sync: bool) -> io::Result<()> {
        let payload = batch.encode();
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.write_u32::<LittleEndian>(payload.len() as u32)?;
        record.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
        record.extend_from_slice(&payload);

        self.file.write_all(&record)?;
        if sync {
            self.file.sync_data()?;
        }
        self.size += record.len() as u64;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Result of replaying a WAL file.
#[derive(Debug, Default)]
pub(crate) struct WalReplay {
    pub batches: Vec<WriteBatch>,
    pub truncated_bytes: u64,
}

/// Read every intact record of `path`, truncating a torn tail in place.
///
/// A missing file replays as empty.
pub(crate) fn replay(path: &Path) -> DbResult<WalReplay> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(WalReplay::default()),
        Err(e) => return Err(e.into()),
    };

    let len = bytes.len();
    let mut offset = 0usize;
    let mut batches = Vec::new();
    while offset < len {
        if len - offset < RECORD_HEADER_SIZE {
            break;
        }
        let mut header = Cursor::new(&bytes[offset..offset + RECORD_HEADER_SIZE]);
        let record_len = header.read_u32::<LittleEndian>()? as usize;
        let stored = header.read_u32::<LittleEndian>()?;
        let end = offset + RECORD_HEADER_SIZE + record_len;
        if end > len {
            break;
        }

        let payload = &bytes[offset + RECORD_HEADER_SIZE..end];
        let computed = crc32fast::hash(payload);
        if computed != stored {
            if end == len {
                break;
            }
            return Err(DbError::corruption(
                path,
                FormatError::ChecksumMismatch { stored, computed },
            ));
        }
        let batch = WriteBatch::decode(payload).map_err(|e| DbError::corruption(path, e))?;
        batches.push(batch);
        offset = end;
    }

    let truncated_bytes = (len - offset) as u64;
    if truncated_bytes > 0 {
        warn!(
            target: "partstate::storage",
            path = %path.display(),
            valid_len = offset,
            truncated_bytes,
            "Truncating torn WAL tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }

    Ok(WalReplay {
        batches,
        truncated_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ColumnFamily;

    fn batch(key: &str, value: &str) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::DEFAULT, key, value);
        batch
    }

    fn write_records(path: &Path, count: usize) {
        let mut wal = Wal::open(path.to_path_buf(), 1).unwrap();
        for i in 0..count {
            wal.append(&batch(&format!("k{}", i), "v"), false).unwrap();
        }
        wal.sync().unwrap();
    }

    #[test]
    fn test_missing_wal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let replay = replay(&dir.path().join("wal-000001.log")).unwrap();
        assert!(replay.batches.is_empty());
    }

    #[test]
    fn test_replay_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        write_records(&path, 5);
        let replay = replay(&path).unwrap();
        assert_eq!(replay.batches.len(), 5);
        assert_eq!(replay.truncated_bytes, 0);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        write_records(&path, 3);
        let full = fs::metadata(&path).unwrap().len();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.batches.len(), 2);
        assert!(replay.truncated_bytes > 0);
        // Second replay sees a clean log.
        assert_eq!(super::replay(&path).unwrap().truncated_bytes, 0);
    }

    #[test]
    fn test_bad_crc_in_middle_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal-000001.log");
        write_records(&path, 3);

        let mut bytes = fs::read(&path).unwrap();
        bytes[RECORD_HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(replay(&path).unwrap_err().is_corruption());
    }
}
