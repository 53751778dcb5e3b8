//! Segmented on-disk log
//!
//! Entries are appended to numbered segment files `NNNNNNNN.log` in one
//! directory. A segment is closed once the next frame would push it past the
//! configured size; a frame larger than a whole segment gets a segment of
//! its own.
//!
//! # Segment Layout
//!
//! ```text
//! ┌──────────────┬────────────────┐
//! │ Magic "PSLG" │ Version (u32)  │   segment header, 8 bytes
//! └──────────────┴────────────────┘
//! ┌──────────────┬──────────────┬─────────────────┬─────────────┐
//! │ Length (u32) │ CRC32 (u32)  │ Position (u64)  │ Payload     │   one frame per entry
//! └──────────────┴──────────────┴─────────────────┴─────────────┘
//! ```
//!
//! The CRC covers position and payload. On open every segment is scanned:
//! an incomplete or CRC-failing frame at the very end of the newest segment
//! is a torn write and is cut off; anything else is corruption.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use partstate_core::Position;

use crate::error::{LogStreamError, LogStreamResult};

/// Magic bytes at the start of every segment.
pub const SEGMENT_MAGIC: [u8; 4] = *b"PSLG";
/// Segment format version.
pub const SEGMENT_VERSION: u32 = 1;
/// Size of the segment header.
pub const SEGMENT_HEADER_SIZE: u64 = 8;

const FRAME_HEADER_SIZE: usize = 16;

/// Default upper bound for one entry's payload.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// `NNNNNNNN.log`
pub fn segment_file_name(id: u64) -> String {
    format!("{:08}.log", id)
}

/// Inverse of [`segment_file_name`].
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".log")?;
    if stem.len() != 8 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// One entry read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEntry {
    /// Position assigned on append
    pub position: Position,
    /// Entry bytes
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    segment: u64,
    offset: u64,
    len: u32,
}

struct ActiveSegment {
    id: u64,
    file: File,
    size: u64,
    /// Set when a failed write left bytes that could not be cut off.
    failed: bool,
}

impl ActiveSegment {
    fn create(dir: &Path, id: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(segment_file_name(id)))?;
        let mut header = Vec::with_capacity(SEGMENT_HEADER_SIZE as usize);
        header.extend_from_slice(&SEGMENT_MAGIC);
        header.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        file.write_all(&header)?;
        file.sync_all()?;
        File::open(dir)?.sync_all()?;
        Ok(ActiveSegment {
            id,
            file,
            size: SEGMENT_HEADER_SIZE,
            failed: false,
        })
    }

    fn open(path: &Path, id: u64) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(ActiveSegment {
            id,
            file,
            size,
            failed: false,
        })
    }

    /// Cut off whatever a failed write left past `size`.
    ///
    /// The file is in append mode, so the next frame lands at `size` again.
    /// If the cut fails too the segment is marked failed.
    fn discard_partial_frame(&mut self, dir: &Path) {
        if let Err(e) = self.file.set_len(self.size) {
            self.failed = true;
            error!(
                target: "partstate::logstream",
                path = %dir.join(segment_file_name(self.id)).display(),
                valid_len = self.size,
                error = %e,
                "Cannot roll back failed log write, refusing further appends"
            );
        }
    }
}

struct LogInner {
    index: BTreeMap<Position, EntryLocation>,
    first_segment: u64,
    active: ActiveSegment,
}

/// Append-only log over segment files.
///
/// Positions must strictly increase but may leave gaps. All methods take
/// `&self`; appends are serialized internally, reads only hold the lock for
/// the index lookup.
pub struct FsLogStorage {
    dir: PathBuf,
    segment_size: u64,
    max_entry_size: usize,
    inner: Mutex<LogInner>,
}

impl FsLogStorage {
    /// Open the log in `dir`, creating it if needed.
    ///
    /// Every existing segment is validated and indexed; a torn tail is
    /// truncated.
    pub fn open(dir: impl Into<PathBuf>, segment_size: u64) -> LogStreamResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let mut index = BTreeMap::new();
        for (i, (id, path)) in segments.iter().enumerate() {
            let newest = i + 1 == segments.len();
            scan_segment(path, *id, newest, &mut index)?;
        }

        let (first_segment, active) = match (segments.first(), segments.last()) {
            (Some((first, _)), Some((last, path))) => (*first, ActiveSegment::open(path, *last)?),
            _ => (0, ActiveSegment::create(&dir, 0)?),
        };

        info!(
            target: "partstate::logstream",
            path = %dir.display(),
            segments = active.id - first_segment + 1,
            entries = index.len(),
            "Opened log storage"
        );
        Ok(FsLogStorage {
            dir,
            segment_size,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            inner: Mutex::new(LogInner {
                index,
                first_segment,
                active,
            }),
        })
    }

    /// Limit the payload size of appended entries.
    ///
    /// Capped at what a frame's 32-bit length can describe.
    pub fn with_max_entry_size(mut self, max: usize) -> Self {
        self.max_entry_size = max.min(u32::MAX as usize);
        self
    }

    /// Largest payload accepted by [`append`](Self::append).
    pub fn max_entry_size(&self) -> usize {
        self.max_entry_size
    }

    /// Log directory.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Rotation threshold in bytes.
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Number of segment files.
    pub fn segment_count(&self) -> usize {
        let inner = self.inner.lock();
        (inner.active.id - inner.first_segment + 1) as usize
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// True if nothing was ever appended.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Lowest position in the log.
    pub fn first_position(&self) -> Option<Position> {
        self.inner.lock().index.keys().next().copied()
    }

    /// Highest position in the log.
    pub fn last_position(&self) -> Option<Position> {
        self.inner.lock().index.keys().next_back().copied()
    }

    /// Append `payload` at `position`, which must exceed every existing one.
    ///
    /// Not synced; see [`flush`](Self::flush).
    pub fn append(&self, position: Position, payload: &[u8]) -> LogStreamResult<()> {
        if payload.len() > self.max_entry_size {
            return Err(LogStreamError::EntryTooLarge {
                len: payload.len(),
                max: self.max_entry_size,
            });
        }
        let payload_len = u32::try_from(payload.len()).map_err(|_| LogStreamError::EntryTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut inner = self.inner.lock();
        if inner.active.failed {
            return Err(LogStreamError::SegmentUnusable {
                path: self.dir.join(segment_file_name(inner.active.id)),
            });
        }
        if let Some(&last) = inner.index.keys().next_back() {
            if position <= last {
                return Err(LogStreamError::NonMonotonicPosition { position, last });
            }
        }

        let frame_len = (FRAME_HEADER_SIZE + payload.len()) as u64;
        if inner.active.size > SEGMENT_HEADER_SIZE
            && inner.active.size + frame_len > self.segment_size
        {
            self.rotate(&mut inner)?;
        }

        let mut frame = Vec::with_capacity(frame_len as usize);
        frame.write_u32::<LittleEndian>(payload_len)?;
        frame.write_u32::<LittleEndian>(frame_checksum(position, payload))?;
        frame.write_u64::<LittleEndian>(position)?;
        frame.extend_from_slice(payload);

        let offset = inner.active.size;
        if let Err(e) = inner.active.file.write_all(&frame) {
            inner.active.discard_partial_frame(&self.dir);
            return Err(e.into());
        }
        inner.active.size += frame_len;
        let segment = inner.active.id;
        inner.index.insert(
            position,
            EntryLocation {
                segment,
                offset,
                len: payload_len,
            },
        );
        Ok(())
    }

    fn rotate(&self, inner: &mut LogInner) -> io::Result<()> {
        inner.active.file.sync_all()?;
        let next = inner.active.id + 1;
        inner.active = ActiveSegment::create(&self.dir, next)?;
        debug!(target: "partstate::logstream", segment = next, "Rotated log segment");
        Ok(())
    }

    /// Sync the active segment.
    pub fn flush(&self) -> io::Result<()> {
        self.inner.lock().active.file.sync_data()
    }

    /// The entry at exactly `position`.
    pub fn read(&self, position: Position) -> LogStreamResult<Option<LoggedEntry>> {
        let location = self.inner.lock().index.get(&position).copied();
        match location {
            Some(location) => Ok(Some(self.read_entry(position, location)?)),
            None => Ok(None),
        }
    }

    /// The first entry at or after `position`.
    pub fn read_from(&self, position: Position) -> LogStreamResult<Option<LoggedEntry>> {
        let found = self
            .inner
            .lock()
            .index
            .range(position..)
            .next()
            .map(|(p, l)| (*p, *l));
        match found {
            Some((position, location)) => Ok(Some(self.read_entry(position, location)?)),
            None => Ok(None),
        }
    }

    fn read_entry(&self, position: Position, location: EntryLocation) -> io::Result<LoggedEntry> {
        let mut file = File::open(self.dir.join(segment_file_name(location.segment)))?;
        file.seek(SeekFrom::Start(location.offset + FRAME_HEADER_SIZE as u64))?;
        let mut payload = vec![0u8; location.len as usize];
        file.read_exact(&mut payload)?;
        Ok(LoggedEntry { position, payload })
    }
}

fn frame_checksum(position: Position, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&position.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_file_name) {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn corruption(path: &Path, offset: usize, reason: impl Into<String>) -> LogStreamError {
    LogStreamError::Corruption {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.into(),
    }
}

/// Validate and index one segment. Only the newest segment may have a torn tail.
fn scan_segment(
    path: &Path,
    id: u64,
    newest: bool,
    index: &mut BTreeMap<Position, EntryLocation>,
) -> LogStreamResult<()> {
    let bytes = fs::read(path)?;
    let len = bytes.len();
    let header_size = SEGMENT_HEADER_SIZE as usize;

    if len < header_size {
        if !newest {
            return Err(corruption(path, 0, "truncated segment header"));
        }
        warn!(target: "partstate::logstream", path = %path.display(), "Rewriting torn segment header");
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(&SEGMENT_MAGIC)?;
        file.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        file.sync_all()?;
        return Ok(());
    }
    if bytes[..4] != SEGMENT_MAGIC {
        return Err(corruption(path, 0, "invalid segment magic"));
    }
    let version = Cursor::new(&bytes[4..8]).read_u32::<LittleEndian>()?;
    if version != SEGMENT_VERSION {
        return Err(corruption(path, 4, format!("unsupported segment version {}", version)));
    }

    let mut offset = header_size;
    while offset < len {
        if len - offset < FRAME_HEADER_SIZE {
            break;
        }
        let mut header = Cursor::new(&bytes[offset..offset + FRAME_HEADER_SIZE]);
        let payload_len = header.read_u32::<LittleEndian>()?;
        let stored = header.read_u32::<LittleEndian>()?;
        let position = header.read_u64::<LittleEndian>()?;
        let end = offset + FRAME_HEADER_SIZE + payload_len as usize;
        if end > len {
            break;
        }

        let payload = &bytes[offset + FRAME_HEADER_SIZE..end];
        if frame_checksum(position, payload) != stored {
            if end == len {
                break;
            }
            return Err(corruption(path, offset, "frame checksum mismatch"));
        }
        if let Some(&last) = index.keys().next_back() {
            if position <= last {
                return Err(corruption(
                    path,
                    offset,
                    format!("position {} follows {}", position, last),
                ));
            }
        }
        index.insert(
            position,
            EntryLocation {
                segment: id,
                offset: offset as u64,
                len: payload_len,
            },
        );
        offset = end;
    }

    if offset < len {
        if !newest {
            return Err(corruption(path, offset, "incomplete frame in closed segment"));
        }
        warn!(
            target: "partstate::logstream",
            path = %path.display(),
            valid_len = offset,
            truncated_bytes = len - offset,
            "Truncating torn log tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }
    Ok(())
}
