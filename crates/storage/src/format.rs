//! On-disk file formats
//!
//! A database directory holds:
//!
//! ```text
//! <dir>/MANIFEST          -- which tables and which WAL make up the database
//! <dir>/NNNNNN.sst        -- immutable sorted tables
//! <dir>/wal-NNNNNN.log    -- write-ahead log of batches since the last flush
//! <dir>/LOCK              -- exclusive lock of the open handle (runtime only)
//! ```
//!
//! # MANIFEST
//!
//! ```text
//! +-------------------+
//! | Magic: "PSMF"     | 4 bytes
//! | Format Version    | 4 bytes (u32 LE)
//! | Database UUID     | 16 bytes
//! | WAL Number        | 8 bytes (u64 LE)
//! | Next File Number  | 8 bytes (u64 LE)
//! | Table Count       | 4 bytes (u32 LE)
//! | Tables            | count × (file number u64, size u64)
//! | CRC32             | 4 bytes
//! +-------------------+
//! ```
//!
//! # Table
//!
//! ```text
//! +-------------------+
//! | Magic: "PSST"     | 4 bytes
//! | Format Version    | 4 bytes (u32 LE)
//! | Database UUID     | 16 bytes
//! | Entry Count       | 8 bytes (u64 LE)
//! | Entries           | count × (cf u8, key_len u32, key, value_len u32, value)
//! | CRC32             | 4 bytes
//! +-------------------+
//! ```
//!
//! Entries are sorted by (column family, key). All integers are little endian.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::FormatError;

/// MANIFEST magic bytes
pub const MANIFEST_MAGIC: [u8; 4] = *b"PSMF";

/// Table magic bytes
pub const TABLE_MAGIC: [u8; 4] = *b"PSST";

/// Current format version of manifest and tables
pub const FORMAT_VERSION: u32 = 1;

/// Manifest file name
pub const MANIFEST_FILE: &str = "MANIFEST";

/// Lock file name
pub const LOCK_FILE: &str = "LOCK";

/// Extension of sorted table files
pub const TABLE_EXTENSION: &str = "sst";

const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";

/// Table file name for a file number.
pub fn table_file_name(number: u64) -> String {
    format!("{:06}.{}", number, TABLE_EXTENSION)
}

/// WAL file name for a file number.
pub fn wal_file_name(number: u64) -> String {
    format!("wal-{:06}.log", number)
}

/// Parse a table file name back to its number.
pub fn parse_table_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

/// Parse a WAL file name back to its number.
pub fn parse_wal_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?.strip_suffix(".log")?.parse().ok()
}

/// Table listed in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    /// File number (`NNNNNN.sst`)
    pub file_number: u64,
    /// Exact file size in bytes
    pub size: u64,
}

/// Parsed MANIFEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Identity stamped into every table
    pub database_uuid: [u8; 16],
    /// WAL holding writes not yet in tables
    pub wal_number: u64,
    /// Next unused file number
    pub next_file_number: u64,
    /// Live tables in file-number order
    pub tables: Vec<TableRef>,
}

impl Manifest {
    /// Manifest of an empty database.
    pub fn new(database_uuid: [u8; 16]) -> Self {
        Manifest {
            database_uuid,
            wal_number: 1,
            next_file_number: 2,
            tables: Vec::new(),
        }
    }

    /// Serialize, CRC included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(48 + self.tables.len() * 16);
        bytes.extend_from_slice(&MANIFEST_MAGIC);
        // Writes into a Vec cannot fail.
        let _ = bytes.write_u32::<LittleEndian>(FORMAT_VERSION);
        bytes.extend_from_slice(&self.database_uuid);
        let _ = bytes.write_u64::<LittleEndian>(self.wal_number);
        let _ = bytes.write_u64::<LittleEndian>(self.next_file_number);
        let _ = bytes.write_u32::<LittleEndian>(self.tables.len() as u32);
        for table in &self.tables {
            let _ = bytes.write_u64::<LittleEndian>(table.file_number);
            let _ = bytes.write_u64::<LittleEndian>(table.size);
        }
        let crc = crc32fast::hash(&bytes);
        let _ = bytes.write_u32::<LittleEndian>(crc);
        bytes
    }

    /// Parse and verify.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let body = verify_frame(bytes, MANIFEST_MAGIC)?;
        let mut cursor = Cursor::new(body);
        cursor.set_position(8);

        let database_uuid = read_uuid(&mut cursor)?;
        let wal_number = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let next_file_number = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut tables = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            tables.push(TableRef {
                file_number: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
                size: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            });
        }
        ensure_consumed(&cursor)?;

        Ok(Manifest {
            database_uuid,
            wal_number,
            next_file_number,
            tables,
        })
    }

    /// Persist with write-fsync-rename, then fsync the directory.
    pub fn write_atomic(&self, dir: &Path) -> io::Result<()> {
        let tmp = dir.join(MANIFEST_TMP_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        sync_dir(dir)
    }

    /// Read and parse `<dir>/MANIFEST`.
    pub fn load(dir: &Path) -> io::Result<Result<Self, FormatError>> {
        let bytes = fs::read(dir.join(MANIFEST_FILE))?;
        Ok(Manifest::from_bytes(&bytes))
    }
}

/// One (column family, key, value) table entry.
pub type TableEntry = (u8, Vec<u8>, Vec<u8>);

/// Encode a table; `entries` must already be sorted.
pub fn encode_table<'a, I>(database_uuid: [u8; 16], entries: I, count: usize) -> Vec<u8>
where
    I: IntoIterator<Item = (u8, &'a [u8], &'a [u8])>,
{
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&TABLE_MAGIC);
    let _ = bytes.write_u32::<LittleEndian>(FORMAT_VERSION);
    bytes.extend_from_slice(&database_uuid);
    let _ = bytes.write_u64::<LittleEndian>(count as u64);
    for (cf, key, value) in entries {
        let _ = bytes.write_u8(cf);
        let _ = bytes.write_u32::<LittleEndian>(key.len() as u32);
        bytes.extend_from_slice(key);
        let _ = bytes.write_u32::<LittleEndian>(value.len() as u32);
        bytes.extend_from_slice(value);
    }
    let crc = crc32fast::hash(&bytes);
    let _ = bytes.write_u32::<LittleEndian>(crc);
    bytes
}

/// Decode a table and check it belongs to `database_uuid`.
pub fn decode_table(bytes: &[u8], database_uuid: [u8; 16]) -> Result<Vec<TableEntry>, FormatError> {
    let body = verify_frame(bytes, TABLE_MAGIC)?;
    let mut cursor = Cursor::new(body);
    cursor.set_position(8);

    if read_uuid(&mut cursor)? != database_uuid {
        return Err(FormatError::UuidMismatch);
    }
    let count = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    let mut entries = Vec::with_capacity(count.min(65_536) as usize);
    for _ in 0..count {
        let cf = cursor.read_u8().map_err(truncated)?;
        let key = read_bytes(&mut cursor)?;
        let value = read_bytes(&mut cursor)?;
        entries.push((cf, key, value));
    }
    ensure_consumed(&cursor)?;
    Ok(entries)
}

/// Size of an entry inside a table.
pub fn encoded_entry_len(key: &[u8], value: &[u8]) -> usize {
    1 + 4 + key.len() + 4 + value.len()
}

/// Write a file durably; fails if it already exists.
pub fn write_new_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// fsync a directory so renames and creations inside it are durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Checks magic, version and trailing CRC; returns the bytes without the CRC.
fn verify_frame(bytes: &[u8], magic: [u8; 4]) -> Result<&[u8], FormatError> {
    if bytes.len() < 12 {
        return Err(FormatError::Truncated);
    }
    let mut found = [0u8; 4];
    found.copy_from_slice(&bytes[0..4]);
    if found != magic {
        return Err(FormatError::InvalidMagic {
            expected: magic,
            found,
        });
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = Cursor::new(crc_bytes)
        .read_u32::<LittleEndian>()
        .map_err(truncated)?;
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(FormatError::ChecksumMismatch { stored, computed });
    }

    let version = Cursor::new(&body[4..8])
        .read_u32::<LittleEndian>()
        .map_err(truncated)?;
    if version > FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(body)
}

fn read_uuid(cursor: &mut Cursor<&[u8]>) -> Result<[u8; 16], FormatError> {
    let mut uuid = [0u8; 16];
    cursor.read_exact(&mut uuid).map_err(truncated)?;
    Ok(uuid)
}

pub(crate) fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, FormatError> {
    let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(FormatError::Truncated);
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

pub(crate) fn ensure_consumed(cursor: &Cursor<&[u8]>) -> Result<(), FormatError> {
    let trailing = cursor.get_ref().len() - cursor.position() as usize;
    if trailing == 0 {
        Ok(())
    } else {
        Err(FormatError::TrailingBytes(trailing))
    }
}

pub(crate) fn truncated(_: io::Error) -> FormatError {
    FormatError::Truncated
}

/// Paths of all table files in `dir`, sorted by file number.
pub fn list_table_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut tables = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(number) = entry.file_name().to_str().and_then(parse_table_file_name) {
            tables.push((number, entry.path()));
        }
    }
    tables.sort();
    Ok(tables)
}
