//! The state database handle
//!
//! The live key space is held in memory as an ordered map; durability comes
//! from the WAL (every batch is appended before it becomes visible) and from
//! sorted tables written by [`StateDb::flush`]. The MANIFEST names the live
//! tables and the current WAL, and is only ever replaced atomically, so a
//! crash at any point leaves either the old or the new generation readable.
//!
//! # Flush
//!
//! 1. Write the full key space into new tables (split at `table_size_limit`)
//! 2. Start a new WAL
//! 3. Swap the MANIFEST (write-fsync-rename)
//! 4. Delete the previous tables and WAL
//!
//! Tables not referenced by the MANIFEST are leftovers of an interrupted
//! flush and are removed on open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::batch::{BatchOp, ColumnFamily, WriteBatch};
use crate::error::{DbError, DbResult, FormatError};
use crate::format::{
    decode_table, encode_table, encoded_entry_len, list_table_files, parse_wal_file_name,
    sync_dir, table_file_name, wal_file_name, write_new_file, Manifest, TableRef, LOCK_FILE,
    MANIFEST_FILE,
};
use crate::wal::{self, Wal};

/// Default maximum size of a single table file.
pub const DEFAULT_TABLE_SIZE_LIMIT: usize = 4 * 1024 * 1024;

/// Default WAL size that triggers an automatic flush.
pub const DEFAULT_WAL_FLUSH_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Tuning for a database handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbOptions {
    /// Maximum size of a table file written by flush or checkpoint
    pub table_size_limit: usize,
    /// WAL size after which a write triggers a flush
    pub wal_flush_threshold: u64,
    /// fsync the WAL after every batch
    pub sync_writes: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            table_size_limit: DEFAULT_TABLE_SIZE_LIMIT,
            wal_flush_threshold: DEFAULT_WAL_FLUSH_THRESHOLD,
            sync_writes: false,
        }
    }
}

impl DbOptions {
    /// Set the table size limit.
    pub fn with_table_size_limit(mut self, limit: usize) -> Self {
        self.table_size_limit = limit;
        self
    }

    /// Set the WAL flush threshold.
    pub fn with_wal_flush_threshold(mut self, bytes: u64) -> Self {
        self.wal_flush_threshold = bytes;
        self
    }

    /// fsync every batch.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

type Key = (ColumnFamily, Vec<u8>);

struct DbInner {
    data: BTreeMap<Key, Vec<u8>>,
    manifest: Manifest,
    wal: Wal,
}

/// Embedded ordered key-value store bound to one directory.
///
/// All methods take `&self`; the handle is shared behind an `Arc` by the
/// components of a partition. After [`close`](StateDb::close) every
/// operation fails with [`DbError::Closed`].
pub struct StateDb {
    path: PathBuf,
    options: DbOptions,
    inner: Mutex<Option<DbInner>>,
    lock: Mutex<Option<File>>,
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl StateDb {
    /// Open the database in `path`, creating an empty one if the directory
    /// holds none.
    ///
    /// Fails with [`DbError::Locked`] if another handle has the directory
    /// open and with [`DbError::Corruption`] if any file fails validation.
    pub fn open(path: &Path, options: DbOptions) -> DbResult<StateDb> {
        fs::create_dir_all(path)?;
        Self::open_in(path, options, true)
    }

    /// Open the database in `path`, which must already hold one.
    ///
    /// Never creates anything: a directory without a `MANIFEST` fails with
    /// [`DbError::Corruption`] ([`FormatError::MissingManifest`]). Used for
    /// directories seeded from a snapshot.
    pub fn open_existing(path: &Path, options: DbOptions) -> DbResult<StateDb> {
        if !path.join(MANIFEST_FILE).is_file() {
            return Err(DbError::corruption(path, FormatError::MissingManifest));
        }
        Self::open_in(path, options, false)
    }

    fn open_in(path: &Path, options: DbOptions, create: bool) -> DbResult<StateDb> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| DbError::Locked(path.to_path_buf()))?;

        let inner = if path.join(MANIFEST_FILE).exists() {
            Self::load(path)?
        } else if create {
            Self::create(path)?
        } else {
            return Err(DbError::corruption(path, FormatError::MissingManifest));
        };

        info!(
            target: "partstate::storage",
            path = %path.display(),
            keys = inner.data.len(),
            tables = inner.manifest.tables.len(),
            wal = inner.wal.number(),
            "Opened state database"
        );

        Ok(StateDb {
            path: path.to_path_buf(),
            options,
            inner: Mutex::new(Some(inner)),
            lock: Mutex::new(Some(lock)),
        })
    }

    fn create(path: &Path) -> DbResult<DbInner> {
        let has_data_files = fs::read_dir(path)?.filter_map(Result::ok).any(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.ends_with(".sst") || parse_wal_file_name(&name).is_some()
        });
        if has_data_files {
            return Err(DbError::corruption(path, FormatError::MissingManifest));
        }

        let manifest = Manifest::new(*uuid::Uuid::new_v4().as_bytes());
        manifest.write_atomic(path)?;
        let wal = Wal::open(path.join(wal_file_name(manifest.wal_number)), manifest.wal_number)?;
        debug!(target: "partstate::storage", path = %path.display(), "Created empty state database");
        Ok(DbInner {
            data: BTreeMap::new(),
            manifest,
            wal,
        })
    }

    fn load(path: &Path) -> DbResult<DbInner> {
        let manifest_path = path.join(MANIFEST_FILE);
        let manifest =
            Manifest::load(path)?.map_err(|e| DbError::corruption(&manifest_path, e))?;

        let mut data = BTreeMap::new();
        for table in &manifest.tables {
            let table_path = path.join(table_file_name(table.file_number));
            let missing = || {
                DbError::corruption(
                    &table_path,
                    FormatError::MissingTable {
                        file: table_file_name(table.file_number),
                        expected_size: table.size,
                    },
                )
            };
            let bytes = match fs::read(&table_path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
                Err(e) => return Err(e.into()),
            };
            let entries = decode_table(&bytes, manifest.database_uuid)
                .map_err(|e| DbError::corruption(&table_path, e))?;
            if bytes.len() as u64 != table.size {
                return Err(missing());
            }
            for (cf, key, value) in entries {
                data.insert((ColumnFamily(cf), key), value);
            }
        }

        let wal_path = path.join(wal_file_name(manifest.wal_number));
        let replay = wal::replay(&wal_path)?;
        for batch in &replay.batches {
            apply(&mut data, batch);
        }

        // Leftovers of an interrupted flush.
        for (number, stale) in list_table_files(path)? {
            if !manifest.tables.iter().any(|t| t.file_number == number) {
                debug!(target: "partstate::storage", path = %stale.display(), "Removing unreferenced table");
                fs::remove_file(&stale)?;
            }
        }
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let stale_wal = entry
                .file_name()
                .to_str()
                .and_then(parse_wal_file_name)
                .map_or(false, |number| number != manifest.wal_number);
            if stale_wal {
                debug!(target: "partstate::storage", path = %entry.path().display(), "Removing unreferenced WAL");
                fs::remove_file(entry.path())?;
            }
        }

        let wal = Wal::open(wal_path, manifest.wal_number)?;
        Ok(DbInner {
            data,
            manifest,
            wal,
        })
    }

    /// Directory the handle is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options the handle was opened with.
    pub fn options(&self) -> DbOptions {
        self.options
    }

    /// False once closed.
    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut DbInner) -> DbResult<R>) -> DbResult<R> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(DbError::Closed)?;
        f(inner)
    }

    /// Insert or overwrite a value.
    pub fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(cf, key, value);
        self.write(&batch)
    }

    /// Remove a key; absent keys are fine.
    pub fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(cf, key);
        self.write(&batch)
    }

    /// Apply a batch atomically.
    pub fn write(&self, batch: &WriteBatch) -> DbResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let needs_flush = self.with_inner(|inner| {
            inner.wal.append(batch, self.options.sync_writes)?;
            apply(&mut inner.data, batch);
            Ok(inner.wal.size() >= self.options.wal_flush_threshold)
        })?;
        if needs_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Read a value.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.with_inner(|inner| Ok(inner.data.get(&(cf, key.to_vec())).cloned()))
    }

    /// True if the key is present.
    pub fn exists(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<bool> {
        self.with_inner(|inner| Ok(inner.data.contains_key(&(cf, key.to_vec()))))
    }

    /// All entries of `cf` whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_inner(|inner| {
            let start = (cf, prefix.to_vec());
            Ok(inner
                .data
                .range((Bound::Included(start), Bound::Unbounded))
                .take_while(|((entry_cf, key), _)| *entry_cf == cf && key.starts_with(prefix))
                .map(|((_, key), value)| (key.clone(), value.clone()))
                .collect())
        })
    }

    /// Number of keys across all column families.
    pub fn len(&self) -> DbResult<usize> {
        self.with_inner(|inner| Ok(inner.data.len()))
    }

    /// True if the database holds no keys.
    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Move everything into tables and start a fresh WAL.
    pub fn flush(&self) -> DbResult<()> {
        let path = self.path.clone();
        let limit = self.options.table_size_limit;
        self.with_inner(|inner| {
            let mut next_file_number = inner.manifest.next_file_number;
            let tables = write_tables(
                &path,
                inner.manifest.database_uuid,
                &inner.data,
                limit,
                &mut next_file_number,
            )?;
            let wal_number = next_file_number;
            next_file_number += 1;

            let new_wal = Wal::open(path.join(wal_file_name(wal_number)), wal_number)?;
            let manifest = Manifest {
                database_uuid: inner.manifest.database_uuid,
                wal_number,
                next_file_number,
                tables,
            };
            manifest.write_atomic(&path)?;

            let old_manifest = std::mem::replace(&mut inner.manifest, manifest);
            let old_wal = std::mem::replace(&mut inner.wal, new_wal);
            for table in &old_manifest.tables {
                fs::remove_file(path.join(table_file_name(table.file_number)))?;
            }
            fs::remove_file(old_wal.path())?;

            debug!(
                target: "partstate::storage",
                path = %path.display(),
                tables = inner.manifest.tables.len(),
                wal = wal_number,
                "Flushed state database"
            );
            Ok(())
        })
    }

    /// Write a consistent copy of the database into `target`, which must not
    /// exist yet. The copy holds tables and a MANIFEST only, all fsynced.
    pub fn checkpoint(&self, target: &Path) -> DbResult<()> {
        if target.exists() {
            return Err(DbError::CheckpointTargetExists(target.to_path_buf()));
        }
        let limit = self.options.table_size_limit;
        self.with_inner(|inner| {
            fs::create_dir_all(target)?;
            let mut next_file_number = 1;
            let tables = write_tables(
                target,
                inner.manifest.database_uuid,
                &inner.data,
                limit,
                &mut next_file_number,
            )?;
            let manifest = Manifest {
                database_uuid: inner.manifest.database_uuid,
                wal_number: next_file_number,
                next_file_number: next_file_number + 1,
                tables,
            };
            manifest.write_atomic(target)?;
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                sync_dir(parent)?;
            }
            debug!(
                target: "partstate::storage",
                target_dir = %target.display(),
                keys = inner.data.len(),
                tables = manifest.tables.len(),
                "Wrote checkpoint"
            );
            Ok(())
        })
    }

    /// Sync the WAL and release the directory lock. Idempotent.
    pub fn close(&self) -> DbResult<()> {
        let inner = self.inner.lock().take();
        if let Some(mut inner) = inner {
            inner.wal.sync()?;
            debug!(target: "partstate::storage", path = %self.path.display(), "Closed state database");
        }
        if let Some(lock) = self.lock.lock().take() {
            // Dropping the file releases the lock as well.
            let _ = lock.unlock();
        }
        Ok(())
    }
}

impl Drop for StateDb {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn apply(data: &mut BTreeMap<Key, Vec<u8>>, batch: &WriteBatch) {
    for op in batch.ops() {
        match op {
            BatchOp::Put { cf, key, value } => {
                data.insert((*cf, key.clone()), value.clone());
            }
            BatchOp::Delete { cf, key } => {
                data.remove(&(*cf, key.clone()));
            }
        }
    }
}

/// Write `data` as tables of at most roughly `limit` bytes each.
fn write_tables(
    dir: &Path,
    database_uuid: [u8; 16],
    data: &BTreeMap<Key, Vec<u8>>,
    limit: usize,
    next_file_number: &mut u64,
) -> DbResult<Vec<TableRef>> {
    let mut tables = Vec::new();
    let mut chunk: Vec<(u8, &[u8], &[u8])> = Vec::new();
    let mut chunk_size = 0usize;

    for ((cf, key), value) in data {
        chunk.push((cf.0, key.as_slice(), value.as_slice()));
        chunk_size += encoded_entry_len(key, value);
        if chunk_size >= limit {
            tables.push(write_table(dir, database_uuid, &chunk, next_file_number)?);
            chunk.clear();
            chunk_size = 0;
        }
    }
    if !chunk.is_empty() {
        tables.push(write_table(dir, database_uuid, &chunk, next_file_number)?);
    }
    sync_dir(dir)?;
    Ok(tables)
}

fn write_table(
    dir: &Path,
    database_uuid: [u8; 16],
    entries: &[(u8, &[u8], &[u8])],
    next_file_number: &mut u64,
) -> DbResult<TableRef> {
    let bytes = encode_table(database_uuid, entries.iter().copied(), entries.len());
    let file_number = *next_file_number;
    *next_file_number += 1;
    write_new_file(&dir.join(table_file_name(file_number)), &bytes)?;
    Ok(TableRef {
        file_number,
        size: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StateDb {
        StateDb::open(dir.path(), DbOptions::default().with_table_size_limit(64)).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.put(ColumnFamily::DEFAULT, b"k", b"v").unwrap();
        assert_eq!(db.get(ColumnFamily::DEFAULT, b"k").unwrap(), Some(b"v".to_vec()));
        assert!(db.exists(ColumnFamily::DEFAULT, b"k").unwrap());
        assert_eq!(db.get(ColumnFamily(1), b"k").unwrap(), None);

        db.delete(ColumnFamily::DEFAULT, b"k").unwrap();
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn test_scan_prefix_stays_in_family() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.put(ColumnFamily(1), b"job/1", b"a").unwrap();
        db.put(ColumnFamily(1), b"job/2", b"b").unwrap();
        db.put(ColumnFamily(1), b"jobs", b"c").unwrap();
        db.put(ColumnFamily(2), b"job/3", b"d").unwrap();

        let found = db.scan_prefix(ColumnFamily(1), b"job/").unwrap();
        assert_eq!(
            found,
            vec![
                (b"job/1".to_vec(), b"a".to_vec()),
                (b"job/2".to_vec(), b"b".to_vec())
            ]
        );
    }

    #[test]
    fn test_flush_splits_tables_and_swaps_wal() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        for i in 0..20u32 {
            db.put(ColumnFamily::DEFAULT, &i.to_be_bytes(), &[0u8; 16]).unwrap();
        }
        db.flush().unwrap();

        let tables = list_table_files(dir.path()).unwrap();
        assert!(tables.len() > 1);
        assert!(!dir.path().join(wal_file_name(1)).exists());
        assert_eq!(db.len().unwrap(), 20);
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.close().unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.get(ColumnFamily::DEFAULT, b"k"), Err(DbError::Closed)));
    }
}
