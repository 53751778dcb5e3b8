//! StateDb durability and corruption scenarios

use std::fs;
use std::path::Path;

use partstate_storage::format::{list_table_files, wal_file_name, MANIFEST_FILE};
use partstate_storage::{ColumnFamily, DbError, DbOptions, FormatError, StateDb, WriteBatch};
use proptest::prelude::*;
use tempfile::tempdir;

const CF: ColumnFamily = ColumnFamily::DEFAULT;

fn options() -> DbOptions {
    DbOptions::default().with_table_size_limit(128)
}

fn fill(db: &StateDb, count: u32) {
    for i in 0..count {
        db.put(CF, format!("key-{:04}", i).as_bytes(), &i.to_le_bytes())
            .unwrap();
    }
}

fn corrupt_newest_table(dir: &Path) {
    let (_, newest) = list_table_files(dir).unwrap().pop().unwrap();
    fs::write(newest, "<--corrupted-->").unwrap();
}

#[test]
fn writes_survive_reopen_through_wal() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 10);
        db.delete(CF, b"key-0003").unwrap();
        db.close().unwrap();
    }

    let db = StateDb::open(dir.path(), options()).unwrap();
    assert_eq!(db.len().unwrap(), 9);
    assert_eq!(db.get(CF, b"key-0003").unwrap(), None);
    assert_eq!(db.get(CF, b"key-0007").unwrap(), Some(7u32.to_le_bytes().to_vec()));
}

#[test]
fn writes_survive_reopen_through_tables() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 50);
        db.flush().unwrap();
        db.put(CF, b"after-flush", b"x").unwrap();
    }

    let db = StateDb::open(dir.path(), options()).unwrap();
    assert_eq!(db.len().unwrap(), 51);
    assert!(db.exists(CF, b"after-flush").unwrap());
}

#[test]
fn batch_is_atomic_and_ordered() {
    let dir = tempdir().unwrap();
    let db = StateDb::open(dir.path(), options()).unwrap();
    let mut batch = WriteBatch::new();
    batch
        .put(CF, "a", "1")
        .put(ColumnFamily(4), "a", "other")
        .delete(CF, "a")
        .put(CF, "b", "2");
    db.write(&batch).unwrap();

    assert_eq!(db.get(CF, b"a").unwrap(), None);
    assert_eq!(db.get(CF, b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(ColumnFamily(4), b"a").unwrap(), Some(b"other".to_vec()));
}

#[test]
fn second_handle_is_locked_out() {
    let dir = tempdir().unwrap();
    let db = StateDb::open(dir.path(), options()).unwrap();
    assert!(matches!(
        StateDb::open(dir.path(), options()),
        Err(DbError::Locked(_))
    ));

    db.close().unwrap();
    assert!(StateDb::open(dir.path(), options()).is_ok());
}

#[test]
fn automatic_flush_bounds_the_wal() {
    let dir = tempdir().unwrap();
    let db = StateDb::open(
        dir.path(),
        options().with_wal_flush_threshold(512),
    )
    .unwrap();
    fill(&db, 200);

    assert!(!list_table_files(dir.path()).unwrap().is_empty());
    assert!(!dir.path().join(wal_file_name(1)).exists());
    drop(db);

    let db = StateDb::open(dir.path(), options()).unwrap();
    assert_eq!(db.len().unwrap(), 200);
}

#[test]
fn checkpoint_is_an_openable_copy() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("checkpoint");
    let db = StateDb::open(&dir.path().join("runtime"), options()).unwrap();
    fill(&db, 30);
    db.checkpoint(&target).unwrap();
    db.put(CF, b"key-0000", b"changed").unwrap();

    assert!(target.join(MANIFEST_FILE).exists());
    assert!(list_table_files(&target).unwrap().len() > 1);

    let copy = StateDb::open(&target, options()).unwrap();
    assert_eq!(copy.len().unwrap(), 30);
    assert_eq!(copy.get(CF, b"key-0000").unwrap(), Some(0u32.to_le_bytes().to_vec()));
}

#[test]
fn checkpoint_of_empty_database_has_only_manifest() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("checkpoint");
    let db = StateDb::open(&dir.path().join("runtime"), options()).unwrap();
    db.checkpoint(&target).unwrap();

    let files: Vec<_> = fs::read_dir(&target).unwrap().collect();
    assert_eq!(files.len(), 1);
    assert!(StateDb::open(&target, options()).unwrap().is_empty().unwrap());
}

#[test]
fn checkpoint_refuses_existing_target() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("checkpoint");
    fs::create_dir_all(&target).unwrap();
    let db = StateDb::open(&dir.path().join("runtime"), options()).unwrap();
    assert!(matches!(
        db.checkpoint(&target),
        Err(DbError::CheckpointTargetExists(_))
    ));
}

#[test]
fn overwritten_table_is_corruption() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 20);
        db.flush().unwrap();
    }
    corrupt_newest_table(dir.path());

    let err = StateDb::open(dir.path(), options()).unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {}", err);
}

#[test]
fn missing_table_is_corruption() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 20);
        db.flush().unwrap();
    }
    let (_, first) = list_table_files(dir.path()).unwrap().remove(0);
    fs::remove_file(first).unwrap();

    assert!(matches!(
        StateDb::open(dir.path(), options()),
        Err(DbError::Corruption {
            source: FormatError::MissingTable { .. },
            ..
        })
    ));
}

#[test]
fn damaged_manifest_is_corruption() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 5);
        db.flush().unwrap();
    }
    let manifest = dir.path().join(MANIFEST_FILE);
    let mut bytes = fs::read(&manifest).unwrap();
    bytes[9] ^= 0x40;
    fs::write(&manifest, bytes).unwrap();

    assert!(StateDb::open(dir.path(), options()).unwrap_err().is_corruption());
}

#[test]
fn tables_without_manifest_are_corruption() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 5);
        db.flush().unwrap();
    }
    fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();

    assert!(StateDb::open(dir.path(), options()).unwrap_err().is_corruption());
}

#[test]
fn open_existing_never_creates() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        StateDb::open_existing(dir.path(), options()),
        Err(DbError::Corruption {
            source: FormatError::MissingManifest,
            ..
        })
    ));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

    let target = dir.path().join("checkpoint");
    let db = StateDb::open(&dir.path().join("runtime"), options()).unwrap();
    db.checkpoint(&target).unwrap();
    assert!(StateDb::open_existing(&target, options()).unwrap().is_empty().unwrap());

    let empty = dir.path().join("emptied");
    fs::create_dir_all(&empty).unwrap();
    fs::copy(target.join(MANIFEST_FILE), empty.join("unrelated")).unwrap();
    assert!(StateDb::open_existing(&empty, options()).unwrap_err().is_corruption());
}

#[test]
fn torn_wal_tail_loses_only_last_batch() {
    let dir = tempdir().unwrap();
    {
        let db = StateDb::open(dir.path(), options()).unwrap();
        fill(&db, 10);
    }
    let wal = dir.path().join(wal_file_name(1));
    let len = fs::metadata(&wal).unwrap().len();
    fs::OpenOptions::new()
        .write(true)
        .open(&wal)
        .unwrap()
        .set_len(len - 2)
        .unwrap();

    let db = StateDb::open(dir.path(), options()).unwrap();
    assert_eq!(db.len().unwrap(), 9);
    assert_eq!(db.get(CF, b"key-0009").unwrap(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever mix of writes, flushes and reopens, the database matches a
    /// plain map.
    #[test]
    fn matches_reference_map(ops in prop::collection::vec((0u8..3, 0u8..16, any::<u8>()), 1..80)) {
        let dir = tempdir().unwrap();
        let mut model = std::collections::BTreeMap::new();
        let mut db = StateDb::open(dir.path(), options()).unwrap();

        for (kind, key, value) in ops {
            let key = [key];
            match kind {
                0 => {
                    db.put(CF, &key, &[value]).unwrap();
                    model.insert(key.to_vec(), vec![value]);
                }
                1 => {
                    db.delete(CF, &key).unwrap();
                    model.remove(&key.to_vec());
                }
                _ => {
                    if value % 2 == 0 {
                        db.flush().unwrap();
                    } else {
                        drop(db);
                        db = StateDb::open(dir.path(), options()).unwrap();
                    }
                }
            }
        }

        let all: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(db.scan_prefix(CF, b"").unwrap(), all);
    }
}
