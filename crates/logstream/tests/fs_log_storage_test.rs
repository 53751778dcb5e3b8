//! Segment rotation, reopen and torn-tail handling of the file log

use std::fs::{self, OpenOptions};

use partstate_logstream::storage::{segment_file_name, SEGMENT_HEADER_SIZE};
use partstate_logstream::{FsLogStorage, LogStreamError};
use proptest::prelude::*;
use tempfile::tempdir;

const SEGMENT_SIZE: u64 = 256;

fn entry(i: u64) -> Vec<u8> {
    format!("entry-{:04}", i).into_bytes()
}

#[test]
fn rotates_segments_and_reads_across_them() {
    let dir = tempdir().unwrap();
    let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
    for i in 1..=50 {
        log.append(i, &entry(i)).unwrap();
    }

    assert!(log.segment_count() > 1);
    for name in fs::read_dir(dir.path()).unwrap() {
        let len = name.unwrap().metadata().unwrap().len();
        assert!(len <= SEGMENT_SIZE);
    }
    for i in 1..=50 {
        assert_eq!(log.read(i).unwrap().unwrap().payload, entry(i));
    }
}

#[test]
fn reopen_restores_index_and_last_position() {
    let dir = tempdir().unwrap();
    {
        let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
        for i in (10..=300).step_by(10) {
            log.append(i, &entry(i)).unwrap();
        }
        log.flush().unwrap();
    }

    let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
    assert_eq!(log.len(), 30);
    assert_eq!(log.first_position(), Some(10));
    assert_eq!(log.last_position(), Some(300));
    assert_eq!(log.read_from(11).unwrap().unwrap().position, 20);

    log.append(301, b"after reopen").unwrap();
    assert!(matches!(
        log.append(5, b"too low"),
        Err(LogStreamError::NonMonotonicPosition { position: 5, last: 301 })
    ));
}

#[test]
fn torn_tail_is_truncated() {
    let dir = tempdir().unwrap();
    let newest;
    {
        let log = FsLogStorage::open(dir.path(), 4096).unwrap();
        for i in 1..=5 {
            log.append(i, &entry(i)).unwrap();
        }
        log.flush().unwrap();
        newest = dir.path().join(segment_file_name(0));
    }
    let len = fs::metadata(&newest).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&newest)
        .unwrap()
        .set_len(len - 3)
        .unwrap();

    let log = FsLogStorage::open(dir.path(), 4096).unwrap();
    assert_eq!(log.last_position(), Some(4));
    log.append(5, b"rewritten").unwrap();
    drop(log);

    let log = FsLogStorage::open(dir.path(), 4096).unwrap();
    assert_eq!(log.read(5).unwrap().unwrap().payload, b"rewritten");
}

#[test]
fn damage_inside_closed_segment_is_corruption() {
    let dir = tempdir().unwrap();
    {
        let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
        for i in 1..=40 {
            log.append(i, &entry(i)).unwrap();
        }
        assert!(log.segment_count() > 2);
    }
    let first = dir.path().join(segment_file_name(0));
    let mut bytes = fs::read(&first).unwrap();
    let target = SEGMENT_HEADER_SIZE as usize + 20;
    bytes[target] ^= 0xff;
    fs::write(&first, bytes).unwrap();

    assert!(matches!(
        FsLogStorage::open(dir.path(), SEGMENT_SIZE),
        Err(LogStreamError::Corruption { .. })
    ));
}

#[test]
fn unrelated_files_are_ignored() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("README"), b"not a segment").unwrap();
    let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
    assert!(log.is_empty());
    assert_eq!(log.segment_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the entry sizes, every entry reads back after a reopen.
    #[test]
    fn entries_survive_reopen(sizes in prop::collection::vec(0usize..400, 1..40)) {
        let dir = tempdir().unwrap();
        {
            let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
            for (i, size) in sizes.iter().enumerate() {
                log.append(i as u64 + 1, &vec![i as u8; *size]).unwrap();
            }
        }
        let log = FsLogStorage::open(dir.path(), SEGMENT_SIZE).unwrap();
        prop_assert_eq!(log.len(), sizes.len());
        for (i, size) in sizes.iter().enumerate() {
            let read = log.read(i as u64 + 1).unwrap().unwrap();
            prop_assert_eq!(read.payload, vec![i as u8; *size]);
        }
    }
}
