//! End-to-end partition lifecycle: open, write, snapshot, restart, recover

use std::sync::Arc;
use std::time::{Duration, Instant};

use partstate::{
    ActorScheduler, ColumnFamily, ControlledActorClock, Partition, PartitionConfig,
    PartitionError, SnapshotError,
};
use partstate_durability::testing::{corrupt_snapshot, init_tracing};
use tempfile::TempDir;

const CF: ColumnFamily = ColumnFamily::DEFAULT;

fn scheduler() -> ActorScheduler {
    ActorScheduler::builder()
        .name("partition-test")
        .thread_count(2)
        .build()
        .unwrap()
}

fn config(dir: &TempDir) -> PartitionConfig {
    PartitionConfig::for_testing(dir.path()).with_max_snapshots(2)
}

fn commit_event(partition: &Partition, key: &str, value: &str) -> u64 {
    partition.db().put(CF, key.as_bytes(), value.as_bytes()).unwrap();
    partition
        .log_stream()
        .append(format!("{}={}", key, value).into_bytes())
        .join()
        .unwrap()
        .unwrap()
}

fn value(partition: &Partition, key: &str) -> Option<String> {
    partition
        .db()
        .get(CF, key.as_bytes())
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

#[test]
fn fresh_partition_starts_empty() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();

    let partition = Partition::open(config(&dir), &scheduler).unwrap();

    assert_eq!(partition.recovered_position(), None);
    assert!(partition.db().is_empty().unwrap());
    assert_eq!(partition.log_stream().commit_position(), None);
    assert!(partition.restore_info().unwrap().is_null());
    assert_eq!(partition.snapshot_now().unwrap(), None);
    partition.close().unwrap();
}

#[test]
fn restart_recovers_last_snapshot() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();

    let snapshot_position;
    let last_position;
    {
        let partition = Partition::open(config(&dir), &scheduler).unwrap();
        commit_event(&partition, "order-1", "created");
        let position = commit_event(&partition, "order-2", "created");
        snapshot_position = partition.snapshot_now().unwrap().unwrap();
        assert_eq!(snapshot_position, position);

        // Not part of any snapshot.
        last_position = commit_event(&partition, "order-1", "shipped");
        partition.close().unwrap();
    }

    let partition = Partition::open(config(&dir), &scheduler).unwrap();
    assert_eq!(partition.recovered_position(), Some(snapshot_position));
    assert_eq!(value(&partition, "order-1").as_deref(), Some("created"));
    assert_eq!(value(&partition, "order-2").as_deref(), Some("created"));
    assert!(partition.log_stream().commit_position() >= Some(snapshot_position));

    let next = commit_event(&partition, "order-3", "created");
    assert!(next > last_position);
    let info = partition.restore_info().unwrap();
    assert_eq!(info.snapshot_id(), snapshot_position as i64);
    partition.close().unwrap();
}

#[test]
fn retention_keeps_newest_snapshots() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let partition = Partition::open(config(&dir), &scheduler).unwrap();

    let mut taken = Vec::new();
    for i in 0..4 {
        commit_event(&partition, "counter", &i.to_string());
        taken.push(partition.snapshot_now().unwrap().unwrap());
    }

    let controller = partition.snapshot_controller();
    assert_eq!(controller.valid_snapshots_count().unwrap(), 2);
    assert_eq!(
        controller.storage().list_valid().unwrap(),
        taken[2..].to_vec()
    );
    partition.close().unwrap();
}

#[test]
fn corrupted_newest_snapshot_falls_back() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();

    let (older, newer);
    {
        let partition = Partition::open(config(&dir), &scheduler).unwrap();
        commit_event(&partition, "x", "1");
        older = partition.snapshot_now().unwrap().unwrap();
        commit_event(&partition, "x", "2");
        newer = partition.snapshot_now().unwrap().unwrap();
        let newest_dir = partition
            .snapshot_controller()
            .storage()
            .snapshot_directory_for(newer);
        partition.close().unwrap();
        assert!(corrupt_snapshot(&newest_dir).unwrap());
    }

    let partition = Partition::open(config(&dir), &scheduler).unwrap();
    assert_eq!(partition.recovered_position(), Some(older));
    assert_eq!(value(&partition, "x").as_deref(), Some("1"));
    assert!(!partition
        .snapshot_controller()
        .storage()
        .snapshot_directory_for(newer)
        .exists());
    partition.close().unwrap();
}

#[test]
fn all_snapshots_corrupted_fails_open() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let snapshot_dir;
    {
        let partition = Partition::open(config(&dir), &scheduler).unwrap();
        commit_event(&partition, "x", "1");
        let position = partition.snapshot_now().unwrap().unwrap();
        snapshot_dir = partition
            .snapshot_controller()
            .storage()
            .snapshot_directory_for(position);
        partition.close().unwrap();
    }
    assert!(corrupt_snapshot(&snapshot_dir).unwrap());

    match Partition::open(config(&dir), &scheduler) {
        Err(PartitionError::Snapshot(SnapshotError::RecoveryFailed { attempted })) => {
            assert_eq!(attempted.len(), 1);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("partition opened from corrupted snapshots"),
    }
    assert!(snapshot_dir.exists());
}

#[test]
fn director_snapshots_on_clock_tick() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ControlledActorClock::new());
    clock.pin_current_time();
    let scheduler = ActorScheduler::builder()
        .thread_count(2)
        .clock(clock.clone())
        .build()
        .unwrap();
    let config = config(&dir).with_snapshot_period(Duration::from_secs(30));
    let partition = Partition::open(config, &scheduler).unwrap();

    let position = commit_event(&partition, "k", "v");
    // Queued behind the director's start, so its timer is registered.
    partition.snapshot_director().last_snapshot_position().join().unwrap();
    clock.add_time(Duration::from_secs(30));

    let controller = partition.snapshot_controller().clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.last_valid_snapshot_position().unwrap() != Some(position) {
        assert!(Instant::now() < deadline, "no periodic snapshot");
        std::thread::sleep(Duration::from_millis(5));
    }
    partition.close().unwrap();
}

#[test]
fn scheduler_from_config() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir).with_scheduler_threads(1);
    let scheduler = Partition::scheduler(&config).unwrap();

    let partition = Partition::open(config, &scheduler).unwrap();
    commit_event(&partition, "k", "v");
    assert_eq!(value(&partition, "k").as_deref(), Some("v"));
    partition.close().unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let config = PartitionConfig::for_testing(dir.path()).with_max_snapshots(0);

    assert!(matches!(
        Partition::open(config, &scheduler),
        Err(PartitionError::Config(_))
    ));
}
