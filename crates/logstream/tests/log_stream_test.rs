//! Appender lifecycle, commit position and readers of the log stream actor

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use partstate_core::{EventRegistry, EventType, Position, SchemaDescriptor, MAX_POSITION};
use partstate_logstream::{
    DistributedLogBridge, FsLogStorage, LocalLogBridge, LogStream, LogStreamError,
    LogStreamResult, FIRST_POSITION,
};
use partstate_scheduler::{ActorFuture, ActorScheduler, FutureCompleter};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn scheduler() -> ActorScheduler {
    ActorScheduler::builder()
        .name("log-stream-test")
        .thread_count(2)
        .build()
        .unwrap()
}

fn storage(dir: &TempDir) -> Arc<FsLogStorage> {
    Arc::new(FsLogStorage::open(dir.path(), 4096).unwrap())
}

fn open_stream(dir: &TempDir, scheduler: &ActorScheduler) -> LogStream {
    let stream = LogStream::builder(storage(dir)).build(scheduler).unwrap();
    stream.open_appender().join_timeout(WAIT).unwrap().unwrap();
    stream
}

fn append(stream: &LogStream, bytes: &[u8]) -> LogStreamResult<Position> {
    stream.append(bytes.to_vec()).join_timeout(WAIT).unwrap()
}

#[test]
fn append_before_open_appender_is_rejected() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = LogStream::builder(storage(&dir)).build(&scheduler).unwrap();

    assert!(matches!(
        append(&stream, b"early"),
        Err(LogStreamError::AppenderClosed)
    ));
    assert!(stream.storage().is_empty());

    stream.open_appender().join_timeout(WAIT).unwrap().unwrap();
    assert_eq!(append(&stream, b"now").unwrap(), FIRST_POSITION);
}

#[test]
fn positions_increase_and_commit_follows_acknowledgement() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    assert_eq!(stream.commit_position(), None);

    let positions: Vec<Position> = (0..10)
        .map(|i| append(&stream, format!("e{}", i).as_bytes()).unwrap())
        .collect();

    assert_eq!(positions, (1..=10).collect::<Vec<_>>());
    assert_eq!(stream.commit_position(), Some(10));
    assert_eq!(stream.last_written_position(), Some(10));
}

#[test]
fn commit_position_never_moves_back() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);

    assert!(stream.set_commit_position(40).unwrap());
    assert!(!stream.set_commit_position(12).unwrap());
    assert_eq!(stream.commit_position(), Some(40));
}

#[test]
fn close_rejects_appends_and_commit_updates() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    append(&stream, b"before").unwrap();

    stream.close().join_timeout(WAIT).unwrap();

    assert!(stream.is_closed());
    assert!(matches!(
        append(&stream, b"after"),
        Err(LogStreamError::StreamClosed)
    ));
    assert!(matches!(
        stream.set_commit_position(99),
        Err(LogStreamError::StreamClosed)
    ));
    assert_eq!(stream.commit_position(), Some(1));
}

#[test]
fn close_appender_keeps_stream_readable() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    append(&stream, b"one").unwrap();

    stream.close_appender().join_timeout(WAIT).unwrap().unwrap();

    assert!(matches!(
        append(&stream, b"two"),
        Err(LogStreamError::AppenderClosed)
    ));
    let read: Vec<_> = stream.new_reader().map(|e| e.unwrap().payload).collect();
    assert_eq!(read, vec![b"one".to_vec()]);
}

#[test]
fn reopened_stream_continues_after_last_position() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    {
        let stream = open_stream(&dir, &scheduler);
        for _ in 0..3 {
            append(&stream, b"x").unwrap();
        }
        stream.close().join_timeout(WAIT).unwrap();
    }

    let stream = open_stream(&dir, &scheduler);
    assert_eq!(stream.commit_position(), Some(3));
    assert_eq!(append(&stream, b"y").unwrap(), 4);
}

#[test]
fn initial_commit_position_moves_next_position() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = LogStream::builder(storage(&dir))
        .commit_position(500)
        .build(&scheduler)
        .unwrap();
    stream.open_appender().join_timeout(WAIT).unwrap().unwrap();

    assert_eq!(stream.commit_position(), Some(500));
    assert_eq!(append(&stream, b"x").unwrap(), 501);
}

/// Holds acknowledgements until the test releases them.
struct ManualBridge {
    local: LocalLogBridge,
    pending: Arc<Mutex<Vec<(Position, FutureCompleter<LogStreamResult<Position>>)>>>,
}

impl ManualBridge {
    fn acknowledge_all(&self) {
        for (position, completer) in self.pending.lock().drain(..) {
            completer.complete(Ok(position));
        }
    }
}

impl DistributedLogBridge for ManualBridge {
    fn append(&self, bytes: Vec<u8>, position: Position) -> ActorFuture<LogStreamResult<Position>> {
        let (future, completer) = ActorFuture::pending();
        let pending = self.pending.clone();
        self.local
            .append(bytes, position)
            .on_complete(move |written| match written {
                Ok(Ok(_)) => pending.lock().push((position, completer)),
                Ok(Err(e)) => completer.complete(Err(e)),
                Err(e) => completer.complete(Err(e.into())),
            });
        future
    }
}

#[test]
fn local_bridge_writes_in_handover_order() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let storage = storage(&dir);
    let bridge = LocalLogBridge::new(storage.clone(), scheduler.blocking_executor());

    let acks: Vec<_> = (1..=50u64)
        .map(|p| bridge.append(p.to_be_bytes().to_vec(), p))
        .collect();
    for (ack, expected) in acks.into_iter().zip(1..) {
        assert_eq!(ack.join_timeout(WAIT).unwrap().unwrap(), expected);
    }

    assert_eq!(storage.last_position(), Some(50));
    for p in 1..=50u64 {
        let entry = storage.read(p).unwrap().unwrap();
        assert_eq!(entry.payload, p.to_be_bytes().to_vec());
    }
}

#[test]
fn local_bridge_fails_appends_once_scheduler_is_gone() {
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir);
    let bridge = {
        let scheduler = scheduler();
        LocalLogBridge::new(storage.clone(), scheduler.blocking_executor())
    };

    let result = bridge.append(b"late".to_vec(), 1).join_timeout(WAIT).unwrap();

    assert!(matches!(result, Err(LogStreamError::Replication { position: 1, .. })));
    assert!(storage.is_empty());
}

#[test]
fn positions_past_the_signed_range_are_rejected() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();

    assert!(matches!(
        LogStream::builder(storage(&dir))
            .commit_position(MAX_POSITION + 1)
            .build(&scheduler),
        Err(LogStreamError::PositionOutOfRange(_))
    ));

    let stream = LogStream::builder(storage(&dir))
        .commit_position(MAX_POSITION)
        .build(&scheduler)
        .unwrap();
    stream.open_appender().join_timeout(WAIT).unwrap().unwrap();

    assert!(matches!(
        append(&stream, b"x"),
        Err(LogStreamError::PositionOutOfRange(p)) if p == MAX_POSITION + 1
    ));
    assert!(matches!(
        stream.set_commit_position(u64::MAX),
        Err(LogStreamError::PositionOutOfRange(_))
    ));
    assert_eq!(stream.commit_position(), Some(MAX_POSITION));
    assert!(stream.storage().is_empty());
}

#[test]
fn reader_stops_at_commit_position() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let storage = storage(&dir);
    let bridge = Arc::new(ManualBridge {
        local: LocalLogBridge::new(storage.clone(), scheduler.blocking_executor()),
        pending: Arc::new(Mutex::new(Vec::new())),
    });
    let stream = LogStream::builder(storage)
        .bridge(bridge.clone())
        .build(&scheduler)
        .unwrap();
    stream.open_appender().join_timeout(WAIT).unwrap().unwrap();

    let first = stream.append(b"a".to_vec());
    let second = stream.append(b"b".to_vec());
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(stream.last_written_position(), Some(2));
    assert_eq!(stream.commit_position(), None);
    let mut reader = stream.new_reader();
    assert!(reader.next().is_none());

    bridge.acknowledge_all();
    assert_eq!(first.join_timeout(WAIT).unwrap().unwrap(), 1);
    assert_eq!(second.join_timeout(WAIT).unwrap().unwrap(), 2);
    assert_eq!(stream.commit_position(), Some(2));

    let payloads: Vec<_> = reader.map(|e| e.unwrap().payload).collect();
    assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn reader_seek() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    for i in 0..5u8 {
        append(&stream, &[i]).unwrap();
    }

    let mut reader = stream.new_reader();
    reader.seek(4);
    let rest: Vec<_> = reader.by_ref().map(|e| e.unwrap().position).collect();
    assert_eq!(rest, vec![4, 5]);

    reader.seek_to_end();
    assert_eq!(reader.position(), 6);
    append(&stream, b"late").unwrap();
    assert_eq!(reader.next().unwrap().unwrap().payload, b"late");
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TopicEvent {
    name: String,
    partitions: u32,
}

const TOPIC: EventType = EventType(1);
const PARTITION: EventType = EventType(2);

fn registry(topic_version: u16) -> Arc<EventRegistry> {
    Arc::new(
        EventRegistry::builder()
            .register(TOPIC, SchemaDescriptor::new("topic", topic_version))
            .unwrap()
            .register(PARTITION, SchemaDescriptor::new("partition", 1))
            .unwrap()
            .build(),
    )
}

#[test]
fn typed_records_round_trip_through_the_stream() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    let writer = stream.new_typed_writer(registry(1));

    let event = TopicEvent {
        name: "orders".to_string(),
        partitions: 3,
    };
    let position = writer.write(TOPIC, &event).join_timeout(WAIT).unwrap().unwrap();
    writer.write(PARTITION, &7u32).join_timeout(WAIT).unwrap().unwrap();

    let records: Vec<_> = stream
        .new_typed_reader(registry(1))
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].position, position);
    assert_eq!(records[0].event_type, TOPIC);
    assert_eq!(records[0].value::<TopicEvent>().unwrap(), event);
    assert_eq!(records[1].value::<u32>().unwrap(), 7);
}

#[test]
fn typed_writer_rejects_unregistered_type() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    let writer = stream.new_typed_writer(registry(1));

    let result = writer.write(EventType(9), &"x").join_timeout(WAIT).unwrap();
    assert!(matches!(result, Err(LogStreamError::Registry(_))));
    assert!(stream.storage().is_empty());
}

#[test]
fn typed_reader_rejects_newer_schema() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    stream
        .new_typed_writer(registry(2))
        .write(TOPIC, &TopicEvent {
            name: "t".to_string(),
            partitions: 1,
        })
        .join_timeout(WAIT)
        .unwrap()
        .unwrap();

    let mut reader = stream.new_typed_reader(registry(1));
    assert!(matches!(
        reader.next(),
        Some(Err(LogStreamError::UnsupportedSchemaVersion {
            written: 2,
            supported: 1,
            ..
        }))
    ));
}

#[test]
fn raw_entry_without_header_fails_to_decode() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let stream = open_stream(&dir, &scheduler);
    append(&stream, b"ab").unwrap();

    let mut reader = stream.new_typed_reader(registry(1));
    assert!(matches!(
        reader.next(),
        Some(Err(LogStreamError::Decode { position: 1, .. }))
    ));
}
