//! Distributed log bridge
//!
//! The log stream assigns positions; the bridge makes an entry durable
//! (locally, or through a replication protocol) and acknowledges it. An
//! acknowledged position becomes the stream's commit position.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use partstate_core::Position;
use partstate_scheduler::{ActorFuture, BlockingExecutor, FutureCompleter};

use crate::error::{LogStreamError, LogStreamResult};
use crate::storage::FsLogStorage;

/// Replication endpoint of a log stream.
pub trait DistributedLogBridge: Send + Sync + 'static {
    /// Make `bytes` durable as the entry at `position`.
    ///
    /// Called from the stream actor, so it must not block. Resolves to the
    /// acknowledged position once the entry is committed.
    fn append(&self, bytes: Vec<u8>, position: Position) -> ActorFuture<LogStreamResult<Position>>;
}

struct PendingWrite {
    bytes: Vec<u8>,
    position: Position,
    reply: FutureCompleter<LogStreamResult<Position>>,
}

#[derive(Default)]
struct WriteLane {
    queue: VecDeque<PendingWrite>,
    draining: bool,
}

struct LocalWriter {
    storage: Arc<FsLogStorage>,
    lane: Mutex<WriteLane>,
}

impl LocalWriter {
    /// Write queued entries in arrival order until the queue stays empty.
    ///
    /// Each batch is synced once before its entries are acknowledged.
    fn drain(&self) {
        loop {
            let batch: Vec<PendingWrite> = {
                let mut lane = self.lane.lock();
                if lane.queue.is_empty() {
                    lane.draining = false;
                    return;
                }
                lane.queue.drain(..).collect()
            };

            let mut written = Vec::with_capacity(batch.len());
            for write in batch {
                match self.storage.append(write.position, &write.bytes) {
                    Ok(()) => written.push(write),
                    Err(e) => write.reply.complete(Err(e)),
                }
            }
            if written.is_empty() {
                continue;
            }
            match self.storage.flush() {
                Ok(()) => {
                    trace!(target: "partstate::logstream", entries = written.len(), "Appended locally");
                    for write in written {
                        write.reply.complete(Ok(write.position));
                    }
                }
                Err(e) => {
                    warn!(target: "partstate::logstream", error = %e, "Failed to sync log");
                    let message = e.to_string();
                    for write in written {
                        write.reply.complete(Err(LogStreamError::Replication {
                            position: write.position,
                            message: message.clone(),
                        }));
                    }
                }
            }
        }
    }

    /// Reject everything queued; the drain task could not run.
    fn abandon(&self, error: LogStreamError) {
        let pending: Vec<PendingWrite> = {
            let mut lane = self.lane.lock();
            lane.draining = false;
            lane.queue.drain(..).collect()
        };
        let message = error.to_string();
        for write in pending {
            write.reply.complete(Err(LogStreamError::Replication {
                position: write.position,
                message: message.clone(),
            }));
        }
    }
}

/// Single-node bridge: writes to the local log storage and acknowledges
/// once the entry is synced.
///
/// Writes run on the scheduler's blocking pool through one lane, so they
/// reach storage in the order the stream handed them over. At most one
/// drain task is queued at a time.
pub struct LocalLogBridge {
    writer: Arc<LocalWriter>,
    executor: BlockingExecutor,
}

impl LocalLogBridge {
    /// Bridge writing to `storage` from `executor`'s blocking pool.
    pub fn new(storage: Arc<FsLogStorage>, executor: BlockingExecutor) -> Self {
        LocalLogBridge {
            writer: Arc::new(LocalWriter {
                storage,
                lane: Mutex::new(WriteLane::default()),
            }),
            executor,
        }
    }
}

impl DistributedLogBridge for LocalLogBridge {
    fn append(&self, bytes: Vec<u8>, position: Position) -> ActorFuture<LogStreamResult<Position>> {
        let (future, reply) = ActorFuture::pending();
        let start_drain = {
            let mut lane = self.writer.lane.lock();
            lane.queue.push_back(PendingWrite {
                bytes,
                position,
                reply,
            });
            !std::mem::replace(&mut lane.draining, true)
        };

        if start_drain {
            let writer = self.writer.clone();
            let drained = self.executor.submit(move || writer.drain());
            let writer = self.writer.clone();
            drained.on_complete(move |result| {
                if let Err(e) = result {
                    writer.abandon(e.into());
                }
            });
        }
        future
    }
}
