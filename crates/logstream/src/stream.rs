//! Log stream
//!
//! A single-writer, append-only stream per partition. The stream runs as an
//! actor: appends are queued to it, it assigns the next position and hands
//! the entry to the [`DistributedLogBridge`]. The bridge's acknowledgement
//! advances the commit position, which readers never pass.
//!
//! ```text
//! build ──> open_appender ──> append* ──> close
//!                 │               │
//!                 │               └─ bridge ack ──> commit position
//!                 └─ appends before this fail with AppenderClosed
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use partstate_core::{
    is_valid_position, position_from_wire, position_to_wire, EventRegistry, Position,
};
use partstate_scheduler::{
    Actor, ActorControl, ActorError, ActorFuture, ActorScheduler, FutureCompleter,
};

use crate::bridge::{DistributedLogBridge, LocalLogBridge};
use crate::error::{LogStreamError, LogStreamResult};
use crate::reader::LogStreamReader;
use crate::storage::FsLogStorage;
use crate::typed::{TypedStreamReader, TypedStreamWriter};

/// Position of the first entry of an empty log.
pub const FIRST_POSITION: Position = 1;

/// State readable without going through the actor.
pub(crate) struct StreamShared {
    name: String,
    commit: AtomicI64,
}

impl StreamShared {
    pub(crate) fn commit_position(&self) -> Option<Position> {
        position_from_wire(self.commit.load(Ordering::SeqCst))
    }

    /// Raise the commit position; returns false if it was already at or past `position`.
    fn advance_commit(&self, position: Position) -> bool {
        let position = position_to_wire(Some(position));
        self.commit.fetch_max(position, Ordering::SeqCst) < position
    }
}

struct LogStreamActor {
    shared: Arc<StreamShared>,
    storage: Arc<FsLogStorage>,
    bridge: Arc<dyn DistributedLogBridge>,
    appender_open: bool,
    next_position: Position,
}

impl LogStreamActor {
    fn open_appender(&mut self) {
        if self.appender_open {
            return;
        }
        let after_written = self.storage.last_position().map_or(FIRST_POSITION, |p| p + 1);
        let after_commit = self.shared.commit_position().map_or(FIRST_POSITION, |p| p + 1);
        self.next_position = after_written.max(after_commit);
        self.appender_open = true;
        info!(
            target: "partstate::logstream",
            stream = %self.shared.name,
            next_position = self.next_position,
            "Opened log appender"
        );
    }

    fn append(&mut self, bytes: Vec<u8>, reply: FutureCompleter<LogStreamResult<Position>>) {
        if !self.appender_open {
            reply.complete(Err(LogStreamError::AppenderClosed));
            return;
        }
        let position = self.next_position;
        if !is_valid_position(position) {
            reply.complete(Err(LogStreamError::PositionOutOfRange(position)));
            return;
        }
        self.next_position += 1;

        // Acknowledged outside the actor; the commit position is atomic.
        let shared = self.shared.clone();
        self.bridge.append(bytes, position).on_complete(move |result| {
            let result = result.map_err(LogStreamError::from).and_then(|r| r);
            match &result {
                Ok(acked) => {
                    if shared.advance_commit(*acked) {
                        debug!(target: "partstate::logstream", position = *acked, "Commit position advanced");
                    }
                }
                Err(e) => {
                    warn!(target: "partstate::logstream", position, error = %e, "Append failed");
                }
            }
            reply.complete(result);
        });
    }
}

impl Actor for LogStreamActor {
    fn name(&self) -> String {
        format!("log-stream-{}", self.shared.name)
    }

    fn on_actor_closing(&mut self, control: &ActorControl<Self>) {
        self.appender_open = false;
        let storage = self.storage.clone();
        let name = self.shared.name.clone();
        control
            .run_blocking(move || storage.flush())
            .on_complete(move |result| match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "partstate::logstream", stream = %name, error = %e, "Failed to flush log on close");
                }
                Err(e) => {
                    debug!(target: "partstate::logstream", stream = %name, error = %e, "Skipped flush on close");
                }
            });
        info!(target: "partstate::logstream", stream = %self.shared.name, "Closed log stream");
    }
}

/// Builder for [`LogStream`].
pub struct LogStreamBuilder {
    storage: Arc<FsLogStorage>,
    name: String,
    bridge: Option<Arc<dyn DistributedLogBridge>>,
    commit_position: Option<Position>,
}

impl LogStreamBuilder {
    /// Stream name used in logs and the actor name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replication bridge. Defaults to a [`LocalLogBridge`] over the storage.
    pub fn bridge(mut self, bridge: Arc<dyn DistributedLogBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Commit position to start from.
    ///
    /// With the local bridge every written entry was acknowledged, so the
    /// stream starts at least at the last written position anyway.
    pub fn commit_position(mut self, position: Position) -> Self {
        self.commit_position = Some(position);
        self
    }

    /// Submit the stream actor to `scheduler`. The appender starts closed.
    pub fn build(self, scheduler: &ActorScheduler) -> LogStreamResult<LogStream> {
        if let Some(position) = self.commit_position.filter(|p| !is_valid_position(*p)) {
            return Err(LogStreamError::PositionOutOfRange(position));
        }
        let (bridge, commit) = match self.bridge {
            Some(bridge) => (bridge, self.commit_position),
            None => {
                let local: Arc<dyn DistributedLogBridge> =
                    Arc::new(LocalLogBridge::new(
                    self.storage.clone(),
                    scheduler.blocking_executor(),
                ));
                (local, self.commit_position.max(self.storage.last_position()))
            }
        };
        let shared = Arc::new(StreamShared {
            name: self.name,
            commit: AtomicI64::new(position_to_wire(commit)),
        });
        let control = scheduler.submit_actor(LogStreamActor {
            shared: shared.clone(),
            storage: self.storage.clone(),
            bridge,
            appender_open: false,
            next_position: FIRST_POSITION,
        })?;
        debug!(
            target: "partstate::logstream",
            stream = %shared.name,
            commit_position = ?commit,
            "Built log stream"
        );
        Ok(LogStream {
            shared,
            storage: self.storage,
            control,
        })
    }
}

/// Handle to a log stream actor. Cheap to clone.
#[derive(Clone)]
pub struct LogStream {
    shared: Arc<StreamShared>,
    storage: Arc<FsLogStorage>,
    control: ActorControl<LogStreamActor>,
}

impl LogStream {
    /// Start building a stream over `storage`.
    pub fn builder(storage: Arc<FsLogStorage>) -> LogStreamBuilder {
        LogStreamBuilder {
            storage,
            name: "0".to_string(),
            bridge: None,
            commit_position: None,
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The underlying log storage.
    pub fn storage(&self) -> &Arc<FsLogStorage> {
        &self.storage
    }

    /// Open the appender. Appends are accepted once the future resolves.
    pub fn open_appender(&self) -> ActorFuture<LogStreamResult<()>> {
        self.with_actor(|actor, _| {
            actor.open_appender();
            Ok(())
        })
    }

    /// Close the appender, leaving the stream and its readers usable.
    pub fn close_appender(&self) -> ActorFuture<LogStreamResult<()>> {
        self.with_actor(|actor, _| {
            actor.appender_open = false;
            Ok(())
        })
    }

    /// Append an entry; resolves to its position once the bridge acknowledged it.
    pub fn append(&self, bytes: impl Into<Vec<u8>>) -> ActorFuture<LogStreamResult<Position>> {
        let bytes = bytes.into();
        let (future, reply) = ActorFuture::pending();
        match self
            .control
            .run(move |actor, _| actor.append(bytes, reply))
        {
            Ok(()) => future,
            Err(e) => ActorFuture::completed(Err(closed_or(e))),
        }
    }

    fn with_actor<F>(&self, job: F) -> ActorFuture<LogStreamResult<()>>
    where
        F: FnOnce(&mut LogStreamActor, &ActorControl<LogStreamActor>) -> LogStreamResult<()>
            + Send
            + 'static,
    {
        let (future, reply) = ActorFuture::pending();
        match self
            .control
            .run(move |actor, control| reply.complete(job(actor, control)))
        {
            Ok(()) => future,
            Err(e) => ActorFuture::completed(Err(closed_or(e))),
        }
    }

    /// Highest acknowledged position, `None` before the first acknowledgement.
    pub fn commit_position(&self) -> Option<Position> {
        self.shared.commit_position()
    }

    /// Acknowledge entries up to `position`.
    ///
    /// The commit position never moves back; a lower value is ignored and
    /// `Ok(false)` returned. Fails once the stream is closed or for a
    /// position above [`MAX_POSITION`](partstate_core::MAX_POSITION).
    pub fn set_commit_position(&self, position: Position) -> LogStreamResult<bool> {
        if self.control.is_closed() {
            return Err(LogStreamError::StreamClosed);
        }
        if !is_valid_position(position) {
            return Err(LogStreamError::PositionOutOfRange(position));
        }
        Ok(self.shared.advance_commit(position))
    }

    /// Highest position written to storage, committed or not.
    pub fn last_written_position(&self) -> Option<Position> {
        self.storage.last_position()
    }

    /// Reader over committed entries, starting at the beginning.
    pub fn new_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.storage.clone(), self.shared.clone())
    }

    /// Writer of registry-validated typed records.
    pub fn new_typed_writer(&self, registry: Arc<EventRegistry>) -> TypedStreamWriter {
        TypedStreamWriter::new(self.clone(), registry)
    }

    /// Reader of registry-validated typed records.
    pub fn new_typed_reader(&self, registry: Arc<EventRegistry>) -> TypedStreamReader {
        TypedStreamReader::new(self.new_reader(), registry)
    }

    /// True once `close` was requested.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Close the stream; queued appends are still processed.
    pub fn close(&self) -> ActorFuture<()> {
        self.control.close()
    }
}

fn closed_or(error: ActorError) -> LogStreamError {
    match error {
        ActorError::Closed(_) => LogStreamError::StreamClosed,
        other => LogStreamError::Actor(other),
    }
}
