//! Periodic snapshots
//!
//! The [`SnapshotDirector`] is an actor: every `period` of the scheduler
//! clock it checks the commit position and, if it moved past the last
//! snapshot, takes a snapshot there and enforces retention. The snapshot is
//! written on the scheduler's blocking pool; the director keeps at most one
//! in flight and skips ticks while one is running.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use partstate_core::Position;
use partstate_scheduler::{
    Actor, ActorControl, ActorError, ActorFuture, ActorScheduler, FutureCompleter, TimerHandle,
};

use crate::controller::StateSnapshotController;
use crate::error::{SnapshotError, SnapshotResult};

/// Supplies the position up to which the log is committed.
pub trait CommitPositionSource: Send + Sync + 'static {
    /// Current commit position, `None` before anything was committed.
    fn commit_position(&self) -> Option<Position>;
}

impl<F> CommitPositionSource for F
where
    F: Fn() -> Option<Position> + Send + Sync + 'static,
{
    fn commit_position(&self) -> Option<Position> {
        self()
    }
}

type SnapshotReply = FutureCompleter<SnapshotResult<Option<Position>>>;

/// Actor taking snapshots at the commit position.
pub struct SnapshotDirector {
    controller: Arc<StateSnapshotController>,
    commit_position: Box<dyn CommitPositionSource>,
    period: Duration,
    timer: Option<TimerHandle>,
    in_flight: bool,
    last_snapshot: Option<Position>,
}

impl SnapshotDirector {
    /// Director for `controller`, ticking every `period`.
    pub fn new(
        controller: Arc<StateSnapshotController>,
        commit_position: impl CommitPositionSource,
        period: Duration,
    ) -> Self {
        SnapshotDirector {
            controller,
            commit_position: Box::new(commit_position),
            period,
            timer: None,
            in_flight: false,
            last_snapshot: None,
        }
    }

    /// Submit to `scheduler` and start ticking.
    pub fn start(self, scheduler: &ActorScheduler) -> Result<SnapshotDirectorHandle, ActorError> {
        let control = scheduler.submit_actor(self)?;
        Ok(SnapshotDirectorHandle { control })
    }

    fn snapshot(&mut self, control: &ActorControl<Self>, reply: Option<SnapshotReply>) {
        if self.in_flight {
            debug!(target: "partstate::snapshot", "Snapshot still in progress, skipping");
            if let Some(reply) = reply {
                reply.complete(Err(SnapshotError::SnapshotInProgress));
            }
            return;
        }

        let commit = self.commit_position.commit_position();
        let position = match commit {
            Some(position) if self.last_snapshot.map_or(true, |last| position > last) => position,
            _ => {
                if let Some(reply) = reply {
                    reply.complete(Ok(None));
                }
                return;
            }
        };

        self.in_flight = true;
        let controller = self.controller.clone();
        let write = control.run_blocking(move || -> SnapshotResult<()> {
            controller.take_snapshot(position)?;
            controller.ensure_max_snapshot_count()?;
            Ok(())
        });
        control.run_on_completion(write, move |director, _, result| {
            director.in_flight = false;
            let result = result.map_err(SnapshotError::from).and_then(|r| r);
            match &result {
                Ok(()) => {
                    director.last_snapshot = Some(position);
                    info!(target: "partstate::snapshot", position, "Periodic snapshot complete");
                }
                Err(e) => {
                    warn!(target: "partstate::snapshot", position, error = %e, "Periodic snapshot failed");
                }
            }
            if let Some(reply) = reply {
                reply.complete(result.map(|()| Some(position)));
            }
        });
    }
}

impl Actor for SnapshotDirector {
    fn name(&self) -> String {
        "snapshot-director".to_string()
    }

    fn on_actor_started(&mut self, control: &ActorControl<Self>) {
        match self.controller.last_valid_snapshot_position() {
            Ok(last) => self.last_snapshot = last,
            Err(e) => warn!(target: "partstate::snapshot", error = %e, "Cannot read last snapshot position"),
        }
        self.timer = Some(control.run_at_fixed_rate(self.period, |director, control| {
            director.snapshot(control, None)
        }));
        debug!(target: "partstate::snapshot", period_ms = self.period.as_millis() as u64, "Snapshot director started");
    }

    fn on_actor_closing(&mut self, _control: &ActorControl<Self>) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Handle to a running [`SnapshotDirector`].
#[derive(Clone)]
pub struct SnapshotDirectorHandle {
    control: ActorControl<SnapshotDirector>,
}

impl SnapshotDirectorHandle {
    /// Snapshot at the current commit position now, outside the period.
    ///
    /// Resolves to the snapshot position, or `None` if the commit position
    /// has not moved since the last snapshot.
    pub fn snapshot_now(&self) -> ActorFuture<SnapshotResult<Option<Position>>> {
        let (future, reply) = ActorFuture::pending();
        match self
            .control
            .run(move |director, control| director.snapshot(control, Some(reply)))
        {
            Ok(()) => future,
            Err(e) => ActorFuture::failed(e),
        }
    }

    /// Position of the last snapshot the director knows of.
    pub fn last_snapshot_position(&self) -> ActorFuture<Option<Position>> {
        self.control.call(|director, _| director.last_snapshot)
    }

    /// Stop ticking and close the actor.
    pub fn close(&self) -> ActorFuture<()> {
        self.control.close()
    }
}
