//! Actors and actor handles
//!
//! An actor owns its state exclusively; the only way to touch it is to queue
//! a job through its [`ActorControl`]. Jobs of one actor run one after the
//! other, in submission order, on whichever worker picked the actor up.
//!
//! # Lifecycle
//!
//! ```text
//! submit_actor ──► RUNNING ──close()──► CLOSING ──close job──► CLOSED
//!                     │                                          ▲
//!                     └──────────── job panicked ────────────────┘
//! ```
//!
//! Jobs queued before `close()` still run; the close job is queued behind
//! them. Submissions after `close()` fail with [`ActorError::Closed`].

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::ActorError;
use crate::future::{ActorFuture, FutureCompleter};
use crate::scheduler::{panic_message, SchedulerShared, Task};

/// A unit of state driven by the scheduler.
pub trait Actor: Send + Sized + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// First job of every actor.
    fn on_actor_started(&mut self, _control: &ActorControl<Self>) {}

    /// Last job of every actor; the state is dropped right after.
    fn on_actor_closing(&mut self, _control: &ActorControl<Self>) {}
}

type Job<A> = Box<dyn FnOnce(&mut A, &ActorControl<A>) + Send>;

enum Envelope<A: Actor> {
    Job(Job<A>),
    Close,
}

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

pub(crate) struct ActorCell<A: Actor> {
    name: String,
    state: Mutex<Option<A>>,
    jobs: Mutex<VecDeque<Envelope<A>>>,
    close_waiters: Mutex<Vec<FutureCompleter<()>>>,
    scheduled: AtomicBool,
    lifecycle: AtomicU8,
    scheduler: Weak<SchedulerShared>,
}

impl<A: Actor> ActorCell<A> {
    fn wake(self: &Arc<Self>, scheduler: &SchedulerShared) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let task: Arc<dyn Task> = self.clone();
            if scheduler.schedule(task).is_err() {
                self.clone().abort();
            }
        }
    }

    fn finish_close(&self, result: Result<(), ActorError>) {
        let waiters: Vec<FutureCompleter<()>> = {
            let mut waiters = self.close_waiters.lock();
            self.lifecycle.store(CLOSED, Ordering::SeqCst);
            waiters.drain(..).collect()
        };
        let discarded: Vec<Envelope<A>> = self.jobs.lock().drain(..).collect();
        if !discarded.is_empty() {
            debug!(target: "partstate::scheduler", actor = %self.name, discarded = discarded.len(), "Discarding jobs of closed actor");
        }
        drop(discarded);
        for waiter in waiters {
            waiter.finish(result.clone());
        }
    }
}

impl<A: Actor> Task for ActorCell<A> {
    fn run(self: Arc<Self>, budget: usize) {
        let control = ActorControl { cell: self.clone() };
        {
            let mut state = self.state.lock();
            for _ in 0..budget {
                let envelope = self.jobs.lock().pop_front();
                let Some(envelope) = envelope else { break };
                let Some(actor) = state.as_mut() else {
                    // Closed: anything still queued is dropped unrun.
                    continue;
                };
                match envelope {
                    Envelope::Job(job) => {
                        let outcome = catch_unwind(AssertUnwindSafe(|| job(actor, &control)));
                        if let Err(panic) = outcome {
                            let message = panic_message(panic.as_ref());
                            error!(target: "partstate::scheduler", actor = %self.name, %message, "Actor job panicked, closing actor");
                            *state = None;
                            self.finish_close(Err(ActorError::Failed {
                                actor: self.name.clone(),
                                message,
                            }));
                            break;
                        }
                    }
                    Envelope::Close => {
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| actor.on_actor_closing(&control)));
                        if outcome.is_err() {
                            warn!(target: "partstate::scheduler", actor = %self.name, "on_actor_closing panicked");
                        }
                        *state = None;
                        self.finish_close(Ok(()));
                        debug!(target: "partstate::scheduler", actor = %self.name, "Actor closed");
                        break;
                    }
                }
            }
        }

        self.scheduled.store(false, Ordering::SeqCst);
        if !self.jobs.lock().is_empty() {
            if let Some(scheduler) = self.scheduler.upgrade() {
                self.wake(&scheduler);
            } else {
                self.clone().abort();
            }
        }
    }

    fn abort(self: Arc<Self>) {
        // Busy means the caller is this actor's own job; its hook cannot run here.
        if let Some(mut state) = self.state.try_lock() {
            if let Some(mut actor) = state.take() {
                let control = ActorControl { cell: self.clone() };
                let outcome = catch_unwind(AssertUnwindSafe(|| actor.on_actor_closing(&control)));
                if outcome.is_err() {
                    warn!(target: "partstate::scheduler", actor = %self.name, "on_actor_closing panicked");
                }
                debug!(target: "partstate::scheduler", actor = %self.name, "Actor aborted by scheduler stop");
            }
        }
        let waiters: Vec<FutureCompleter<()>> = {
            let mut waiters = self.close_waiters.lock();
            self.lifecycle.store(CLOSED, Ordering::SeqCst);
            waiters.drain(..).collect()
        };
        let discarded: Vec<Envelope<A>> = self.jobs.lock().drain(..).collect();
        drop(discarded);
        for waiter in waiters {
            waiter.fail(ActorError::SchedulerStopped);
        }
    }
}

/// Cancellation handle for a timer.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        Self::default()
    }

    /// Cancel the timer; a job already running is not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to a running actor.
pub struct ActorControl<A: Actor> {
    cell: Arc<ActorCell<A>>,
}

impl<A: Actor> Clone for ActorControl<A> {
    fn clone(&self) -> Self {
        ActorControl {
            cell: self.cell.clone(),
        }
    }
}

impl<A: Actor> ActorControl<A> {
    pub(crate) fn spawn(actor: A, scheduler: &Arc<SchedulerShared>) -> Result<Self, ActorError> {
        if !scheduler.is_running() {
            return Err(ActorError::SchedulerStopped);
        }
        let name = actor.name();
        let cell = Arc::new(ActorCell {
            name: name.clone(),
            state: Mutex::new(Some(actor)),
            jobs: Mutex::new(VecDeque::new()),
            close_waiters: Mutex::new(Vec::new()),
            scheduled: AtomicBool::new(false),
            lifecycle: AtomicU8::new(RUNNING),
                scheduler: Arc::downgrade(scheduler),
        });
        let task: Arc<dyn Task> = cell.clone();
        scheduler.register(&task);
        let control = ActorControl { cell };
        control.push(Envelope::Job(Box::new(|actor: &mut A, control: &ActorControl<A>| {
            actor.on_actor_started(control)
        })))?;
        debug!(target: "partstate::scheduler", actor = %name, "Actor submitted");
        Ok(control)
    }

    /// Actor name.
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// True once `close()` was requested or the actor failed.
    pub fn is_closed(&self) -> bool {
        self.cell.lifecycle.load(Ordering::SeqCst) != RUNNING
    }

    fn running_scheduler(&self) -> Result<Arc<SchedulerShared>, ActorError> {
        match self.cell.scheduler.upgrade() {
            Some(scheduler) if scheduler.is_running() => Ok(scheduler),
            _ => Err(ActorError::SchedulerStopped),
        }
    }

    fn push(&self, envelope: Envelope<A>) -> Result<(), ActorError> {
        let scheduler = self.running_scheduler()?;
        self.cell.jobs.lock().push_back(envelope);
        self.cell.wake(&scheduler);
        Ok(())
    }

    // Scheduler first: `stop` also closes every actor.
    fn submit(&self, job: Job<A>) -> Result<(), ActorError> {
        let scheduler = self.running_scheduler()?;
        if self.is_closed() {
            return Err(ActorError::Closed(self.cell.name.clone()));
        }
        self.cell.jobs.lock().push_back(Envelope::Job(job));
        self.cell.wake(&scheduler);
        Ok(())
    }

    /// Queue a job.
    pub fn run<F>(&self, job: F) -> Result<(), ActorError>
    where
        F: FnOnce(&mut A, &ActorControl<A>) + Send + 'static,
    {
        self.submit(Box::new(job))
    }

    /// Queue a job and get its return value as a future.
    pub fn call<F, R>(&self, job: F) -> ActorFuture<R>
    where
        F: FnOnce(&mut A, &ActorControl<A>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (future, completer) = ActorFuture::pending();
        match self.submit(Box::new(move |actor: &mut A, control: &ActorControl<A>| {
            completer.complete(job(actor, control))
        })) {
            Ok(()) => future,
            Err(error) => ActorFuture::failed(error),
        }
    }

    /// Run `task` on the scheduler's blocking pool.
    pub fn run_blocking<F, R>(&self, task: F) -> ActorFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.cell.scheduler.upgrade() {
            Some(scheduler) => scheduler.submit_blocking(task),
            None => ActorFuture::failed(ActorError::SchedulerStopped),
        }
    }

    /// When `future` completes, continue with `job` inside this actor.
    pub fn run_on_completion<T, F>(&self, future: ActorFuture<T>, job: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut A, &ActorControl<A>, Result<T, ActorError>) + Send + 'static,
    {
        let control = self.clone();
        future.on_complete(move |result| {
            if let Err(e) = control.run(move |actor, control| job(actor, control, result)) {
                warn!(target: "partstate::scheduler", actor = %control.name(), error = %e, "Dropping completion continuation");
            }
        });
    }

    /// Queue `job` once `delay` has elapsed on the scheduler clock.
    pub fn run_delayed<F>(&self, delay: Duration, job: F) -> TimerHandle
    where
        F: FnOnce(&mut A, &ActorControl<A>) + Send + 'static,
    {
        let handle = TimerHandle::new();
        self.schedule_timer(delay, Box::new(job), handle.clone());
        handle
    }

    /// Queue `job` every `period` until the handle is cancelled or the actor closes.
    pub fn run_at_fixed_rate<F>(&self, period: Duration, job: F) -> TimerHandle
    where
        F: FnMut(&mut A, &ActorControl<A>) + Send + 'static,
    {
        let handle = TimerHandle::new();
        schedule_repeating(self, period, job, handle.clone());
        handle
    }

    fn schedule_timer(&self, delay: Duration, job: Job<A>, handle: TimerHandle) {
        let Some(scheduler) = self.cell.scheduler.upgrade() else {
            return;
        };
        let deadline = scheduler
            .clock()
            .now_millis()
            .saturating_add(delay.as_millis() as u64);
        let control = self.clone();
        scheduler.add_timer(
            deadline,
            Box::new(move || {
                if handle.is_cancelled() || control.is_closed() {
                    return;
                }
                let _ = control.run(move |actor, control| {
                    if !handle.is_cancelled() {
                        job(actor, control);
                    }
                });
            }),
        );
    }

    /// Request the actor to close after its already queued jobs.
    pub fn close(&self) -> ActorFuture<()> {
        let (future, completer) = ActorFuture::pending();
        let first_request = {
            let mut waiters = self.cell.close_waiters.lock();
            match self.cell.lifecycle.load(Ordering::SeqCst) {
                CLOSED => {
                    drop(waiters);
                    completer.complete(());
                    return future;
                }
                RUNNING => {
                    self.cell.lifecycle.store(CLOSING, Ordering::SeqCst);
                    waiters.push(completer);
                    true
                }
                _ => {
                    waiters.push(completer);
                    false
                }
            }
        };
        if first_request {
            debug!(target: "partstate::scheduler", actor = %self.cell.name, "Closing actor");
            if self.push(Envelope::Close).is_err() {
                self.cell.clone().abort();
            }
        }
        future
    }
}

fn schedule_repeating<A, F>(control: &ActorControl<A>, period: Duration, mut job: F, handle: TimerHandle)
where
    A: Actor,
    F: FnMut(&mut A, &ActorControl<A>) + Send + 'static,
{
    let next = handle.clone();
    control.schedule_timer(
        period,
        Box::new(move |actor: &mut A, control: &ActorControl<A>| {
            job(actor, control);
            if !next.is_cancelled() {
                schedule_repeating(control, period, job, next);
            }
        }),
        handle,
    );
}
