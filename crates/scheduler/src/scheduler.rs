//! Actor scheduler
//!
//! A fixed pool of worker threads shares one run queue of actors. A worker
//! pops an actor, runs at most [`JOB_BUDGET`] of its queued jobs and, if the
//! actor still has work, puts it back at the end of the queue. Idle workers
//! also fire due timers, so timer resolution is bounded by [`IDLE_WAIT`].
//!
//! Blocking work (file copies, database open, fsync-heavy snapshot writes)
//! goes to a separate blocking pool via
//! [`ActorControl::run_blocking`](crate::ActorControl::run_blocking) so it
//! never stalls the actor workers.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::actor::{Actor, ActorControl};
use crate::clock::{ActorClock, SystemActorClock};
use crate::error::ActorError;
use crate::future::ActorFuture;

/// Maximum jobs an actor runs before yielding its worker.
pub const JOB_BUDGET: usize = 32;

/// Longest a worker sleeps before re-checking timers.
pub const IDLE_WAIT: Duration = Duration::from_millis(2);

/// Unit of schedulable work (an actor cell).
pub(crate) trait Task: Send + Sync {
    /// Run up to `budget` jobs.
    fn run(self: Arc<Self>, budget: usize);

    /// Run the closing hook if the task is idle and discard all pending
    /// work, because the scheduler is going away.
    fn abort(self: Arc<Self>);
}

type TimerFn = Box<dyn FnOnce() + Send>;
type BlockingFn = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: u64,
    seq: u64,
    fire: TimerFn,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// State shared between the scheduler handle, workers and actor cells.
pub(crate) struct SchedulerShared {
    name: String,
    running: AtomicBool,
    clock: Arc<dyn ActorClock>,

    run_queue: Mutex<VecDeque<Arc<dyn Task>>>,
    work_available: Condvar,

    /// Every submitted actor, so `stop` reaches idle ones too.
    tasks: Mutex<Vec<Weak<dyn Task>>>,

    timers: Mutex<BinaryHeap<TimerEntry>>,
    timer_seq: AtomicU64,

    blocking_queue: Mutex<VecDeque<BlockingFn>>,
    blocking_available: Condvar,
}

impl SchedulerShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn clock(&self) -> &dyn ActorClock {
        self.clock.as_ref()
    }

    pub(crate) fn schedule(&self, task: Arc<dyn Task>) -> Result<(), ActorError> {
        if !self.is_running() {
            return Err(ActorError::SchedulerStopped);
        }
        self.run_queue.lock().push_back(task);
        self.work_available.notify_one();
        Ok(())
    }

    pub(crate) fn register(&self, task: &Arc<dyn Task>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Arc::downgrade(task));
    }

    pub(crate) fn add_timer(&self, deadline: u64, fire: TimerFn) {
        if !self.is_running() {
            return;
        }
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().push(TimerEntry {
            deadline,
            seq,
            fire,
        });
    }

    pub(crate) fn submit_blocking<F, R>(&self, task: F) -> ActorFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_running() {
            return ActorFuture::failed(ActorError::SchedulerStopped);
        }
        let (future, completer) = ActorFuture::pending();
        let job: BlockingFn = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => completer.complete(value),
                Err(panic) => completer.fail(ActorError::Failed {
                    actor: "blocking-task".to_string(),
                    message: panic_message(panic.as_ref()),
                }),
            }
        });
        self.blocking_queue.lock().push_back(job);
        self.blocking_available.notify_one();
        future
    }

    fn fire_due_timers(&self) {
        let now = self.clock.now_millis();
        let due: Vec<TimerEntry> = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            while timers.peek().map_or(false, |t| t.deadline <= now) {
                if let Some(entry) = timers.pop() {
                    due.push(entry);
                }
            }
            due
        };
        for entry in due {
            (entry.fire)();
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_loop(shared: Arc<SchedulerShared>, index: usize) {
    debug!(target: "partstate::scheduler", scheduler = %shared.name, worker = index, "Worker started");
    while shared.is_running() {
        shared.fire_due_timers();
        let task = {
            let mut queue = shared.run_queue.lock();
            if queue.is_empty() {
                shared.work_available.wait_for(&mut queue, IDLE_WAIT);
            }
            queue.pop_front()
        };
        if let Some(task) = task {
            task.run(JOB_BUDGET);
        }
    }
    debug!(target: "partstate::scheduler", scheduler = %shared.name, worker = index, "Worker exiting");
}

fn blocking_loop(shared: Arc<SchedulerShared>) {
    loop {
        let job = {
            let mut queue = shared.blocking_queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if !shared.is_running() {
                    break None;
                }
                shared.blocking_available.wait_for(&mut queue, IDLE_WAIT * 50);
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

/// Builder for [`ActorScheduler`].
pub struct ActorSchedulerBuilder {
    name: String,
    thread_count: usize,
    blocking_thread_count: usize,
    clock: Arc<dyn ActorClock>,
}

impl Default for ActorSchedulerBuilder {
    fn default() -> Self {
        ActorSchedulerBuilder {
            name: "partstate".to_string(),
            thread_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(8),
            blocking_thread_count: 2,
            clock: Arc::new(SystemActorClock),
        }
    }
}

impl ActorSchedulerBuilder {
    /// Name used for worker threads and log fields
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of actor worker threads (at least 1)
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = count.max(1);
        self
    }

    /// Number of blocking-pool threads (at least 1)
    pub fn blocking_thread_count(mut self, count: usize) -> Self {
        self.blocking_thread_count = count.max(1);
        self
    }

    /// Clock used for timers
    pub fn clock(mut self, clock: Arc<dyn ActorClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the worker threads and return the running scheduler.
    pub fn build(self) -> std::io::Result<ActorScheduler> {
        let shared = Arc::new(SchedulerShared {
            name: self.name.clone(),
            running: AtomicBool::new(true),
            clock: self.clock,
            run_queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            tasks: Mutex::new(Vec::new()),
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            blocking_queue: Mutex::new(VecDeque::new()),
            blocking_available: Condvar::new(),
        });

        let scheduler = ActorScheduler {
            shared: shared.clone(),
            threads: Mutex::new(Vec::new()),
        };

        for index in 0..self.thread_count {
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-actor-{}", self.name, index))
                .spawn(move || worker_loop(worker_shared, index))?;
            scheduler.threads.lock().push(handle);
        }
        for index in 0..self.blocking_thread_count {
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-blocking-{}", self.name, index))
                .spawn(move || blocking_loop(worker_shared))?;
            scheduler.threads.lock().push(handle);
        }

        info!(
            target: "partstate::scheduler",
            scheduler = %self.name,
            threads = self.thread_count,
            blocking_threads = self.blocking_thread_count,
            "Actor scheduler started"
        );
        Ok(scheduler)
    }
}

/// Cooperative actor scheduler.
///
/// Stopping (explicitly or on drop) joins all threads and resolves every
/// outstanding [`ActorFuture`] of queued work with an error.
pub struct ActorScheduler {
    shared: Arc<SchedulerShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ActorScheduler {
    /// Start configuring a scheduler.
    pub fn builder() -> ActorSchedulerBuilder {
        ActorSchedulerBuilder::default()
    }

    /// Submit an actor; its `on_actor_started` hook is its first job.
    pub fn submit_actor<A: Actor>(&self, actor: A) -> Result<ActorControl<A>, ActorError> {
        ActorControl::spawn(actor, &self.shared)
    }

    /// Run `task` on the blocking pool.
    pub fn submit_blocking<F, R>(&self, task: F) -> ActorFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.submit_blocking(task)
    }

    /// Handle to the blocking pool that does not keep the scheduler alive.
    pub fn blocking_executor(&self) -> BlockingExecutor {
        BlockingExecutor {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current time of the scheduler clock in epoch milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.shared.clock.now_millis()
    }

    /// True until [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop all workers. Must not be called from an actor job.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.work_available.notify_all();
        self.shared.blocking_available.notify_all();

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!(target: "partstate::scheduler", scheduler = %self.shared.name, "Worker thread panicked");
            }
        }

        self.shared.run_queue.lock().clear();
        let tasks: Vec<Arc<dyn Task>> = self
            .shared
            .tasks
            .lock()
            .drain(..)
            .filter_map(|t| t.upgrade())
            .collect();
        for task in tasks {
            task.abort();
        }
        self.shared.blocking_queue.lock().clear();
        self.shared.timers.lock().clear();

        info!(target: "partstate::scheduler", scheduler = %self.shared.name, "Actor scheduler stopped");
    }
}

/// Submits work to a scheduler's blocking pool.
///
/// Fails with [`ActorError::SchedulerStopped`] once the scheduler stopped or
/// was dropped.
#[derive(Clone)]
pub struct BlockingExecutor {
    shared: Weak<SchedulerShared>,
}

impl BlockingExecutor {
    /// Run `task` on the blocking pool.
    pub fn submit<F, R>(&self, task: F) -> ActorFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.shared.upgrade() {
            Some(shared) => shared.submit_blocking(task),
            None => ActorFuture::failed(ActorError::SchedulerStopped),
        }
    }
}

impl std::fmt::Debug for BlockingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingExecutor")
            .field("running", &self.shared.upgrade().map_or(false, |s| s.is_running()))
            .finish()
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
