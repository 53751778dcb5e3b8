//! Cooperative actor scheduler
//!
//! Every stateful component of a partition runs as an actor: a piece of state
//! plus a queue of short jobs that mutate it. A bounded pool of worker threads
//! pulls runnable actors and executes a few jobs at a time before moving on,
//! so no actor can monopolise a worker and no actor ever runs on two workers
//! at once.
//!
//! - [`ActorScheduler`]: worker pool, timer queue and blocking-task pool
//! - [`Actor`] / [`ActorControl`]: the actor contract and its handle
//! - [`ActorFuture`]: completion handle for jobs and blocking tasks
//! - [`BlockingExecutor`]: blocking-pool access for code outside actors
//! - [`ActorClock`]: time source; [`ControlledActorClock`] makes timers
//!   deterministic in tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod clock;
pub mod error;
pub mod future;
pub mod scheduler;

pub use actor::{Actor, ActorControl, TimerHandle};
pub use clock::{ActorClock, ControlledActorClock, SystemActorClock};
pub use error::ActorError;
pub use future::{ActorFuture, FutureCompleter};
pub use scheduler::{ActorScheduler, ActorSchedulerBuilder, BlockingExecutor};
