//! Actor futures
//!
//! An [`ActorFuture`] is a one-shot completion handle. It has exactly one
//! consumer: either a thread blocking in [`join`](ActorFuture::join) or a
//! callback registered with [`on_complete`](ActorFuture::on_complete), which
//! runs on whichever thread completes the future.
//!
//! The producing side holds a [`FutureCompleter`]. Dropping a completer
//! without completing it resolves the future with [`ActorError::Abandoned`],
//! so a job discarded by a closing actor never leaves a waiter hanging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ActorError;

type Callback<T> = Box<dyn FnOnce(Result<T, ActorError>) + Send>;

enum Slot<T> {
    Pending(Option<Callback<T>>),
    Ready(Result<T, ActorError>),
    Consumed,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Completion handle for a value produced by an actor job or blocking task.
#[must_use = "an ActorFuture does nothing unless joined or given a callback"]
pub struct ActorFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Producer side of an [`ActorFuture`].
pub struct FutureCompleter<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Send + 'static> ActorFuture<T> {
    /// Create a pending future and its completer.
    pub fn pending() -> (ActorFuture<T>, FutureCompleter<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending(None)),
            ready: Condvar::new(),
        });
        (
            ActorFuture {
                shared: shared.clone(),
            },
            FutureCompleter {
                shared: Some(shared),
            },
        )
    }

    /// Create an already completed future.
    pub fn completed(value: T) -> ActorFuture<T> {
        Self::ready(Ok(value))
    }

    /// Create an already failed future.
    pub fn failed(error: ActorError) -> ActorFuture<T> {
        Self::ready(Err(error))
    }

    fn ready(result: Result<T, ActorError>) -> ActorFuture<T> {
        ActorFuture {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Ready(result)),
                ready: Condvar::new(),
            }),
        }
    }

    /// True once a value or error is available (or was consumed).
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.slot.lock(), Slot::Pending(_))
    }

    /// Block until the future completes.
    ///
    /// Never call this from a job of the actor that completes the future:
    /// the job would wait for itself.
    pub fn join(self) -> Result<T, ActorError> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Slot::Ready(_) = &*slot {
                return take_ready(&mut slot);
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Block until the future completes or `timeout` elapses.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, ActorError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Slot::Ready(_) = &*slot {
                return take_ready(&mut slot);
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                if let Slot::Ready(_) = &*slot {
                    return take_ready(&mut slot);
                }
                return Err(ActorError::Timeout);
            }
        }
    }

    /// Run `callback` with the result once available.
    ///
    /// If the future is already complete the callback runs immediately on
    /// the calling thread.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Result<T, ActorError>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        match &mut *slot {
            Slot::Pending(existing) => {
                *existing = Some(Box::new(callback));
            }
            Slot::Ready(_) => {
                let result = take_ready(&mut slot);
                drop(slot);
                callback(result);
            }
            Slot::Consumed => {}
        }
    }
}

fn take_ready<T>(slot: &mut Slot<T>) -> Result<T, ActorError> {
    match std::mem::replace(slot, Slot::Consumed) {
        Slot::Ready(result) => result,
        _ => Err(ActorError::Abandoned),
    }
}

impl<T> FutureCompleter<T> {
    /// Complete with a value.
    pub fn complete(self, value: T) {
        self.finish(Ok(value));
    }

    /// Complete with an error.
    pub fn fail(self, error: ActorError) {
        self.finish(Err(error));
    }

    /// Complete with a result.
    pub fn finish(mut self, result: Result<T, ActorError>) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, result);
        }
    }
}

impl<T> Drop for FutureCompleter<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, Err(ActorError::Abandoned));
        }
    }
}

fn resolve<T>(shared: &Shared<T>, result: Result<T, ActorError>) {
    let mut slot = shared.slot.lock();
    match &mut *slot {
        Slot::Pending(callback) => {
            if let Some(callback) = callback.take() {
                *slot = Slot::Consumed;
                drop(slot);
                callback(result);
            } else {
                *slot = Slot::Ready(result);
                shared.ready.notify_all();
            }
        }
        // Already resolved; first completion wins.
        Slot::Ready(_) | Slot::Consumed => {}
    }
}
