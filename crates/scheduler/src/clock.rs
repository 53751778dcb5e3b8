//! Actor clocks
//!
//! Timers registered through [`ActorControl`](crate::ActorControl) are
//! evaluated against the scheduler's clock, never against `Instant::now()`
//! directly. Production uses [`SystemActorClock`]; tests use
//! [`ControlledActorClock`] and move time explicitly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Time source for the scheduler.
pub trait ActorClock: Send + Sync + 'static {
    /// Current time in milliseconds since the UNIX epoch.
    fn now_millis(&self) -> u64;
}

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemActorClock;

impl ActorClock for SystemActorClock {
    fn now_millis(&self) -> u64 {
        system_millis()
    }
}

/// Clock whose time can be pinned and moved by tests.
///
/// Unpinned, it follows the system clock plus an offset accumulated by
/// [`add_time`](Self::add_time). Pinned, it stays at the pinned instant
/// (plus offset) until moved again.
#[derive(Debug, Default)]
pub struct ControlledActorClock {
    pinned: Mutex<Option<u64>>,
    offset_millis: AtomicI64,
}

impl ControlledActorClock {
    /// Create an unpinned clock with no offset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze time at the current system time.
    pub fn pin_current_time(&self) {
        *self.pinned.lock() = Some(system_millis());
        self.offset_millis.store(0, Ordering::SeqCst);
    }

    /// Freeze time at the given epoch milliseconds.
    pub fn set_time(&self, millis: u64) {
        *self.pinned.lock() = Some(millis);
        self.offset_millis.store(0, Ordering::SeqCst);
    }

    /// Move time forward.
    pub fn add_time(&self, duration: Duration) {
        self.offset_millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    /// Unpin and drop any offset.
    pub fn reset(&self) {
        *self.pinned.lock() = None;
        self.offset_millis.store(0, Ordering::SeqCst);
    }
}

impl ActorClock for ControlledActorClock {
    fn now_millis(&self) -> u64 {
        let base = self.pinned.lock().unwrap_or_else(system_millis);
        let offset = self.offset_millis.load(Ordering::SeqCst);
        (base as i64).saturating_add(offset).max(0) as u64
    }
}
