//! Injectable time source.
//!
//! Segment timing is the engine's entire product, so time comes from a trait
//! instead of bare `Instant::now()` calls: production uses [`SystemClock`],
//! tests drive a [`ManualClock`] and assert exact durations with no sleeps
//! and no jitter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time for segment starts, ends, and context ages.
pub trait Clock: Send + Sync + 'static {
    /// The current instant. Must never move backwards.
    fn now(&self) -> Instant;
}

/// Default clock; reads the real monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests.
///
/// Starts at a fixed base instant and only moves when
/// [`advance`](ManualClock::advance) is called. Clones share the same
/// underlying offset, so the copy given to an engine and the copy kept by
/// the test tick together.
#[derive(Clone, Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}
