//! The `clock` module returns time values derived from the monotonic system
//! clock, with one twist: on a thread that is driving an event loop
//! iteration the module reports the *iteration begin time* instead of the
//! real time.
//!
//! Timers and timeouts computed from the cached value stay consistent with
//! the loop's own notion of "now", no matter how long the current batch of
//! fibers, microtasks and timer callbacks takes to drain.
//!
//! - [now()](fn.now.html) - Loop iteration begin time, or the real monotonic
//!   time when no loop is running on this thread
//! - [accurate()](fn.accurate.html) - The real monotonic time, always
//! - [INFINITY](constant.INFINITY.html) - A timeout that never expires

use std::cell::Cell;
use std::time::{Duration, Instant};

pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

thread_local! {
    static LOOP_NOW: Cell<Option<Instant>> = Cell::new(None);
}

/// The monotonic time as the event loop sees it.
///
/// Inside a running loop this is the begin time of the current iteration
/// (cheap, and stable across the whole tick). Outside of any loop it falls
/// back to [`accurate`].
///
/// Use this function when computing deadlines for yielding operations.
#[inline]
pub fn now() -> Instant {
    LOOP_NOW.with(|c| c.get()).unwrap_or_else(accurate)
}

/// The real monotonic time.
///
/// Use this function when duration accuracy is required, for example when
/// timing the execution of different parts of your program.
#[inline(always)]
pub fn accurate() -> Instant {
    Instant::now()
}

/// Marks the begin of a loop iteration on this thread. Returns the previous
/// mark so nested drivers can restore it.
pub(crate) fn enter_tick(start: Instant) -> Option<Instant> {
    LOOP_NOW.with(|c| c.replace(Some(start)))
}

/// Restores the mark saved by [`enter_tick`].
pub(crate) fn leave_tick(prev: Option<Instant>) {
    LOOP_NOW.with(|c| c.set(prev));
}
