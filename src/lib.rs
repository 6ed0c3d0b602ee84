//! Spindle is a user-space cooperative async runtime built around stackful
//! fibers and eagerly-evaluated promises.
//!
//! This library contains the following subsystems:
//!
//! - [Fibers: spawning, context queries, builders, yielding](fiber)
//! - [The async `Mutex` with a FIFO waiter queue](fiber::mutex)
//! - [Bounded channels between fibers](fiber::channel)
//! - [Promises: state machine, chaining, context-aware waiting](promise)
//! - [Collection combinators: `all`, `all_settled`, `race`, `any`, `timeout`](promise::combine)
//! - [Concurrency combinators: `concurrent`, `batch` and `*_settled` forms](promise::dispatch)
//! - [Cancellable timers](timer)
//! - [Cancellation tokens](cancel)
//! - [The event loop](runtime)
//! - [Monotonic clock utils](clock)
//! - [Error handling](error)
//!
//! Everything runs on one scheduler thread per [`Runtime`]: fibers are
//! stackful coroutines that suspend cooperatively, exactly one of them (or
//! the loop itself) makes progress at any moment, and the ordering
//! guarantees (FIFO ready queues, microtasks before resumptions, timers in
//! due order) follow from that.
//!
//! ```no_run
//! use std::time::Duration;
//! use spindle::{fiber, timer};
//!
//! let greeting = fiber::spawn(|| {
//!     timer::delay(Duration::from_millis(10)).wait()?;
//!     Ok("hello from a fiber")
//! });
//! assert_eq!(greeting.wait().unwrap(), "hello from a fiber");
//! ```
//!
//! Logging goes through the [`log`](https://docs.rs/log/) facade; install
//! any logger implementation to see fiber lifecycle and scheduling traces.

pub mod cancel;
pub mod clock;
pub mod error;
pub mod fiber;
pub mod promise;
pub mod runtime;
pub mod timer;

pub use cancel::{CancellationToken, CancellationTokenSource, Registration};
pub use error::{Error, Result};
pub use fiber::{in_fiber, sleep, spawn, wrap};
pub use promise::combine::{all, all_settled, any, race, timeout};
pub use promise::dispatch::{
    batch, batch_settled, batch_settled_with_limit, batch_with_limit, concurrent,
    concurrent_settled, DEFAULT_CONCURRENCY,
};
pub use promise::{Promise, Resolver, Settlement, TaskKey, TaskMap, Tasks};
pub use runtime::Runtime;
pub use timer::delay;

pub type StdResult<T, E> = std::result::Result<T, E>;
