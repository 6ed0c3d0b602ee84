//! Cooperative multitasking: fibers and their execution context.
//!
//! With the fiber module, you can:
//! - spawn fibers coupled to a [`Promise`] ([`spawn`], [`wrap`], [`Builder`]),
//! - query the execution context ([`in_fiber`], [`current`], [`expect_fiber`]),
//! - yield and sleep cooperatively ([`yield_now`], [`sleep`]),
//! - synchronize fibers with an async [`Mutex`](mutex::Mutex),
//! - pass values between fibers through a bounded [`channel`](channel()).
//!
//! A fiber is a stackful coroutine: it owns a real call stack and suspends by
//! parking that stack, not by returning. In this crate every fiber is backed
//! by an OS thread parked on a condition variable; the scheduler thread and
//! the fiber threads pass a single execution baton between each other, so
//! exactly one of them makes progress at any moment. Scheduling stays fully
//! cooperative and single-threaded in the model sense: plain (non-atomic)
//! state shared between fibers needs no synchronization between suspension
//! points.
//!
//! A fiber has four states: **fresh** (created, not yet started), **running**,
//! **suspended** and **terminated**. The event loop starts fresh fibers and
//! resumes suspended ones; a fiber terminates as soon as its body returns,
//! which is also the moment its promise settles.

use std::cell::RefCell;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as SyncMutex};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::runtime::{self, Runtime};

pub mod channel;
pub mod mutex;

pub use channel::{channel, Receiver, Sender, TryRecvError, TrySendError};
pub use mutex::{Guard, Mutex};

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// An opaque identifier of a fiber, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn next_for_test() -> Self {
        Self::next()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Baton
////////////////////////////////////////////////////////////////////////////////

/// The execution baton shared by the driver thread and one fiber thread.
///
/// Whoever holds the baton runs; the other side is parked on the condvar.
/// The handoff is strictly two-party, which is what makes the runtime
/// cooperative: there is never a moment when both sides run.
pub(crate) struct Baton {
    turn: SyncMutex<Turn>,
    cond: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Driver,
    Fiber,
    Done,
}

/// What the driver observes after handing the baton to a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// The fiber parked itself and can be resumed later.
    Suspended,
    /// The fiber body returned; the backing thread is finished.
    Finished,
}

impl Baton {
    fn new() -> Self {
        Self {
            turn: SyncMutex::new(Turn::Driver),
            cond: Condvar::new(),
        }
    }

    /// Driver side: give the fiber the baton and park until it comes back.
    fn hand_to_fiber(&self) -> StepOutcome {
        let mut turn = self.turn.lock().expect("baton lock poisoned");
        debug_assert_eq!(*turn, Turn::Driver);
        *turn = Turn::Fiber;
        self.cond.notify_all();
        while *turn == Turn::Fiber {
            turn = self.cond.wait(turn).expect("baton lock poisoned");
        }
        match *turn {
            Turn::Done => StepOutcome::Finished,
            _ => StepOutcome::Suspended,
        }
    }

    /// Fiber side: park until the driver hands over the baton.
    fn await_turn(&self) {
        let mut turn = self.turn.lock().expect("baton lock poisoned");
        while *turn != Turn::Fiber {
            turn = self.cond.wait(turn).expect("baton lock poisoned");
        }
    }

    /// Fiber side: give the baton back and park until resumed.
    fn yield_to_driver(&self) {
        let mut turn = self.turn.lock().expect("baton lock poisoned");
        *turn = Turn::Driver;
        self.cond.notify_all();
        while *turn != Turn::Fiber {
            turn = self.cond.wait(turn).expect("baton lock poisoned");
        }
    }

    /// Fiber side: terminal handoff, the fiber will never run again.
    fn finish(&self) {
        let mut turn = self.turn.lock().expect("baton lock poisoned");
        *turn = Turn::Done;
        self.cond.notify_all();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A fiber owned by the event loop.
///
/// Between [`Runtime::add_fiber`] and termination the loop is the sole owner;
/// while the fiber runs, its own stack frame is live and the loop is parked
/// waiting for the baton.
pub(crate) struct Fiber {
    id: FiberId,
    name: Arc<str>,
    baton: Arc<Baton>,
    thread: Option<thread::JoinHandle<()>>,
    body: Option<Box<dyn FnOnce() + Send>>,
    stack_size: Option<usize>,
}

impl Fiber {
    pub(crate) fn new(
        name: Arc<str>,
        stack_size: Option<usize>,
        body: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            id: FiberId::next(),
            name,
            baton: Arc::new(Baton::new()),
            thread: None,
            body: Some(body),
            stack_size,
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Spawns the backing thread and runs the fiber until its first
    /// suspension or termination.
    pub(crate) fn start(&mut self, rt: &Runtime) -> StepOutcome {
        let body = self.body.take().expect("fiber started twice");
        let baton = Arc::clone(&self.baton);
        let rt = rt.clone();
        let id = self.id;
        let name = Arc::clone(&self.name);

        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder
            .spawn(move || {
                baton.await_turn();
                runtime::set_current(&rt);
                CONTEXT.with(|ctx| {
                    *ctx.borrow_mut() = Some(FiberContext {
                        id,
                        name: Arc::clone(&name),
                        baton: Arc::clone(&baton),
                        runtime: rt.clone(),
                    });
                });
                log::trace!("fiber {} ({}) started", id, name);
                if panic::catch_unwind(panic::AssertUnwindSafe(body)).is_err() {
                    log::error!("fiber {} body panicked past its rejection guard", id);
                }
                log::trace!("fiber {} terminated", id);
                baton.finish();
            })
            .expect("failed to spawn a fiber thread");
        self.thread = Some(handle);
        self.baton.hand_to_fiber()
    }

    /// Resumes a suspended fiber until its next suspension or termination.
    pub(crate) fn step(&self) -> StepOutcome {
        self.baton.hand_to_fiber()
    }

    /// Reclaims the backing thread of a finished fiber.
    pub(crate) fn reap(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            // A started fiber dropped before termination: it was discarded by
            // `Runtime::reset` or by dropping the runtime. The backing thread
            // stays parked until process exit.
            log::warn!("fiber {} ({}) discarded while suspended", self.id, self.name);
            drop(handle);
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber context
////////////////////////////////////////////////////////////////////////////////

thread_local! {
    static CONTEXT: RefCell<Option<FiberContext>> = RefCell::new(None);
}

/// Everything a suspension point needs to know about the fiber it runs in.
///
/// Continuations must hold only the `(id, runtime)` pair, never the fiber
/// itself, otherwise a promise → continuation → fiber → promise cycle would
/// keep all three alive.
#[derive(Clone)]
pub(crate) struct FiberContext {
    pub(crate) id: FiberId,
    pub(crate) name: Arc<str>,
    pub(crate) baton: Arc<Baton>,
    pub(crate) runtime: Runtime,
}

impl FiberContext {
    /// Parks the current fiber until the loop resumes it.
    pub(crate) fn suspend(&self) {
        log::trace!("fiber {} suspended", self.id);
        self.baton.yield_to_driver();
        log::trace!("fiber {} resumed", self.id);
    }
}

pub(crate) fn context() -> Option<FiberContext> {
    CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Returns whether execution is currently inside a fiber.
pub fn in_fiber() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().is_some())
}

/// A lightweight reference to a running fiber.
#[derive(Debug, Clone)]
pub struct FiberHandle {
    id: FiberId,
    name: Arc<str>,
}

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Returns a handle to the currently running fiber, if any.
pub fn current() -> Option<FiberHandle> {
    CONTEXT.with(|ctx| {
        ctx.borrow().as_ref().map(|c| FiberHandle {
            id: c.id,
            name: Arc::clone(&c.name),
        })
    })
}

/// Like [`current`], but fails with [`Error::NotInFiber`] naming the
/// operation that was misused outside of a fiber.
pub fn expect_fiber(what: &str) -> Result<FiberHandle> {
    current().ok_or_else(|| Error::NotInFiber(what.into()))
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it.
///
/// The currently supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber
/// * `stack_size`: specifies the desired stack size for the fiber
///
/// The [`spawn`](#method.spawn) method will take ownership of the builder,
/// create the fiber and the [`Promise`] coupled to it, and enqueue the fiber
/// with the current thread's event loop.
///
/// The [`fiber::spawn`](spawn) and [`fiber::wrap`](wrap) free functions use a
/// `Builder` with default configuration.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be. The name shows up in log records and in the
    /// name of the backing thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Spawns a new fiber by taking ownership of the `Builder`, and returns
    /// the [`Promise`] coupled to it.
    ///
    /// The fiber body runs `f`; returning `Ok(v)` resolves the promise with
    /// `v`, returning `Err(e)` rejects it with `e`, and a panic rejects it
    /// with [`Error::Failure`] carrying the panic message. The promise may
    /// outlive the fiber, the fiber never outlives its body.
    pub fn spawn<F, T>(self, f: F) -> Promise<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Clone + Send + 'static,
    {
        let rt = Runtime::current();
        let (promise, resolver) = Promise::pending();
        let body = move || match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
            Ok(Ok(v)) => resolver.resolve(v),
            Ok(Err(e)) => resolver.reject(e),
            Err(payload) => resolver.reject(Error::Failure(panic_message(payload.as_ref()))),
        };
        let name: Arc<str> = match self.name {
            Some(name) => name.into(),
            None => default_name().into(),
        };
        rt.add_fiber(Fiber::new(name, self.stack_size, Box::new(body)));
        promise
    }
}

fn default_name() -> String {
    // Peek without burning an id: the name is cosmetic.
    format!("fiber-{}", NEXT_FIBER_ID.load(Ordering::Relaxed))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).into()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked".into()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Creates a new fiber running `f` and schedules it for execution, returning
/// the [`Promise`] of its result.
///
/// The fiber does not run in the caller's frame: it starts on the next event
/// loop iteration. Use [`Promise::wait`] to obtain the result.
///
/// This will create a fiber using default parameters of [`Builder`], if you
/// want to specify the name or the stack size, use that API instead.
pub fn spawn<F, T>(f: F) -> Promise<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Clone + Send + 'static,
{
    Builder::new().spawn(f)
}

/// Wraps `f` into a callable that, when invoked, spawns a fiber running `f`
/// and returns the [`Promise`] of its result.
///
/// This is the deferred counterpart of [`spawn`]: nothing happens until the
/// returned closure is called.
pub fn wrap<F, T>(f: F) -> impl FnOnce() -> Promise<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Clone + Send + 'static,
{
    move || spawn(f)
}

/// Reschedules the current fiber to the end of the ready queue and yields
/// control to the event loop.
///
/// Returns `Err(`[`Error::NotInFiber`]`)` when called outside of a fiber.
pub fn yield_now() -> Result<()> {
    let ctx = context().ok_or_else(|| Error::NotInFiber("yield_now".into()))?;
    ctx.runtime.schedule_fiber(ctx.id);
    ctx.suspend();
    Ok(())
}

/// Puts the current fiber to sleep for at least `timeout`.
///
/// Inside a fiber this suspends the fiber; outside it drives the event loop
/// until the backing timer fires. Either way other work keeps making
/// progress while this call waits.
pub fn sleep(timeout: Duration) {
    let _ = crate::timer::delay(timeout).wait();
}
