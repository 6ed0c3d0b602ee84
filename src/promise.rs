//! Eagerly-evaluated promise objects.
//!
//! A [`Promise`] is a shared handle to a future value: a mutable state
//! machine that is in exactly one of four states (pending, fulfilled,
//! rejected or cancelled) and never leaves a terminal state once it enters
//! one. Unlike a `std::future::Future`, a promise starts settling the moment
//! its producer runs; consumers only observe.
//!
//! Consumers either register continuations ([`then`], [`catch`],
//! [`and_then`], [`finally`], [`on_cancel`]) or wait for the settlement with
//! [`wait`], which is context-aware: inside a fiber it suspends the fiber,
//! outside it drives the event loop until the promise settles.
//!
//! Continuations of a single promise fire in registration order, each at
//! most once. Callbacks registered before settlement run when settlement
//! occurs; `then`/`catch` callbacks registered *after* settlement are
//! dispatched as microtasks, so a continuation chain never re-enters the
//! caller's frame.
//!
//! [`then`]: Promise::then
//! [`catch`]: Promise::catch
//! [`and_then`]: Promise::and_then
//! [`finally`]: Promise::finally
//! [`on_cancel`]: Promise::on_cancel
//! [`wait`]: Promise::wait

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::fiber;
use crate::runtime::Runtime;

pub mod combine;
pub mod dispatch;
pub mod task;

pub use task::{Settlement, TaskKey, TaskMap, Tasks};

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// The observable state of a promise. Only `Pending` is transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
    Cancelled,
}

enum Phase<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
    Cancelled,
}

/// A settled outcome as delivered to reactions.
pub(crate) enum Outcome<T> {
    Fulfilled(T),
    Rejected(Error),
    Cancelled,
}

impl<T: Clone> Outcome<T> {
    pub(crate) fn to_result(&self) -> Result<T> {
        match self {
            Outcome::Fulfilled(v) => Ok(v.clone()),
            Outcome::Rejected(e) => Err(e.clone()),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

pub(crate) type Reaction<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct Core<T> {
    phase: Phase<T>,
    reactions: Vec<Reaction<T>>,
    /// Producer-supplied teardown, fired when and only when the promise is
    /// cancelled (e.g. a timer promise removes its loop timer here).
    cancel_hook: Option<Box<dyn FnOnce() + Send>>,
}

struct Inner<T> {
    core: SyncMutex<Core<T>>,
}

////////////////////////////////////////////////////////////////////////////////
// Promise
////////////////////////////////////////////////////////////////////////////////

/// A shared handle to an eventually-settled value. See the module docs.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The producer half of a promise: settles it exactly once.
///
/// Extra settle calls are no-ops: the first terminal state wins.
pub struct Resolver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Promise<T> {
    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        self.inner.core.lock().expect("promise core lock poisoned")
    }

    pub fn state(&self) -> State {
        match self.lock().phase {
            Phase::Pending => State::Pending,
            Phase::Fulfilled(_) => State::Fulfilled,
            Phase::Rejected(_) => State::Rejected,
            Phase::Cancelled => State::Cancelled,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    #[inline]
    pub fn is_fulfilled(&self) -> bool {
        self.state() == State::Fulfilled
    }

    #[inline]
    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }

    /// Identity of the shared state, used to match promise handles.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// Constructs a pending promise along with its [`Resolver`].
    pub fn pending() -> (Self, Resolver<T>) {
        let inner = Arc::new(Inner {
            core: SyncMutex::new(Core {
                phase: Phase::Pending,
                reactions: Vec::new(),
                cancel_hook: None,
            }),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            Resolver { inner },
        )
    }

    /// Constructs a promise and synchronously runs `executor` with its
    /// resolver. An `Err` return rejects the promise.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<()>,
    {
        let (promise, resolver) = Self::pending();
        let guard = resolver.clone();
        if let Err(e) = executor(resolver) {
            guard.reject(e);
        }
        promise
    }

    /// An already-fulfilled promise.
    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    /// An already-rejected promise.
    pub fn rejected(reason: impl Into<Error>) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.reject(reason);
        promise
    }

    /// The fulfillment value, if fulfilled.
    pub fn value(&self) -> Option<T> {
        match &self.lock().phase {
            Phase::Fulfilled(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if rejected.
    pub fn reason(&self) -> Option<Error> {
        match &self.lock().phase {
            Phase::Rejected(e) => Some(e.clone()),
            _ => None,
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Settling
    ////////////////////////////////////////////////////////////////////////

    pub(crate) fn settle(&self, outcome: Outcome<T>) {
        let (reactions, hook) = {
            let mut core = self.lock();
            if !matches!(core.phase, Phase::Pending) {
                // First terminal state wins.
                return;
            }
            core.phase = match &outcome {
                Outcome::Fulfilled(v) => Phase::Fulfilled(v.clone()),
                Outcome::Rejected(e) => Phase::Rejected(e.clone()),
                Outcome::Cancelled => Phase::Cancelled,
            };
            let hook = core.cancel_hook.take();
            let hook = match outcome {
                Outcome::Cancelled => hook,
                _ => None,
            };
            (mem::take(&mut core.reactions), hook)
        };
        // Reactions run outside the lock: they may freely register further
        // continuations or settle other promises.
        if let Some(hook) = hook {
            hook();
        }
        for reaction in reactions {
            reaction(&outcome);
        }
    }

    /// Transitions a pending promise to cancelled: fires the producer's
    /// cancellation hook, then the [`on_cancel`](Self::on_cancel) callbacks
    /// in registration order. Resolving or rejecting afterwards is a no-op,
    /// and awaiters observe [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.settle(Outcome::Cancelled);
    }

    /// Installs the producer-side cancellation teardown. No-op unless the
    /// promise is still pending.
    pub(crate) fn set_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut core = self.lock();
        if matches!(core.phase, Phase::Pending) {
            core.cancel_hook = Some(Box::new(hook));
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Continuations
    ////////////////////////////////////////////////////////////////////////

    /// Registers a reaction; if the promise is already settled the reaction
    /// runs synchronously, in the caller's frame.
    ///
    /// This is the internal registration primitive; the public chaining
    /// methods go through [`subscribe_deferred`](Self::subscribe_deferred)
    /// for reentrancy protection.
    pub(crate) fn subscribe(&self, reaction: Reaction<T>) {
        let outcome = {
            let mut core = self.lock();
            match &core.phase {
                Phase::Pending => {
                    core.reactions.push(reaction);
                    return;
                }
                Phase::Fulfilled(v) => Outcome::Fulfilled(v.clone()),
                Phase::Rejected(e) => Outcome::Rejected(e.clone()),
                Phase::Cancelled => Outcome::Cancelled,
            }
        };
        reaction(&outcome);
    }

    /// Registers a reaction; if the promise is already settled the reaction
    /// is dispatched as a microtask on the current runtime.
    pub(crate) fn subscribe_deferred(&self, reaction: Reaction<T>) {
        let outcome = {
            let mut core = self.lock();
            match &core.phase {
                Phase::Pending => {
                    core.reactions.push(reaction);
                    return;
                }
                Phase::Fulfilled(v) => Outcome::Fulfilled(v.clone()),
                Phase::Rejected(e) => Outcome::Rejected(e.clone()),
                Phase::Cancelled => Outcome::Cancelled,
            }
        };
        Runtime::current().next_tick(move || reaction(&outcome));
    }

    /// Chains a value transformation, returning the derived promise.
    ///
    /// On fulfillment the callback maps the value; its `Err` rejects the
    /// derived promise. Rejection and cancellation pass through (the latter
    /// as an [`Error::Cancelled`] rejection of the derived promise).
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let (derived, resolver) = Promise::pending();
        self.subscribe_deferred(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => match f(v.clone()) {
                Ok(u) => resolver.resolve(u),
                Err(e) => resolver.reject(e),
            },
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }));
        derived
    }

    /// Chains a rejection handler, returning the derived promise.
    ///
    /// On rejection the callback may recover with `Ok` or re-reject with
    /// `Err`. Fulfillment passes through untouched; cancellation is not a
    /// rejection and is not intercepted.
    pub fn catch<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        let (derived, resolver) = Promise::pending();
        self.subscribe_deferred(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => resolver.resolve(v.clone()),
            Outcome::Rejected(e) => match f(e.clone()) {
                Ok(v) => resolver.resolve(v),
                Err(e) => resolver.reject(e),
            },
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }));
        derived
    }

    /// Chains a promise-returning continuation; the derived promise adopts
    /// the settlement of the promise the callback returns.
    pub fn and_then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let (derived, resolver) = Promise::pending();
        self.subscribe_deferred(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => resolver.adopt(f(v.clone())),
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }));
        derived
    }

    /// Runs `f` once the promise settles, whatever the outcome, and returns
    /// a derived promise mirroring the settlement.
    pub fn finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let (derived, resolver) = Promise::pending();
        self.subscribe_deferred(Box::new(move |outcome| {
            f();
            match outcome {
                Outcome::Fulfilled(v) => resolver.resolve(v.clone()),
                Outcome::Rejected(e) => resolver.reject(e.clone()),
                Outcome::Cancelled => resolver.reject(Error::Cancelled),
            }
        }));
        derived
    }

    /// Registers a callback fired when and only when the promise is
    /// cancelled. If it already is, the callback runs synchronously.
    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.subscribe(Box::new(move |outcome| {
            if matches!(outcome, Outcome::Cancelled) {
                f();
            }
        }));
    }

    ////////////////////////////////////////////////////////////////////////
    // Waiting
    ////////////////////////////////////////////////////////////////////////

    /// Waits for the settlement and returns the value, or fails with the
    /// rejection reason ([`Error::Cancelled`] for a cancelled promise).
    ///
    /// Context-aware: inside a fiber this suspends the fiber until a
    /// continuation wakes it; outside it drives the current thread's event
    /// loop until the promise settles. The out-of-fiber form must not be
    /// used while the loop is already running (no re-entry).
    pub fn wait(&self) -> Result<T> {
        match fiber::context() {
            Some(ctx) => self.wait_in_fiber(&ctx),
            None => self.wait_blocking(),
        }
    }

    /// Tracks the promise with `token`, then waits like [`wait`](Self::wait).
    ///
    /// Cancelling the token's source cancels this promise, which wakes the
    /// wait with [`Error::Cancelled`].
    pub fn wait_with(&self, token: &CancellationToken) -> Result<T> {
        token.track(self.clone());
        self.wait()
    }

    fn try_result(&self) -> Option<Result<T>> {
        match &self.lock().phase {
            Phase::Pending => None,
            Phase::Fulfilled(v) => Some(Ok(v.clone())),
            Phase::Rejected(e) => Some(Err(e.clone())),
            Phase::Cancelled => Some(Err(Error::Cancelled)),
        }
    }

    fn wait_in_fiber(&self, ctx: &fiber::FiberContext) -> Result<T> {
        // Fast path, covers the already-cancelled case as well.
        if let Some(result) = self.try_result() {
            return result;
        }
        let slot: Arc<SyncMutex<Option<Result<T>>>> = Arc::new(SyncMutex::new(None));
        let stash = Arc::clone(&slot);
        let rt = ctx.runtime.clone();
        let id = ctx.id;
        // The reaction holds only (id, runtime): no cycle through the fiber.
        self.subscribe(Box::new(move |outcome| {
            *stash.lock().expect("wait slot poisoned") = Some(outcome.to_result());
            rt.schedule_fiber(id);
        }));
        ctx.suspend();
        let taken = slot.lock().expect("wait slot poisoned").take();
        taken.unwrap_or_else(|| Err(Error::failure("fiber resumed before its promise settled")))
    }

    fn wait_blocking(&self) -> Result<T> {
        let rt = Runtime::current();
        let settled = {
            let this = self.clone();
            move || !this.is_pending()
        };
        rt.run_until(&settled);
        self.try_result()
            .unwrap_or_else(|| Err(Error::failure("event loop went idle with the promise still pending")))
    }
}

impl<T> Resolver<T>
where
    T: Clone + Send + 'static,
{
    fn promise(&self) -> Promise<T> {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fulfills the promise, firing `then` continuations in registration
    /// order. A no-op if the promise has already settled.
    pub fn resolve(&self, value: T) {
        self.promise().settle(Outcome::Fulfilled(value));
    }

    /// Rejects the promise, firing `catch` continuations in registration
    /// order. A no-op if the promise has already settled.
    pub fn reject(&self, reason: impl Into<Error>) {
        self.promise().settle(Outcome::Rejected(reason.into()));
    }

    /// Standard promise-follow: settles this promise however `other`
    /// settles (cancellation of `other` surfaces as an
    /// [`Error::Cancelled`] rejection here).
    pub fn adopt(&self, other: Promise<T>) {
        let resolver = self.clone();
        other.subscribe(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => resolver.resolve(v.clone()),
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }));
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}
