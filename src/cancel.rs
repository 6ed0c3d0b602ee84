//! Cooperative cancellation: sources, tokens and registrations.
//!
//! A [`CancellationTokenSource`] owns the authority to cancel; its
//! [`CancellationToken`]s are shared views that track promises and receive
//! callbacks. Cancelling the source transitions the token exactly once:
//! every tracked promise is cancelled in insertion order, then the
//! registered callbacks fire in registration order, then both sets are
//! cleared. Fibers observe all of this cooperatively: a cancelled promise
//! wakes its awaiters, which fail with
//! [`Error::Cancelled`](crate::error::Error::Cancelled); work already done
//! before the next suspension point is not undone.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::promise::{Outcome, Promise};
use crate::timer;

////////////////////////////////////////////////////////////////////////////////
// Core
////////////////////////////////////////////////////////////////////////////////

/// Type-erased handle to a tracked promise.
trait Tracked: Send {
    fn cancel_tracked(&self);
    fn addr(&self) -> usize;
}

impl<T: Clone + Send + 'static> Tracked for Promise<T> {
    fn cancel_tracked(&self) {
        self.cancel();
    }

    fn addr(&self) -> usize {
        Promise::addr(self)
    }
}

struct TokenCore {
    /// The never-cancellable token: every mutation is a no-op.
    never: bool,
    state: SyncMutex<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    next_id: u64,
    tracked: Vec<(u64, Box<dyn Tracked>)>,
    callbacks: Vec<(u64, Box<dyn FnOnce() + Send>)>,
    /// The pending auto-cancel delay installed by `cancel_after`, if any.
    auto_cancel: Option<Promise<()>>,
}

impl TokenCore {
    fn new() -> Self {
        Self {
            never: false,
            state: SyncMutex::new(TokenState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().expect("token state lock poisoned")
    }
}

fn cancel_core(core: &Arc<TokenCore>) {
    if core.never {
        return;
    }
    let (tracked, callbacks, auto_cancel) = {
        let mut st = core.lock_state();
        if st.cancelled {
            return;
        }
        st.cancelled = true;
        (
            mem::take(&mut st.tracked),
            mem::take(&mut st.callbacks),
            st.auto_cancel.take(),
        )
    };
    log::debug!(
        "cancelling token: {} tracked promise(s), {} callback(s)",
        tracked.len(),
        callbacks.len(),
    );
    if let Some(timer) = auto_cancel {
        timer.cancel();
    }
    for (_, promise) in tracked {
        promise.cancel_tracked();
    }
    for (_, callback) in callbacks {
        callback();
    }
}

////////////////////////////////////////////////////////////////////////////////
// CancellationTokenSource
////////////////////////////////////////////////////////////////////////////////

/// Owns the cancellation authority for one [`CancellationToken`].
pub struct CancellationTokenSource {
    core: Arc<TokenCore>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            core: Arc::new(TokenCore::new()),
        }
    }

    /// A source that cancels itself automatically once `after` has elapsed,
    /// unless [`cancel`](Self::cancel) ran first.
    pub fn with_timeout(after: Duration) -> Self {
        let source = Self::new();
        source.cancel_after(after);
        source
    }

    /// A source that cancels as soon as any of `tokens` does. If one of
    /// them is already cancelled, the new source is cancelled synchronously
    /// before this returns.
    pub fn linked<'a, I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = &'a CancellationToken>,
    {
        let source = Self::new();
        for token in tokens {
            if token.is_cancelled() {
                cancel_core(&source.core);
                break;
            }
            let core = Arc::downgrade(&source.core);
            let _registration = token.on_cancel(move || {
                if let Some(core) = core.upgrade() {
                    cancel_core(&core);
                }
            });
        }
        source
    }

    /// The shared view of this source's cancellation state.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            core: Arc::clone(&self.core),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.lock_state().cancelled
    }

    /// Cancels: transitions the token, cancels every tracked promise in
    /// insertion order, fires the callbacks in registration order, clears
    /// both sets. Idempotent: only the first call does anything.
    pub fn cancel(&self) {
        cancel_core(&self.core);
    }

    /// Schedules an automatic [`cancel`](Self::cancel) for `after` from
    /// now, replacing any previously scheduled one. No effect if the token
    /// is already cancelled.
    pub fn cancel_after(&self, after: Duration) {
        let replaced = {
            let mut st = self.core.lock_state();
            if st.cancelled {
                return;
            }
            st.auto_cancel.take()
        };
        if let Some(previous) = replaced {
            previous.cancel();
        }
        let deadline = timer::delay(after);
        let core = Arc::downgrade(&self.core);
        deadline.subscribe(Box::new(move |outcome: &Outcome<()>| {
            if matches!(outcome, Outcome::Fulfilled(_)) {
                if let Some(core) = core.upgrade() {
                    cancel_core(&core);
                }
            }
        }));
        let mut st = self.core.lock_state();
        if st.cancelled {
            drop(st);
            deadline.cancel();
        } else {
            st.auto_cancel = Some(deadline);
        }
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// CancellationToken
////////////////////////////////////////////////////////////////////////////////

/// A shared view of a cancellation signal. Clones observe the same source.
#[derive(Clone)]
pub struct CancellationToken {
    core: Arc<TokenCore>,
}

static NONE: Lazy<CancellationToken> = Lazy::new(|| CancellationToken {
    core: Arc::new(TokenCore {
        never: true,
        state: SyncMutex::new(TokenState::default()),
    }),
});

impl CancellationToken {
    /// The never-cancellable token: [`track`](Self::track) is a no-op and
    /// [`on_cancel`](Self::on_cancel) returns a pre-disposed registration.
    pub fn none() -> Self {
        NONE.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.lock_state().cancelled
    }

    /// Fails with [`Error::Cancelled`] if the token has been cancelled.
    pub fn throw_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Attaches `promise` to this token and returns it.
    ///
    /// Cancelling the source cancels every tracked promise; a tracked
    /// promise that settles on its own is untracked automatically. If the
    /// token is already cancelled the promise is cancelled before this
    /// returns.
    pub fn track<T>(&self, promise: Promise<T>) -> Promise<T>
    where
        T: Clone + Send + 'static,
    {
        if self.core.never {
            return promise;
        }
        let registered = {
            let mut st = self.core.lock_state();
            if st.cancelled {
                None
            } else {
                st.next_id += 1;
                let id = st.next_id;
                st.tracked.push((id, Box::new(promise.clone())));
                Some(id)
            }
        };
        match registered {
            None => promise.cancel(),
            Some(id) => {
                // Auto-untrack on settlement, whatever the outcome.
                let core = Arc::downgrade(&self.core);
                promise.subscribe(Box::new(move |_: &Outcome<T>| {
                    if let Some(core) = core.upgrade() {
                        core.lock_state().tracked.retain(|(tid, _)| *tid != id);
                    }
                }));
            }
        }
        promise
    }

    /// Detaches `promise` if it is currently tracked; a no-op otherwise.
    pub fn untrack<T>(&self, promise: &Promise<T>)
    where
        T: Clone + Send + 'static,
    {
        if self.core.never {
            return;
        }
        let addr = Promise::addr(promise);
        self.core
            .lock_state()
            .tracked
            .retain(|(_, p)| p.addr() != addr);
    }

    /// Detaches every tracked promise without cancelling anything.
    pub fn clear_tracked(&self) {
        self.core.lock_state().tracked.clear();
    }

    pub fn tracked_count(&self) -> usize {
        self.core.lock_state().tracked.len()
    }

    /// Registers a callback fired on cancellation, in registration order.
    ///
    /// If the token is already cancelled, `f` runs synchronously and the
    /// returned [`Registration`] is pre-disposed.
    pub fn on_cancel<F>(&self, f: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        if self.core.never {
            return Registration::disposed();
        }
        let mut f = Some(f);
        let registered = {
            let mut st = self.core.lock_state();
            if st.cancelled {
                None
            } else {
                st.next_id += 1;
                let id = st.next_id;
                let callback = f.take().expect("callback consumed twice");
                st.callbacks.push((id, Box::new(callback)));
                Some(id)
            }
        };
        match registered {
            None => {
                if let Some(f) = f.take() {
                    f();
                }
                Registration::disposed()
            }
            Some(id) => Registration {
                slot: Some((Arc::downgrade(&self.core), id)),
            },
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("tracked", &self.tracked_count())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Registration
////////////////////////////////////////////////////////////////////////////////

/// A handle to one [`on_cancel`](CancellationToken::on_cancel) callback.
///
/// [`dispose`](Self::dispose) removes the callback if it has not fired yet;
/// disposing twice is a no-op. Dropping a registration does *not* dispose
/// it; the callback stays armed.
#[derive(Debug)]
pub struct Registration {
    slot: Option<(Weak<TokenCore>, u64)>,
}

impl Registration {
    fn disposed() -> Self {
        Self { slot: None }
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.is_none()
    }

    /// Removes the callback if still registered. Idempotent.
    pub fn dispose(&mut self) {
        if let Some((core, id)) = self.slot.take() {
            if let Some(core) = core.upgrade() {
                core.lock_state().callbacks.retain(|(cid, _)| *cid != id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::delay;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn cancel_is_idempotent_and_fires_callbacks_once() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _reg = token.on_cancel(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert!(!token.is_cancelled());
        source.cancel();
        source.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            let _ = token.on_cancel(move || order.lock().unwrap().push(i));
        }
        source.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancel_cancels_tracked_promises_and_clears_the_set() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let mut promises = Vec::new();
        for _ in 0..3 {
            promises.push(token.track(delay(Duration::from_secs(1))));
        }
        assert_eq!(token.tracked_count(), 3);
        source.cancel();
        assert_eq!(token.tracked_count(), 0);
        for p in promises {
            assert!(p.is_cancelled());
            assert!(p.wait().unwrap_err().is_cancelled());
        }
    }

    #[test]
    fn tracked_promises_untrack_on_settlement() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let (p, r) = Promise::pending();
        token.track(p.clone());
        assert_eq!(token.tracked_count(), 1);
        r.resolve(1);
        assert_eq!(token.tracked_count(), 0);

        let (p, _r) = Promise::<i32>::pending();
        token.track(p.clone());
        assert_eq!(token.tracked_count(), 1);
        p.cancel();
        assert_eq!(token.tracked_count(), 0);
    }

    #[test]
    fn tracking_on_a_cancelled_token_cancels_immediately() {
        let source = CancellationTokenSource::new();
        source.cancel();
        let p = source.token().track(Promise::<i32>::pending().0);
        assert!(p.is_cancelled());
    }

    #[test]
    fn untrack_and_clear_do_not_cancel() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let p = token.track(Promise::<i32>::pending().0);
        token.untrack(&p);
        assert_eq!(token.tracked_count(), 0);
        let q = token.track(Promise::<i32>::pending().0);
        token.clear_tracked();
        assert_eq!(token.tracked_count(), 0);
        source.cancel();
        assert!(p.is_pending());
        assert!(q.is_pending());
    }

    #[test]
    fn on_cancel_after_cancellation_runs_synchronously() {
        let source = CancellationTokenSource::new();
        source.cancel();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        let reg = source.token().on_cancel(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hit.load(Ordering::Relaxed), 1);
        assert!(reg.is_disposed());
    }

    #[test]
    fn disposed_registration_never_fires() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        let mut reg = token.on_cancel(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        reg.dispose();
        reg.dispose();
        assert!(reg.is_disposed());
        source.cancel();
        assert_eq!(hit.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn throw_if_cancelled() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        assert!(token.throw_if_cancelled().is_ok());
        source.cancel();
        assert!(token.throw_if_cancelled().unwrap_err().is_cancelled());
    }

    #[test]
    fn none_token_ignores_everything() {
        let token = CancellationToken::none();
        assert!(!token.is_cancelled());
        let p = token.track(Promise::<i32>::pending().0);
        assert!(p.is_pending());
        assert_eq!(token.tracked_count(), 0);
        let reg = token.on_cancel(|| panic!("must never fire"));
        assert!(reg.is_disposed());
        assert!(token.throw_if_cancelled().is_ok());
    }

    #[test]
    fn linked_source_follows_any_input() {
        let a = CancellationTokenSource::new();
        let b = CancellationTokenSource::new();
        let ta = a.token();
        let tb = b.token();
        let linked = CancellationTokenSource::linked(vec![&ta, &tb]);
        assert!(!linked.is_cancelled());
        b.cancel();
        assert!(linked.is_cancelled());
    }

    #[test]
    fn linked_source_inherits_an_already_cancelled_input() {
        let a = CancellationTokenSource::new();
        a.cancel();
        let ta = a.token();
        let linked = CancellationTokenSource::linked(vec![&ta]);
        assert!(linked.is_cancelled());
    }

    #[test]
    fn auto_cancel_fires_through_the_loop() {
        let source = CancellationTokenSource::with_timeout(Duration::from_millis(10));
        let token = source.token();
        let tracked = token.track(delay(Duration::from_secs(5)));
        // Drive the loop past the auto-cancel deadline.
        delay(Duration::from_millis(30)).wait().unwrap();
        assert!(token.is_cancelled());
        assert!(tracked.is_cancelled());
        assert_eq!(token.tracked_count(), 0);
    }

    #[test]
    fn cancel_after_replaces_the_previous_deadline() {
        let rt = crate::runtime::Runtime::current();
        let source = CancellationTokenSource::new();
        source.cancel_after(Duration::from_millis(10));
        source.cancel_after(Duration::from_secs(3600));
        // The 10ms deadline was replaced; after 30ms nothing has fired.
        delay(Duration::from_millis(30)).wait().unwrap();
        assert!(!source.is_cancelled());
        // The replaced timer was cancelled, only the hour-long one remains.
        source.cancel();
        assert!(!rt.has_pending_work());
    }

    #[test]
    fn cancel_after_on_a_cancelled_source_is_a_noop() {
        let rt = crate::runtime::Runtime::current();
        let source = CancellationTokenSource::new();
        source.cancel();
        source.cancel_after(Duration::from_secs(3600));
        assert!(!rt.has_pending_work());
    }
}
