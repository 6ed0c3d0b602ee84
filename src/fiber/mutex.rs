//! See [`Mutex`] for examples and docs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};

use crate::promise::{Promise, Resolver};

/// An asynchronous mutual-exclusion lock for fibers.
///
/// [`acquire`](Self::acquire) returns a promise of a [`Guard`]; the promise
/// fulfills immediately when the lock is free, otherwise the caller joins a
/// strictly FIFO waiter queue. Ownership passes directly from a released
/// guard to the next live waiter, so the lock never appears momentarily
/// free while fibers are queued.
///
/// Unlike [`std::sync::Mutex`] this type protects no data of its own; it
/// orders critical sections of cooperating fibers. Acquiring never blocks
/// the thread: the caller decides when to wait on the returned promise.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use spindle::fiber::{self, Mutex};
///
/// let mutex = Arc::new(Mutex::new());
/// let m = Arc::clone(&mutex);
/// let p = fiber::spawn(move || {
///     let guard = m.acquire().wait()?;
///     // exclusive section, may suspend freely
///     guard.release();
///     Ok(())
/// });
/// p.wait().unwrap();
/// ```
pub struct Mutex {
    core: Arc<Core>,
}

struct Core {
    state: SyncMutex<State>,
}

struct State {
    locked: bool,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

struct Waiter {
    id: u64,
    resolver: Resolver<Guard>,
    /// The acquire promise handed to the caller; consulted on release so a
    /// cancelled waiter never receives the lock.
    acquired: Promise<Guard>,
}

impl Core {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("mutex state lock poisoned")
    }
}

impl Mutex {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                state: SyncMutex::new(State {
                    locked: false,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        }
    }

    /// Acquires the lock.
    ///
    /// If the mutex is unlocked, it locks and the returned promise is
    /// already fulfilled with a [`Guard`]. Otherwise the returned promise
    /// stays pending until every earlier waiter has held and released the
    /// lock (strict FIFO).
    ///
    /// Cancelling the returned promise gives up the queue position; a
    /// cancelled waiter is skipped at handover time and the wait fails with
    /// [`Error::Cancelled`](crate::error::Error::Cancelled).
    pub fn acquire(&self) -> Promise<Guard> {
        let mut st = self.core.lock_state();
        if !st.locked {
            st.locked = true;
            drop(st);
            log::trace!("mutex acquired without waiting");
            return Promise::resolved(Guard::new(Arc::clone(&self.core)));
        }
        let (promise, resolver) = Promise::pending();
        st.next_waiter += 1;
        let id = st.next_waiter;
        st.waiters.push_back(Waiter {
            id,
            resolver,
            acquired: promise.clone(),
        });
        drop(st);
        log::trace!("mutex contended, waiter {} queued", id);
        // Leave the queue as soon as the waiter is cancelled, so the queue
        // length reflects only live waiters.
        let core = Arc::downgrade(&self.core);
        promise.on_cancel(move || {
            if let Some(core) = core.upgrade() {
                core.lock_state().waiters.retain(|w| w.id != id);
            }
        });
        promise
    }

    /// Attempts to acquire the lock without queueing.
    ///
    /// Returns `None` when the mutex is locked. Does not yield.
    pub fn try_acquire(&self) -> Option<Guard> {
        let mut st = self.core.lock_state();
        if st.locked {
            None
        } else {
            st.locked = true;
            drop(st);
            Some(Guard::new(Arc::clone(&self.core)))
        }
    }

    /// Whether exactly one unreleased guard currently exists.
    pub fn is_locked(&self) -> bool {
        self.core.lock_state().locked
    }

    /// The number of waiters whose acquire promises are still pending.
    pub fn queue_len(&self) -> usize {
        self.core.lock_state().waiters.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.core.lock_state().waiters.is_empty()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.core.lock_state();
        f.debug_struct("Mutex")
            .field("locked", &st.locked)
            .field("waiters", &st.waiters.len())
            .finish_non_exhaustive()
    }
}

fn release(core: &Arc<Core>) {
    let next = {
        let mut st = core.lock_state();
        loop {
            match st.waiters.pop_front() {
                // A waiter that was cancelled after queueing (but before its
                // eager dequeue ran) never receives the lock.
                Some(w) if w.acquired.is_cancelled() => continue,
                Some(w) => break Some(w),
                None => {
                    st.locked = false;
                    break None;
                }
            }
        }
    };
    // Resolving outside the state lock: the waiter's continuations may call
    // right back into the mutex.
    if let Some(waiter) = next {
        log::trace!("mutex handed over to waiter {}", waiter.id);
        waiter.resolver.resolve(Guard::new(Arc::clone(core)));
    }
}

////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////

/// A one-shot handle held by the current owner of a [`Mutex`].
///
/// [`release`](Self::release) hands the lock to the next live waiter, or
/// unlocks the mutex when the queue is empty. Releasing twice is a no-op;
/// every clone of a guard shares the same one-shot flag (clones exist
/// because the guard travels inside a promise).
///
/// The release is explicit. A guard that is dropped without being released
/// keeps the mutex locked; promises holding guard copies must never unlock
/// it behind the owner's back.
#[derive(Clone)]
pub struct Guard {
    core: Arc<Core>,
    released: Arc<AtomicBool>,
}

impl Guard {
    fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Releases the lock: the next live waiter (FIFO) receives a fresh
    /// guard, or the mutex unlocks. A second call is a no-op.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::Relaxed) {
            release(&self.core);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
