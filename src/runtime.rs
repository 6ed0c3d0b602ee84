//! The event loop.
//!
//! A [`Runtime`] drives fibers, microtasks and timers on a single thread
//! until all of them are drained. It is a per-loop service: free functions
//! all over the crate reach it through [`Runtime::current`], which resolves
//! to the runtime owned by the current thread (the driver thread lazily
//! creates one; fiber threads inherit the runtime that started them).
//!
//! One loop iteration:
//! 1. start fibers that were created since the last tick,
//! 2. drain the microtask queue to empty (microtasks may enqueue more
//!    microtasks, they run in the same drain),
//! 3. resume the fibers that were ready when the iteration began (fibers
//!    scheduled during the drain run on the next iteration),
//! 4. fire every timer whose due-time has passed, in due order, ties broken
//!    by insertion order,
//! 5. exit if nothing is left, otherwise sleep until the next timer is due.
//!
//! Microtasks always run before the fiber resumption step of the same tick,
//! and two fibers scheduled within one tick resume in scheduling order.

use std::cell::RefCell;
use std::cmp;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock;
use crate::fiber::{Fiber, FiberId, StepOutcome};

type Callback = Box<dyn FnOnce() + Send>;

////////////////////////////////////////////////////////////////////////////////
// Timers
////////////////////////////////////////////////////////////////////////////////

/// A handle to a pending timer, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    due: Instant,
    /// Insertion sequence number, breaks due-time ties.
    seq: u64,
    id: TimerId,
    callback: Callback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline must win.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Runtime
////////////////////////////////////////////////////////////////////////////////

/// A handle to an event loop.
///
/// Cheap to clone; all clones drive the same loop. See the module docs for
/// the iteration order and the ordering guarantees.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    queues: SyncMutex<Queues>,
}

struct Queues {
    /// Created, not yet started fibers.
    fresh: VecDeque<Fiber>,
    /// Started fibers currently suspended, owned by the loop.
    parked: HashMap<FiberId, Fiber>,
    /// Fibers scheduled for resumption, FIFO.
    ready: VecDeque<FiberId>,
    /// Membership set for `ready`, a fiber is resumed at most once per wakeup.
    queued: HashSet<FiberId>,
    /// The fiber currently holding the baton, if any.
    current: Option<FiberId>,
    microtasks: VecDeque<Callback>,
    timers: BinaryHeap<TimerEntry>,
    cancelled_timers: HashSet<TimerId>,
    /// Pending not-cancelled timers; keeps the loop alive while non-zero.
    live_timers: usize,
    next_timer_id: u64,
    next_timer_seq: u64,
    running: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<Runtime>> = RefCell::new(None);
}

/// Binds `rt` as the current runtime of this thread. Called by the fiber
/// trampoline so fibers inherit the loop that started them.
pub(crate) fn set_current(rt: &Runtime) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(rt.clone()));
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: SyncMutex::new(Queues {
                    fresh: VecDeque::new(),
                    parked: HashMap::new(),
                    ready: VecDeque::new(),
                    queued: HashSet::new(),
                    current: None,
                    microtasks: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    cancelled_timers: HashSet::new(),
                    live_timers: 0,
                    next_timer_id: 0,
                    next_timer_seq: 0,
                    running: false,
                }),
            }),
        }
    }

    /// The runtime of the current thread.
    ///
    /// Driver threads get one created lazily on first use; inside a fiber
    /// this is always the runtime that owns the fiber.
    pub fn current() -> Runtime {
        CURRENT.with(|cell| {
            let mut cell = cell.borrow_mut();
            match &*cell {
                Some(rt) => rt.clone(),
                None => {
                    let rt = Runtime::new();
                    *cell = Some(rt.clone());
                    rt
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner.queues.lock().expect("runtime queues lock poisoned")
    }

    ////////////////////////////////////////////////////////////////////////
    // Scheduling hooks
    ////////////////////////////////////////////////////////////////////////

    /// Enqueues a not-started fiber; it runs on the next loop iteration.
    pub(crate) fn add_fiber(&self, fiber: Fiber) {
        let mut q = self.lock();
        log::trace!("fiber {} enqueued", fiber.id());
        q.fresh.push_back(fiber);
    }

    /// Schedules a started, suspended fiber for resumption.
    ///
    /// Scheduling a fiber that is already queued, terminated or unknown is a
    /// no-op.
    pub fn schedule_fiber(&self, id: FiberId) {
        let mut q = self.lock();
        let alive = q.parked.contains_key(&id) || q.current == Some(id);
        if alive && q.queued.insert(id) {
            q.ready.push_back(id);
            log::trace!("fiber {} scheduled", id);
        }
    }

    /// Enqueues a zero-delay callback, run before the next fiber resumption
    /// step.
    pub fn next_tick<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().microtasks.push_back(Box::new(callback));
    }

    /// Schedules `callback` to run once `after` has elapsed. The returned
    /// handle can be passed to [`cancel_timer`](Self::cancel_timer).
    pub fn add_timer<F>(&self, after: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut q = self.lock();
        q.next_timer_id += 1;
        q.next_timer_seq += 1;
        let id = TimerId(q.next_timer_id);
        let seq = q.next_timer_seq;
        q.timers.push(TimerEntry {
            due: clock::accurate() + after.min(clock::INFINITY),
            seq,
            id,
            callback: Box::new(callback),
        });
        q.live_timers += 1;
        log::trace!("timer {:?} armed for {:?}", id, after);
        id
    }

    /// Removes a timer if it is still pending; a no-op otherwise.
    pub fn cancel_timer(&self, id: TimerId) {
        let mut q = self.lock();
        let pending = q.timers.iter().any(|e| e.id == id) && !q.cancelled_timers.contains(&id);
        if pending {
            q.cancelled_timers.insert(id);
            q.live_timers -= 1;
            log::trace!("timer {:?} cancelled", id);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Driving
    ////////////////////////////////////////////////////////////////////////

    /// Drains the loop until every queue is empty and no timer is pending.
    ///
    /// Must not be re-entered: calling `run` from inside a microtask, a
    /// timer callback or a blocking [`Promise::wait`] that is already
    /// driving this loop is a contract violation.
    ///
    /// [`Promise::wait`]: crate::promise::Promise::wait
    pub fn run(&self) {
        self.drive(None)
    }

    /// Like [`run`](Self::run), but also stops as soon as `stop` reports
    /// true between phases. Used by the blocking promise wait.
    pub(crate) fn run_until(&self, stop: &dyn Fn() -> bool) {
        self.drive(Some(stop))
    }

    fn drive(&self, stop: Option<&dyn Fn() -> bool>) {
        {
            let mut q = self.lock();
            if q.running {
                debug_assert!(!q.running, "event loop re-entered");
                return;
            }
            q.running = true;
        }

        loop {
            if let Some(stop) = stop {
                if stop() {
                    break;
                }
            }

            let tick = clock::accurate();
            let prev = clock::enter_tick(tick);
            self.start_fresh();
            self.drain_microtasks();
            self.resume_ready();
            self.fire_due_timers(tick);
            clock::leave_tick(prev);

            enum Next {
                Again,
                Sleep(Instant),
                Idle,
            }
            let next = {
                let mut q = self.lock();
                if !q.fresh.is_empty() || !q.microtasks.is_empty() || !q.ready.is_empty() {
                    Next::Again
                } else if let Some(due) = q.next_timer_due() {
                    Next::Sleep(due)
                } else {
                    Next::Idle
                }
            };
            match next {
                Next::Again => {}
                Next::Sleep(due) => {
                    if let Some(stop) = stop {
                        if stop() {
                            break;
                        }
                    }
                    let now = clock::accurate();
                    if due > now {
                        thread::sleep(due - now);
                    }
                }
                Next::Idle => break,
            }
        }

        self.lock().running = false;
    }

    fn start_fresh(&self) {
        loop {
            let fiber = self.lock().fresh.pop_front();
            let mut fiber = match fiber {
                Some(fiber) => fiber,
                None => break,
            };
            let id = fiber.id();
            self.lock().current = Some(id);
            let outcome = fiber.start(self);
            self.lock().current = None;
            self.settle_step(fiber, outcome);
        }
    }

    fn drain_microtasks(&self) {
        loop {
            let task = self.lock().microtasks.pop_front();
            match task {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    fn resume_ready(&self) {
        // Snapshot: fibers scheduled while this step runs wait for the next
        // tick.
        let snapshot: Vec<FiberId> = {
            let mut q = self.lock();
            let ids: Vec<FiberId> = q.ready.drain(..).collect();
            for id in &ids {
                q.queued.remove(id);
            }
            ids
        };
        for id in snapshot {
            let fiber = self.lock().parked.remove(&id);
            let fiber = match fiber {
                Some(fiber) => fiber,
                None => {
                    log::trace!("fiber {} scheduled but no longer parked", id);
                    continue;
                }
            };
            self.lock().current = Some(id);
            let outcome = fiber.step();
            self.lock().current = None;
            self.settle_step(fiber, outcome);
        }
    }

    fn settle_step(&self, fiber: Fiber, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Suspended => {
                let mut q = self.lock();
                q.parked.insert(fiber.id(), fiber);
            }
            StepOutcome::Finished => fiber.reap(),
        }
    }

    fn fire_due_timers(&self, now: Instant) {
        loop {
            enum Popped {
                Fire(Callback),
                Skip,
                Done,
            }
            let popped = {
                let mut q = self.lock();
                let due = matches!(q.timers.peek(), Some(entry) if entry.due <= now);
                if due {
                    let entry = q.timers.pop().expect("peeked timer vanished");
                    if q.cancelled_timers.remove(&entry.id) {
                        Popped::Skip
                    } else {
                        q.live_timers -= 1;
                        Popped::Fire(entry.callback)
                    }
                } else {
                    Popped::Done
                }
            };
            match popped {
                Popped::Fire(callback) => callback(),
                Popped::Skip => continue,
                Popped::Done => break,
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Introspection & teardown
    ////////////////////////////////////////////////////////////////////////

    /// Whether any runnable work (fibers, microtasks, timers) remains.
    ///
    /// Suspended fibers that nothing has scheduled do not count: with no
    /// timer or microtask left to wake them, they can never run again.
    pub fn has_pending_work(&self) -> bool {
        let q = self.lock();
        !q.fresh.is_empty() || !q.ready.is_empty() || !q.microtasks.is_empty() || q.live_timers > 0
    }

    /// Discards all pending state. Intended for tests.
    ///
    /// Fibers discarded here never resume; their backing threads stay parked
    /// for the remainder of the process.
    pub fn reset(&self) {
        let mut q = self.lock();
        debug_assert!(!q.running, "reset of a running event loop");
        q.fresh.clear();
        q.parked.clear();
        q.ready.clear();
        q.queued.clear();
        q.current = None;
        q.microtasks.clear();
        q.timers.clear();
        q.cancelled_timers.clear();
        q.live_timers = 0;
    }
}

impl Queues {
    /// Due time of the nearest pending timer, dropping cancelled heap
    /// entries on the way.
    fn next_timer_due(&mut self) -> Option<Instant> {
        loop {
            let (due, cancelled) = match self.timers.peek() {
                Some(entry) => (entry.due, self.cancelled_timers.contains(&entry.id)),
                None => return None,
            };
            if !cancelled {
                return Some(due);
            }
            let entry = self.timers.pop().expect("peeked timer vanished");
            self.cancelled_timers.remove(&entry.id);
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.lock();
        f.debug_struct("Runtime")
            .field("fresh", &q.fresh.len())
            .field("parked", &q.parked.len())
            .field("ready", &q.ready.len())
            .field("microtasks", &q.microtasks.len())
            .field("live_timers", &q.live_timers)
            .field("running", &q.running)
            .finish_non_exhaustive()
    }
}
