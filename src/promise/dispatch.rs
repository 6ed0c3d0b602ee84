//! Concurrency-capped task dispatch: [`concurrent`], [`batch`] and their
//! never-rejecting `*_settled` variants.
//!
//! Tasks start in input order, at most `limit` in flight at a time. Results
//! come back keyed and ordered exactly like the input (see [`TaskMap`]).
//! Scheduling passes run as microtasks, never in the caller's synchronous
//! frame; lazy tasks are invoked in the scheduling tick that starts them.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex as SyncMutex};

use crate::error::Error;
use crate::promise::task::{Settlement, TaskInput, TaskKey, TaskMap, Tasks};
use crate::promise::{Outcome, Promise, Resolver};
use crate::runtime::Runtime;

/// The concurrency cap used when the caller has no particular preference.
pub const DEFAULT_CONCURRENCY: usize = 10;

////////////////////////////////////////////////////////////////////////////////
// concurrent
////////////////////////////////////////////////////////////////////////////////

struct Pool<T> {
    rt: Runtime,
    limit: usize,
    resolver: Resolver<TaskMap<T>>,
    state: SyncMutex<PoolState<T>>,
}

struct PoolState<T> {
    backlog: VecDeque<(usize, TaskInput<T>)>,
    keys: Vec<TaskKey>,
    slots: Vec<Option<T>>,
    running: usize,
    completed: usize,
}

/// Runs `tasks` with at most `limit` in flight simultaneously; resolves
/// with the map of all values in input key order.
///
/// The first task failure rejects the outer promise; running siblings are
/// neither cancelled nor waited for, and their settlements are ignored.
/// `limit == 0` rejects with [`Error::InvalidArgument`]; an empty input
/// resolves with an empty map.
pub fn concurrent<T, I>(tasks: I, limit: usize) -> Promise<TaskMap<T>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let total = entries.len();
    let (promise, resolver) = Promise::pending();
    if limit == 0 {
        resolver.reject(Error::invalid_argument("concurrency limit must be positive"));
        return promise;
    }
    if total == 0 {
        resolver.resolve(TaskMap::new());
        return promise;
    }

    let keys = entries.iter().map(|(k, _)| k.clone()).collect();
    let backlog = entries
        .into_iter()
        .enumerate()
        .map(|(i, (_, input))| (i, input))
        .collect();
    let pool = Arc::new(Pool {
        rt: Runtime::current(),
        limit,
        resolver,
        state: SyncMutex::new(PoolState {
            backlog,
            keys,
            slots: (0..total).map(|_| None).collect(),
            running: 0,
            completed: 0,
        }),
    });
    let kickoff = Arc::clone(&pool);
    pool.rt.next_tick(move || scheduling_pass(&kickoff));
    promise
}

/// Starts backlog tasks until the in-flight cap is reached.
fn scheduling_pass<T>(pool: &Arc<Pool<T>>)
where
    T: Clone + Send + 'static,
{
    loop {
        let next = {
            let mut st = pool.state.lock().expect("pool lock poisoned");
            if st.running >= pool.limit {
                None
            } else if let Some(task) = st.backlog.pop_front() {
                st.running += 1;
                Some(task)
            } else {
                None
            }
        };
        let (index, input) = match next {
            Some(task) => task,
            None => break,
        };
        let task_promise = match input.into_promise() {
            Ok(p) => p,
            Err(e) => {
                pool.state.lock().expect("pool lock poisoned").running -= 1;
                pool.resolver.reject(e);
                continue;
            }
        };
        let pool = Arc::clone(pool);
        task_promise.subscribe(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => task_fulfilled(&pool, index, v.clone()),
            Outcome::Rejected(e) => task_failed(&pool, e.clone()),
            Outcome::Cancelled => task_failed(&pool, Error::Cancelled),
        }));
    }
}

fn task_fulfilled<T>(pool: &Arc<Pool<T>>, index: usize, value: T)
where
    T: Clone + Send + 'static,
{
    let done = {
        let mut st = pool.state.lock().expect("pool lock poisoned");
        st.slots[index] = Some(value);
        st.running -= 1;
        st.completed += 1;
        if st.completed == st.slots.len() {
            let keys = mem::take(&mut st.keys);
            let slots = mem::take(&mut st.slots);
            Some(
                keys.into_iter()
                    .zip(slots)
                    .map(|(k, v)| (k, v.expect("every task completed")))
                    .collect::<TaskMap<T>>(),
            )
        } else {
            None
        }
    };
    match done {
        Some(map) => pool.resolver.resolve(map),
        None => {
            let pool = Arc::clone(pool);
            pool.rt.clone().next_tick(move || scheduling_pass(&pool));
        }
    }
}

fn task_failed<T>(pool: &Arc<Pool<T>>, reason: Error)
where
    T: Clone + Send + 'static,
{
    pool.state.lock().expect("pool lock poisoned").running -= 1;
    // No follow-up scheduling pass: passes triggered by still-running
    // siblings keep draining the backlog, their results go nowhere.
    pool.resolver.reject(reason);
}

////////////////////////////////////////////////////////////////////////////////
// concurrent_settled
////////////////////////////////////////////////////////////////////////////////

struct SettledPool<T> {
    rt: Runtime,
    limit: usize,
    resolver: Resolver<TaskMap<Settlement<T>>>,
    state: SyncMutex<SettledPoolState<T>>,
}

struct SettledPoolState<T> {
    backlog: VecDeque<(usize, TaskInput<T>)>,
    keys: Vec<TaskKey>,
    slots: Vec<Option<Settlement<T>>>,
    running: usize,
    completed: usize,
}

/// [`concurrent`], except the outer promise never rejects: every task
/// outcome (including failed task construction) is recorded as a
/// [`Settlement`] at its original key.
pub fn concurrent_settled<T, I>(tasks: I, limit: usize) -> Promise<TaskMap<Settlement<T>>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let total = entries.len();
    let (promise, resolver) = Promise::pending();
    if limit == 0 {
        resolver.reject(Error::invalid_argument("concurrency limit must be positive"));
        return promise;
    }
    if total == 0 {
        resolver.resolve(TaskMap::new());
        return promise;
    }

    let keys = entries.iter().map(|(k, _)| k.clone()).collect();
    let backlog = entries
        .into_iter()
        .enumerate()
        .map(|(i, (_, input))| (i, input))
        .collect();
    let pool = Arc::new(SettledPool {
        rt: Runtime::current(),
        limit,
        resolver,
        state: SyncMutex::new(SettledPoolState {
            backlog,
            keys,
            slots: (0..total).map(|_| None).collect(),
            running: 0,
            completed: 0,
        }),
    });
    let kickoff = Arc::clone(&pool);
    pool.rt.next_tick(move || settled_scheduling_pass(&kickoff));
    promise
}

fn settled_scheduling_pass<T>(pool: &Arc<SettledPool<T>>)
where
    T: Clone + Send + 'static,
{
    loop {
        let next = {
            let mut st = pool.state.lock().expect("pool lock poisoned");
            if st.running >= pool.limit {
                None
            } else if let Some(task) = st.backlog.pop_front() {
                st.running += 1;
                Some(task)
            } else {
                None
            }
        };
        let (index, input) = match next {
            Some(task) => task,
            None => break,
        };
        match input.into_promise() {
            Ok(task_promise) => {
                let pool = Arc::clone(pool);
                task_promise.subscribe(Box::new(move |outcome| {
                    let settlement = match outcome {
                        Outcome::Fulfilled(v) => Settlement::Fulfilled(v.clone()),
                        Outcome::Rejected(e) => Settlement::Rejected(e.clone()),
                        Outcome::Cancelled => Settlement::Rejected(Error::Cancelled),
                    };
                    task_settled(&pool, index, settlement);
                }));
            }
            Err(e) => task_settled(pool, index, Settlement::Rejected(e)),
        }
    }
}

fn task_settled<T>(pool: &Arc<SettledPool<T>>, index: usize, settlement: Settlement<T>)
where
    T: Clone + Send + 'static,
{
    let done = {
        let mut st = pool.state.lock().expect("pool lock poisoned");
        st.slots[index] = Some(settlement);
        st.running -= 1;
        st.completed += 1;
        if st.completed == st.slots.len() {
            let keys = mem::take(&mut st.keys);
            let slots = mem::take(&mut st.slots);
            Some(
                keys.into_iter()
                    .zip(slots)
                    .map(|(k, s)| (k, s.expect("every task settled")))
                    .collect::<TaskMap<Settlement<T>>>(),
            )
        } else {
            None
        }
    };
    match done {
        Some(map) => pool.resolver.resolve(map),
        None => {
            let pool = Arc::clone(pool);
            pool.rt.clone().next_tick(move || settled_scheduling_pass(&pool));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// batch
////////////////////////////////////////////////////////////////////////////////

struct BatchState<V> {
    chunks: VecDeque<Vec<(TaskKey, TaskInput<V>)>>,
    merged: TaskMap<V>,
}

/// Splits `tasks` into consecutive chunks of `batch_size` (the last chunk
/// may be shorter) and runs the chunks strictly one after another, each
/// through [`concurrent`] with `limit == batch_size`.
///
/// A chunk n+1 starts only once chunk n has fully settled. The first chunk
/// rejection rejects the outer promise and no further chunk is started.
pub fn batch<T, I>(tasks: I, batch_size: usize) -> Promise<TaskMap<T>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    batch_with_limit(tasks, batch_size, batch_size)
}

/// [`batch`] with a per-chunk concurrency cap below the chunk size.
pub fn batch_with_limit<T, I>(tasks: I, batch_size: usize, limit: usize) -> Promise<TaskMap<T>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let (promise, resolver) = Promise::pending();
    if batch_size == 0 {
        resolver.reject(Error::invalid_argument("batch size must be positive"));
        return promise;
    }
    if limit == 0 {
        resolver.reject(Error::invalid_argument("concurrency limit must be positive"));
        return promise;
    }
    if entries.is_empty() {
        resolver.resolve(TaskMap::new());
        return promise;
    }
    let total = entries.len();
    let state = Arc::new(SyncMutex::new(BatchState {
        chunks: split_into_chunks(entries, batch_size),
        merged: TaskMap::with_capacity(total),
    }));
    run_next_chunk(state, resolver, limit);
    promise
}

fn split_into_chunks<V>(
    mut entries: Vec<(TaskKey, TaskInput<V>)>,
    batch_size: usize,
) -> VecDeque<Vec<(TaskKey, TaskInput<V>)>> {
    let mut chunks = VecDeque::new();
    while !entries.is_empty() {
        let rest = entries.split_off(batch_size.min(entries.len()));
        chunks.push_back(entries);
        entries = rest;
    }
    chunks
}

fn run_next_chunk<T>(
    state: Arc<SyncMutex<BatchState<T>>>,
    resolver: Resolver<TaskMap<T>>,
    limit: usize,
) where
    T: Clone + Send + 'static,
{
    let chunk = state.lock().expect("batch state lock poisoned").chunks.pop_front();
    let chunk = match chunk {
        Some(chunk) => chunk,
        None => {
            let merged = mem::take(&mut state.lock().expect("batch state lock poisoned").merged);
            resolver.resolve(merged);
            return;
        }
    };
    concurrent(Tasks::from_entries(chunk), limit).subscribe(Box::new(move |outcome| {
        match outcome {
            Outcome::Fulfilled(map) => {
                {
                    let mut st = state.lock().expect("batch state lock poisoned");
                    for (key, value) in map.clone() {
                        st.merged.insert(key, value);
                    }
                }
                run_next_chunk(state, resolver, limit);
            }
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }
    }));
}

/// [`batch`], except every task outcome is recorded as a [`Settlement`] and
/// the outer promise never rejects. Chunks still run strictly one after
/// another.
pub fn batch_settled<T, I>(tasks: I, batch_size: usize) -> Promise<TaskMap<Settlement<T>>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    batch_settled_with_limit(tasks, batch_size, batch_size)
}

/// [`batch_settled`] with a per-chunk concurrency cap below the chunk size.
pub fn batch_settled_with_limit<T, I>(
    tasks: I,
    batch_size: usize,
    limit: usize,
) -> Promise<TaskMap<Settlement<T>>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let (promise, resolver) = Promise::pending();
    if batch_size == 0 {
        resolver.reject(Error::invalid_argument("batch size must be positive"));
        return promise;
    }
    if limit == 0 {
        resolver.reject(Error::invalid_argument("concurrency limit must be positive"));
        return promise;
    }
    if entries.is_empty() {
        resolver.resolve(TaskMap::new());
        return promise;
    }
    let total = entries.len();
    let state = Arc::new(SyncMutex::new(SettledBatchState {
        chunks: split_into_chunks(entries, batch_size),
        merged: TaskMap::with_capacity(total),
    }));
    run_next_settled_chunk(state, resolver, limit);
    promise
}

struct SettledBatchState<T> {
    chunks: VecDeque<Vec<(TaskKey, TaskInput<T>)>>,
    merged: TaskMap<Settlement<T>>,
}

fn run_next_settled_chunk<T>(
    state: Arc<SyncMutex<SettledBatchState<T>>>,
    resolver: Resolver<TaskMap<Settlement<T>>>,
    limit: usize,
) where
    T: Clone + Send + 'static,
{
    let chunk = state.lock().expect("batch state lock poisoned").chunks.pop_front();
    let chunk = match chunk {
        Some(chunk) => chunk,
        None => {
            let merged = mem::take(&mut state.lock().expect("batch state lock poisoned").merged);
            resolver.resolve(merged);
            return;
        }
    };
    concurrent_settled(Tasks::from_entries(chunk), limit).subscribe(Box::new(move |outcome| {
        match outcome {
            Outcome::Fulfilled(map) => {
                {
                    let mut st = state.lock().expect("batch state lock poisoned");
                    for (key, settlement) in map.clone() {
                        st.merged.insert(key, settlement);
                    }
                }
                run_next_settled_chunk(state, resolver, limit);
            }
            // `concurrent_settled` never rejects and nothing cancels the
            // internal chunk promise; mirror the plain batch anyway.
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }
    }));
}
