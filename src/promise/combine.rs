//! Collection combinators: settle many promises as one.
//!
//! All combinators accept anything convertible to [`Tasks`] and preserve the
//! input key order in their results (see [`TaskMap`]). Lazy tasks are
//! invoked exactly once, at registration; their returned promises are
//! adopted.

use std::mem;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::promise::task::{Settlement, TaskKey, TaskMap, Tasks};
use crate::promise::{Outcome, Promise, Resolver};
use crate::timer;

////////////////////////////////////////////////////////////////////////////////
// all
////////////////////////////////////////////////////////////////////////////////

struct Gather<T> {
    keys: Vec<TaskKey>,
    values: Vec<Option<T>>,
    completed: usize,
}

/// Resolves with the map of all values, in input order, once every task has
/// fulfilled. Rejects with the first rejection; settlements after that are
/// ignored (but the remaining tasks are not cancelled).
///
/// An empty input resolves with an empty map.
pub fn all<T, I>(tasks: I) -> Promise<TaskMap<T>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let total = entries.len();
    let (promise, resolver) = Promise::pending();
    if total == 0 {
        resolver.resolve(TaskMap::new());
        return promise;
    }

    let gather = Arc::new(SyncMutex::new(Gather {
        keys: entries.iter().map(|(k, _)| k.clone()).collect(),
        values: (0..total).map(|_| None).collect(),
        completed: 0,
    }));

    for (index, (_, input)) in entries.into_iter().enumerate() {
        let task_promise = match input.into_promise() {
            Ok(p) => p,
            Err(e) => {
                // Construction failures reject like any other task failure;
                // the remaining tasks are still invoked.
                resolver.reject(e);
                continue;
            }
        };
        let gather = Arc::clone(&gather);
        let resolver = resolver.clone();
        task_promise.subscribe(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => {
                let done = {
                    let mut g = gather.lock().expect("gather lock poisoned");
                    g.values[index] = Some(v.clone());
                    g.completed += 1;
                    if g.completed == g.values.len() {
                        let keys = mem::take(&mut g.keys);
                        let values = mem::take(&mut g.values);
                        Some(
                            keys.into_iter()
                                .zip(values)
                                .map(|(k, v)| (k, v.expect("every slot fulfilled")))
                                .collect::<TaskMap<T>>(),
                        )
                    } else {
                        None
                    }
                };
                if let Some(map) = done {
                    resolver.resolve(map);
                }
            }
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }));
    }
    promise
}

////////////////////////////////////////////////////////////////////////////////
// all_settled
////////////////////////////////////////////////////////////////////////////////

struct GatherSettled<T> {
    keys: Vec<TaskKey>,
    slots: Vec<Option<Settlement<T>>>,
    completed: usize,
}

fn record_settlement<T>(
    gather: &Arc<SyncMutex<GatherSettled<T>>>,
    resolver: &Resolver<TaskMap<Settlement<T>>>,
    index: usize,
    settlement: Settlement<T>,
) where
    T: Clone + Send + 'static,
{
    let done = {
        let mut g = gather.lock().expect("gather lock poisoned");
        g.slots[index] = Some(settlement);
        g.completed += 1;
        if g.completed == g.slots.len() {
            let keys = mem::take(&mut g.keys);
            let slots = mem::take(&mut g.slots);
            Some(
                keys.into_iter()
                    .zip(slots)
                    .map(|(k, s)| (k, s.expect("every slot settled")))
                    .collect::<TaskMap<Settlement<T>>>(),
            )
        } else {
            None
        }
    };
    if let Some(map) = done {
        resolver.resolve(map);
    }
}

/// Always resolves, with a map of [`Settlement`] records preserving the
/// input keys. A cancelled input is recorded as rejected with
/// [`Error::Cancelled`]; so is a lazy task whose construction failed.
pub fn all_settled<T, I>(tasks: I) -> Promise<TaskMap<Settlement<T>>>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let total = entries.len();
    let (promise, resolver) = Promise::pending();
    if total == 0 {
        resolver.resolve(TaskMap::new());
        return promise;
    }

    let gather = Arc::new(SyncMutex::new(GatherSettled {
        keys: entries.iter().map(|(k, _)| k.clone()).collect(),
        slots: (0..total).map(|_| None).collect(),
        completed: 0,
    }));

    for (index, (_, input)) in entries.into_iter().enumerate() {
        match input.into_promise() {
            Ok(task_promise) => {
                let gather = Arc::clone(&gather);
                let resolver = resolver.clone();
                task_promise.subscribe(Box::new(move |outcome| {
                    let settlement = match outcome {
                        Outcome::Fulfilled(v) => Settlement::Fulfilled(v.clone()),
                        Outcome::Rejected(e) => Settlement::Rejected(e.clone()),
                        Outcome::Cancelled => Settlement::Rejected(Error::Cancelled),
                    };
                    record_settlement(&gather, &resolver, index, settlement);
                }));
            }
            Err(e) => record_settlement(&gather, &resolver, index, Settlement::Rejected(e)),
        }
    }
    promise
}

////////////////////////////////////////////////////////////////////////////////
// race
////////////////////////////////////////////////////////////////////////////////

/// Settles with the first input to settle, adopting its value or reason (a
/// cancelled winner surfaces as an [`Error::Cancelled`] rejection).
///
/// An empty input rejects with [`Error::InvalidArgument`]: it could never
/// settle.
pub fn race<T, I>(tasks: I) -> Promise<T>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let (promise, resolver) = Promise::pending();
    if entries.is_empty() {
        resolver.reject(Error::invalid_argument("race on an empty input never settles"));
        return promise;
    }
    for (_, input) in entries {
        let task_promise = match input.into_promise() {
            Ok(p) => p,
            Err(e) => {
                // Construction failures settle the race like any other task
                // failure; the remaining tasks are still invoked.
                resolver.reject(e);
                continue;
            }
        };
        let resolver = resolver.clone();
        task_promise.subscribe(Box::new(move |outcome| match outcome {
            Outcome::Fulfilled(v) => resolver.resolve(v.clone()),
            Outcome::Rejected(e) => resolver.reject(e.clone()),
            Outcome::Cancelled => resolver.reject(Error::Cancelled),
        }));
    }
    promise
}

////////////////////////////////////////////////////////////////////////////////
// any
////////////////////////////////////////////////////////////////////////////////

struct AnyState {
    reasons: Vec<Option<Error>>,
    rejected: usize,
}

/// Resolves with the value of the first fulfillment. If every input
/// rejects (or is cancelled), rejects with [`Error::Aggregate`] carrying
/// the reasons in input order.
///
/// An empty input rejects with [`Error::InvalidArgument`].
pub fn any<T, I>(tasks: I) -> Promise<T>
where
    T: Clone + Send + 'static,
    I: Into<Tasks<T>>,
{
    let entries = tasks.into().into_entries();
    let total = entries.len();
    let (promise, resolver) = Promise::pending();
    if total == 0 {
        resolver.reject(Error::invalid_argument("any on an empty input never settles"));
        return promise;
    }

    let state = Arc::new(SyncMutex::new(AnyState {
        reasons: (0..total).map(|_| None).collect(),
        rejected: 0,
    }));

    let register_rejection = |state: &Arc<SyncMutex<AnyState>>,
                              resolver: &Resolver<T>,
                              index: usize,
                              reason: Error| {
        let all_failed = {
            let mut st = state.lock().expect("any state lock poisoned");
            st.reasons[index] = Some(reason);
            st.rejected += 1;
            if st.rejected == st.reasons.len() {
                let reasons = mem::take(&mut st.reasons);
                Some(
                    reasons
                        .into_iter()
                        .map(|r| r.expect("every slot rejected"))
                        .collect::<Vec<_>>(),
                )
            } else {
                None
            }
        };
        if let Some(reasons) = all_failed {
            resolver.reject(Error::Aggregate(reasons));
        }
    };

    for (index, (_, input)) in entries.into_iter().enumerate() {
        match input.into_promise() {
            Ok(task_promise) => {
                let state = Arc::clone(&state);
                let resolver = resolver.clone();
                task_promise.subscribe(Box::new(move |outcome| match outcome {
                    Outcome::Fulfilled(v) => resolver.resolve(v.clone()),
                    Outcome::Rejected(e) => {
                        register_rejection(&state, &resolver, index, e.clone())
                    }
                    Outcome::Cancelled => {
                        register_rejection(&state, &resolver, index, Error::Cancelled)
                    }
                }));
            }
            Err(e) => register_rejection(&state, &resolver, index, e),
        }
    }
    promise
}

////////////////////////////////////////////////////////////////////////////////
// timeout
////////////////////////////////////////////////////////////////////////////////

/// Races `operand` against an internal delay that rejects with
/// [`Error::Timeout`]. The operand is not cancelled when it loses; couple
/// it with a cancellation token if its resources must be reclaimed.
///
/// A zero `after` fails right here with [`Error::InvalidArgument`], not
/// through the returned promise.
pub fn timeout<T>(operand: Promise<T>, after: Duration) -> Result<Promise<T>>
where
    T: Clone + Send + 'static,
{
    if after.is_zero() {
        return Err(Error::invalid_argument("timeout duration must be positive"));
    }
    let (promise, resolver) = Promise::pending();
    let deadline = timer::delay(after);
    // A caller cancelling the outer promise must free the internal timer,
    // the same way cancelling a bare delay does. The operand is left alone.
    promise.set_cancel_hook({
        let deadline = deadline.clone();
        move || deadline.cancel()
    });
    {
        let resolver = resolver.clone();
        let deadline = deadline.clone();
        operand.subscribe(Box::new(move |outcome| {
            // The operand won; the internal timer is no longer needed.
            deadline.cancel();
            match outcome {
                Outcome::Fulfilled(v) => resolver.resolve(v.clone()),
                Outcome::Rejected(e) => resolver.reject(e.clone()),
                Outcome::Cancelled => resolver.reject(Error::Cancelled),
            }
        }));
    }
    deadline.subscribe(Box::new(move |outcome| {
        if matches!(outcome, Outcome::Fulfilled(_)) {
            resolver.reject(Error::Timeout { after });
        }
    }));
    Ok(promise)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::task::TaskKey;
    use crate::timer::delay;

    fn named_delayed(name: &'static str, ms: u64) -> (&'static str, Promise<&'static str>) {
        (name, delay(Duration::from_millis(ms)).then(move |_| Ok(name)))
    }

    #[test]
    fn all_preserves_key_order_regardless_of_timing() {
        let tasks: Tasks<&str> = vec![
            named_delayed("a", 30),
            named_delayed("b", 10),
            named_delayed("c", 20),
        ]
        .into();
        let map = all(tasks).wait().unwrap();
        let keys: Vec<String> = map.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(map.get("a"), Some(&"a"));
        assert_eq!(map.get("b"), Some(&"b"));
        assert_eq!(map.get("c"), Some(&"c"));
    }

    #[test]
    fn all_rejects_with_the_first_rejection() {
        let tasks: Tasks<i32> = vec![
            delay(Duration::from_millis(30)).then(|_| Ok(1)),
            delay(Duration::from_millis(5)).then(|_| Err::<i32, _>(Error::failure("first"))),
            delay(Duration::from_millis(10)).then(|_| Err::<i32, _>(Error::failure("second"))),
        ]
        .into();
        let err = all(tasks).wait().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn all_keeps_invoking_tasks_after_a_construction_failure() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let later_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&later_ran);
        let mut tasks = Tasks::new();
        tasks.push_try_fn("broken", || Err::<Promise<i32>, _>(Error::failure("no task")));
        tasks.push_fn("later", move || {
            flag.store(true, Ordering::Relaxed);
            Promise::resolved(1)
        });
        let err = all(tasks).wait().unwrap_err();
        assert_eq!(err.to_string(), "no task");
        // The failure rejected the result, but the rest of the list still ran.
        assert!(later_ran.load(Ordering::Relaxed));
    }

    #[test]
    fn all_on_empty_input_resolves_empty() {
        let map = all(Tasks::<i32>::new()).wait().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn all_with_dense_keys_collapses_to_vec() {
        let tasks: Tasks<i32> = vec![Promise::resolved(1), Promise::resolved(2)].into();
        let map = all(tasks).wait().unwrap();
        assert!(map.is_dense());
        assert_eq!(map.into_values(), vec![1, 2]);
    }

    #[test]
    fn all_settled_records_every_outcome() {
        let mut tasks = Tasks::new();
        tasks.push("ok", Promise::resolved(1));
        tasks.push("bad", Promise::rejected("broken"));
        let cancelled = Promise::<i32>::pending().0;
        cancelled.cancel();
        tasks.push("gone", cancelled);
        tasks.push_try_fn("unbuilt", || Err(Error::failure("constructor failed")));

        let map = all_settled(tasks).wait().unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map.get("ok").unwrap().value(), Some(&1));
        assert_eq!(map.get("bad").unwrap().reason().unwrap().to_string(), "broken");
        assert!(map.get("gone").unwrap().reason().unwrap().is_cancelled());
        assert_eq!(
            map.get("unbuilt").unwrap().reason().unwrap().to_string(),
            "constructor failed",
        );
    }

    #[test]
    fn race_adopts_the_first_settlement() {
        let slow = delay(Duration::from_secs(5)).then(|_| Ok("slow"));
        let fast = Promise::<&str>::rejected(Error::failure("fast"));
        let err = race(vec![slow, fast]).wait().unwrap_err();
        assert_eq!(err.to_string(), "fast");

        let winner = delay(Duration::from_millis(5)).then(|_| Ok("winner"));
        let loser = delay(Duration::from_millis(50)).then(|_| Ok("loser"));
        assert_eq!(race(vec![winner, loser]).wait().unwrap(), "winner");
    }

    #[test]
    fn race_keeps_invoking_tasks_after_a_construction_failure() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let later_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&later_ran);
        let mut tasks = Tasks::new();
        tasks.push_try_fn("broken", || Err::<Promise<i32>, _>(Error::failure("lost at start")));
        tasks.push_fn("later", move || {
            flag.store(true, Ordering::Relaxed);
            Promise::resolved(2)
        });
        let err = race(tasks).wait().unwrap_err();
        assert_eq!(err.to_string(), "lost at start");
        assert!(later_ran.load(Ordering::Relaxed));
    }

    #[test]
    fn race_on_empty_input_is_invalid() {
        let err = race(Tasks::<i32>::new()).wait().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn any_resolves_with_the_first_fulfillment() {
        let tasks: Tasks<&str> = vec![
            Promise::rejected("e1"),
            Promise::resolved("ok"),
            Promise::rejected("e2"),
        ]
        .into();
        assert_eq!(any(tasks).wait().unwrap(), "ok");
    }

    #[test]
    fn any_aggregates_reasons_in_input_order() {
        let tasks: Tasks<i32> = vec![
            delay(Duration::from_millis(20)).then(|_| Err::<i32, _>(Error::failure("e1"))),
            delay(Duration::from_millis(5)).then(|_| Err::<i32, _>(Error::failure("e2"))),
        ]
        .into();
        let err = any(tasks).wait().unwrap_err();
        match err {
            Error::Aggregate(reasons) => {
                let msgs: Vec<String> = reasons.iter().map(|e| e.to_string()).collect();
                assert_eq!(msgs, vec!["e1", "e2"]);
            }
            other => panic!("expected Aggregate, got {:?}", other),
        }
    }

    #[test]
    fn any_on_empty_input_is_invalid() {
        let err = any(Tasks::<i32>::new()).wait().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn timeout_rejects_when_the_deadline_wins() {
        let (slow, _keep) = Promise::<i32>::pending();
        let err = timeout(slow, Duration::from_millis(10)).unwrap().wait().unwrap_err();
        assert!(matches!(err, Error::Timeout { after } if after == Duration::from_millis(10)));
    }

    #[test]
    fn timeout_passes_the_operand_through() {
        let fast = delay(Duration::from_millis(5)).then(|_| Ok(99));
        let v = timeout(fast, Duration::from_secs(10)).unwrap().wait().unwrap();
        assert_eq!(v, 99);
    }

    #[test]
    fn timeout_frees_its_timer_when_the_operand_wins() {
        let rt = crate::runtime::Runtime::current();
        let p = timeout(Promise::resolved(1), Duration::from_secs(3600)).unwrap();
        assert_eq!(p.wait().unwrap(), 1);
        assert!(!rt.has_pending_work());
    }

    #[test]
    fn cancelling_the_outer_timeout_frees_the_internal_timer() {
        let rt = crate::runtime::Runtime::current();
        let (operand, _keep) = Promise::<i32>::pending();
        let p = timeout(operand.clone(), Duration::from_secs(3600)).unwrap();
        assert!(rt.has_pending_work());
        p.cancel();
        assert!(p.wait().unwrap_err().is_cancelled());
        assert!(!rt.has_pending_work());
        // Only the internal deadline was reclaimed, not the operand.
        assert!(operand.is_pending());
    }

    #[test]
    fn timeout_of_zero_fails_at_call_time() {
        let err = timeout(Promise::resolved(1), Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn results_keep_integer_keys_intact() {
        let mut tasks = Tasks::new();
        tasks.push(7usize, Promise::resolved("seven"));
        tasks.push(0usize, Promise::resolved("zero"));
        let map = all(tasks).wait().unwrap();
        assert!(!map.is_dense());
        assert_eq!(map.get(7usize), Some(&"seven"));
        assert_eq!(map.get(0usize), Some(&"zero"));
        assert_eq!(map.keys().next(), Some(&TaskKey::Index(7)));
    }
}
