//! Promise chaining and ordering semantics observed through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use spindle::error::Error;
use spindle::fiber;
use spindle::promise::Promise;
use spindle::runtime::Runtime;
use spindle::timer::delay;
use spindle::{all, all_settled, batch, Tasks};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn awaiting_a_resolved_promise_returns_its_value() {
    for v in [0, 1, -7, i32::MAX] {
        assert_eq!(Promise::resolved(v).wait().unwrap(), v);
    }
    assert_eq!(Promise::resolved("str").wait().unwrap(), "str");
    assert_eq!(delay(Duration::ZERO).wait().unwrap(), ());
}

#[test]
fn continuations_of_one_promise_fire_in_registration_order() {
    let (p, r) = Promise::pending();
    let order = Arc::new(StdMutex::new(Vec::new()));
    let mut derived = Vec::new();
    for i in 0..4 {
        let order = Arc::clone(&order);
        derived.push(p.then(move |_| {
            order.lock().unwrap().push(i);
            Ok(())
        }));
    }
    r.resolve(());
    for d in derived {
        d.wait().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn callbacks_fire_at_most_once_despite_repeated_settles() {
    let (p, r) = Promise::pending();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let d = p.then(move |_| {
        h.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    r.resolve(1);
    r.resolve(2);
    r.reject("ignored");
    p.cancel();
    d.wait().unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn rejection_reasons_flow_through_chains_untouched() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked door");
    let p = Promise::<i32>::rejected(Error::other(io));
    let chained = p.then(|v| Ok(v + 1)).then(|v| Ok(v * 2));
    let err = chained.wait().unwrap_err();
    assert_eq!(err.to_string(), "locked door");
    assert_eq!(err.variant_name(), "Other");
}

#[test]
fn string_rejections_are_normalized_to_failures() {
    let p = Promise::<i32>::rejected("plain string reason");
    let err = p.wait().unwrap_err();
    assert!(matches!(err, Error::Failure(_)));
    assert_eq!(err.to_string(), "plain string reason");
}

#[test]
fn all_collects_fiber_results_in_input_order() {
    let mut tasks = Tasks::new();
    for (name, ms_delay, value) in [("x", 20u64, 1), ("y", 5, 2), ("z", 10, 3)] {
        tasks.push_fn(name, move || {
            fiber::spawn(move || {
                fiber::sleep(ms(ms_delay));
                Ok(value)
            })
        });
    }
    let map = all(tasks).wait().unwrap();
    let keys: Vec<String> = map.keys().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["x", "y", "z"]);
    assert_eq!(map.get("x"), Some(&1));
    assert_eq!(map.get("y"), Some(&2));
    assert_eq!(map.get("z"), Some(&3));
}

#[test]
fn all_settled_smooths_over_fiber_panics() {
    let mut tasks = Tasks::new();
    tasks.push_fn("fine", || fiber::spawn(|| Ok(1)));
    tasks.push_fn("dies", || {
        fiber::spawn(|| -> spindle::Result<i32> { panic!("task exploded") })
    });
    let map = all_settled(tasks).wait().unwrap();
    assert!(map.get("fine").unwrap().is_fulfilled());
    let reason = map.get("dies").unwrap().reason().unwrap().to_string();
    assert!(reason.contains("task exploded"));
}

#[test]
fn batch_preserves_order_across_chunk_boundaries() {
    let mut tasks = Tasks::new();
    for i in 0..7usize {
        tasks.push_fn(i, move || delay(ms(5)).then(move |_| Ok(i * i)));
    }
    let map = batch(tasks, 3).wait().unwrap();
    assert!(map.is_dense());
    assert_eq!(map.into_values(), vec![0, 1, 4, 9, 16, 25, 36]);
}

#[test]
fn sleep_outside_a_fiber_drives_the_loop() {
    let background = fiber::spawn(|| {
        fiber::sleep(ms(10));
        Ok("done")
    });
    // Sleeping on the driver thread must not starve the fiber.
    fiber::sleep(ms(30));
    assert!(background.is_fulfilled());
    assert_eq!(background.wait().unwrap(), "done");
}

#[test]
fn a_settled_then_never_runs_in_the_registering_frame() {
    let p = Promise::resolved(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    let derived = p.then(move |v| {
        r.fetch_add(1, Ordering::Relaxed);
        Ok(v)
    });
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    Runtime::current().run();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    assert_eq!(derived.value(), Some(1));
}

#[test]
fn two_awaits_in_one_fiber_are_sequential() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let p = fiber::spawn(move || {
        o.lock().unwrap().push("before");
        fiber::sleep(ms(5));
        o.lock().unwrap().push("between");
        fiber::sleep(ms(5));
        o.lock().unwrap().push("after");
        Ok(())
    });
    p.wait().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["before", "between", "after"]);
}
