//! End-to-end scenarios driving fibers, combinators, the mutex and
//! cancellation together through a real event loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use spindle::cancel::CancellationTokenSource;
use spindle::error::Error;
use spindle::fiber::{self, Mutex};
use spindle::promise::{Promise, Tasks};
use spindle::timer::delay;
use spindle::{any, concurrent, race};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn concurrent_tasks_with_names_finish_out_of_order_but_report_in_order() {
    let mut tasks = Tasks::new();
    tasks.push_fn("a", || delay(ms(30)).then(|_| Ok("A")));
    tasks.push_fn("b", || delay(ms(10)).then(|_| Ok("B")));
    tasks.push_fn("c", || delay(ms(20)).then(|_| Ok("C")));
    let map = concurrent(tasks, 3).wait().unwrap();
    let entries: Vec<(String, &str)> = map
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("a".to_string(), "A"),
            ("b".to_string(), "B"),
            ("c".to_string(), "C"),
        ],
    );
}

#[test]
fn concurrent_fiber_tasks_observe_the_cap() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = Tasks::new();
    for i in 0..5usize {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        tasks.push_fn(i, move || {
            fiber::spawn(move || {
                let now = in_flight.fetch_add(1, Ordering::Relaxed) + 1;
                peak.fetch_max(now, Ordering::Relaxed);
                fiber::sleep(ms(10));
                in_flight.fetch_sub(1, Ordering::Relaxed);
                Ok(i)
            })
        });
    }
    let map = concurrent(tasks, 2).wait().unwrap();
    assert!(map.is_dense());
    assert_eq!(map.into_values(), vec![0, 1, 2, 3, 4]);
    assert!(peak.load(Ordering::Relaxed) <= 2);
    assert_eq!(in_flight.load(Ordering::Relaxed), 0);
}

#[test]
fn race_prefers_the_fast_rejection() {
    let slow = delay(Duration::from_secs(5)).then(|_| Ok("slow"));
    let fast = Promise::<&str>::rejected(Error::failure("fast"));
    let err = race(vec![slow, fast]).wait().unwrap_err();
    assert_eq!(err.to_string(), "fast");
}

#[test]
fn any_recovers_from_rejections_or_aggregates_them() {
    let tasks: Tasks<&str> = vec![
        Promise::rejected("e1"),
        Promise::resolved("ok"),
        Promise::rejected("e2"),
    ]
    .into();
    assert_eq!(any(tasks).wait().unwrap(), "ok");

    let tasks: Tasks<&str> = vec![
        Promise::<&str>::rejected("e1"),
        Promise::<&str>::rejected("e2"),
    ]
    .into();
    match any(tasks).wait().unwrap_err() {
        Error::Aggregate(reasons) => {
            let msgs: Vec<String> = reasons.iter().map(|e| e.to_string()).collect();
            assert_eq!(msgs, vec!["e1", "e2"]);
        }
        other => panic!("expected Error::Aggregate, got {:?}", other),
    }
}

#[test]
fn mutex_serializes_read_modify_write_sections() {
    let mutex = Arc::new(Mutex::new());
    let counter = Arc::new(StdMutex::new(0usize));
    let log = Arc::new(StdMutex::new(Vec::new()));
    let mut promises = Vec::new();
    for i in 0..5usize {
        let mutex = Arc::clone(&mutex);
        let counter = Arc::clone(&counter);
        let log = Arc::clone(&log);
        promises.push(fiber::spawn(move || {
            let guard = mutex.acquire().wait()?;
            let old = *counter.lock().unwrap();
            // The suspension in the middle is the whole point: without the
            // mutex every fiber would read the same `old`.
            fiber::sleep(ms(10));
            *counter.lock().unwrap() = old + 1;
            log.lock().unwrap().push((i, old));
            guard.release();
            Ok(())
        }));
    }
    for p in promises {
        p.wait().unwrap();
    }
    assert_eq!(*counter.lock().unwrap(), 5);
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 5);
    // Each section observed the value its predecessor wrote.
    for (step, (_fiber, old)) in log.iter().enumerate() {
        assert_eq!(*old, step);
    }
    assert!(!mutex.is_locked());
}

#[test]
fn cancelling_a_source_cancels_all_tracked_work() {
    let source = CancellationTokenSource::new();
    let token = source.token();
    let delays: Vec<_> = (0..3)
        .map(|_| token.track(delay(Duration::from_secs(1))))
        .collect();
    assert_eq!(token.tracked_count(), 3);

    delay(ms(100))
        .then(move |_| {
            source.cancel();
            Ok(())
        })
        .wait()
        .unwrap();

    assert_eq!(token.tracked_count(), 0);
    for p in delays {
        assert!(p.is_cancelled());
        assert!(p.wait().unwrap_err().is_cancelled());
    }
}

#[test]
fn wait_with_a_token_aborts_a_long_wait() {
    let source = CancellationTokenSource::with_timeout(ms(20));
    let token = source.token();
    let p = fiber::spawn(move || {
        let long = delay(Duration::from_secs(3600));
        long.wait_with(&token)
    });
    let err = p.wait().unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn fibers_awaiting_fibers_compose() {
    let total = fiber::spawn(|| {
        let inner_a = fiber::spawn(|| {
            fiber::sleep(ms(5));
            Ok(2)
        });
        let inner_b = fiber::spawn(|| {
            fiber::sleep(ms(10));
            Ok(3)
        });
        Ok(inner_a.wait()? + inner_b.wait()?)
    });
    assert_eq!(total.wait().unwrap(), 5);
}

#[test]
fn timeout_with_a_token_cleans_up_the_loser() {
    let source = CancellationTokenSource::new();
    let token = source.token();
    let slow = token.track(delay(Duration::from_secs(3600)));
    let err = spindle::timeout(slow.clone(), ms(10))
        .unwrap()
        .wait()
        .unwrap_err();
    assert!(err.is_timeout());
    // The operand lost but was not cancelled by `timeout` itself.
    assert!(slow.is_pending());
    source.cancel();
    assert!(slow.is_cancelled());
}
