//! Cancellable delays backed by event-loop timers.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::runtime::Runtime;

/// Returns a cancellable promise that resolves with `()` once `after` has
/// elapsed.
///
/// A zero delay fires in the timer phase of the next loop iteration. The
/// promise never resolves earlier than `after` on the monotonic clock.
/// Cancelling the promise removes the underlying loop timer, so a cancelled
/// delay costs nothing beyond its construction.
pub fn delay(after: Duration) -> Promise<()> {
    let rt = Runtime::current();
    let (promise, resolver) = Promise::pending();
    let timer = rt.add_timer(after, move || resolver.resolve(()));
    promise.set_cancel_hook(move || rt.cancel_timer(timer));
    promise
}

/// [`delay`] with the duration given in (possibly fractional) seconds.
///
/// Fails with [`Error::InvalidArgument`] when `seconds` is negative, NaN or
/// infinite.
pub fn delay_secs(seconds: f64) -> Result<Promise<()>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::invalid_argument(format!(
            "delay duration must be a finite non-negative number of seconds, got {}",
            seconds,
        )));
    }
    Ok(delay(Duration::from_secs_f64(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    #[test]
    fn zero_delay_resolves_to_unit() {
        assert_eq!(delay(Duration::ZERO).wait().unwrap(), ());
    }

    #[test]
    fn delay_respects_the_deadline() {
        let before = clock::accurate();
        let wanted = Duration::from_millis(25);
        delay(wanted).wait().unwrap();
        assert!(before.elapsed() >= wanted);
    }

    #[test]
    fn cancelled_delay_rejects_waiters() {
        let p = delay(Duration::from_secs(3600));
        p.cancel();
        assert!(p.is_cancelled());
        let err = p.wait().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn cancelled_delay_frees_its_timer() {
        let rt = Runtime::current();
        let p = delay(Duration::from_secs(3600));
        assert!(rt.has_pending_work());
        p.cancel();
        assert!(!rt.has_pending_work());
    }

    #[test]
    fn delay_secs_validates_input() {
        assert!(delay_secs(-1.0).is_err());
        assert!(delay_secs(f64::NAN).is_err());
        assert!(delay_secs(f64::INFINITY).is_err());
        let p = delay_secs(0.0).unwrap();
        p.wait().unwrap();
    }

    #[test]
    fn delays_resolve_in_due_order() {
        let slow = delay(Duration::from_millis(30));
        let fast = delay(Duration::from_millis(5));
        fast.wait().unwrap();
        assert!(slow.is_pending());
        slow.wait().unwrap();
    }
}
