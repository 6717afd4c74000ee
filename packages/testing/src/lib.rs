#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing, benches and examples in the relay workspace.
//!
//! * [`with_watchdog()`] turns a hanging test (e.g. a deadlocked signal) into a failure.
//! * [`CallLog`] records handler invocations from any thread, in order, so tests can assert
//!   on how many times and in what order handlers ran.

mod call_log;

pub use call_log::*;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How long a test may run before the watchdog declares it hung.
const TIMEOUT: Duration = Duration::from_secs(10);

/// Miri is dramatically slower at thread synchronization, so it gets more room.
const MIRI_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `test_fn` on a separate thread and panics if it does not finish in time.
///
/// Dispatch tests that exercise the lock policies can deadlock when something is wrong. Without
/// a watchdog, such a test would hang the whole test run instead of failing.
///
/// Set `MUTATION_TESTING=1` to run the test directly on the calling thread without a timeout,
/// so that mutation testing can observe mutations that cause hangs.
///
/// # Panics
///
/// Panics if the test exceeds the timeout, or re-raises the panic of the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        // If the receiver gave up on us already, nobody cares about the result.
        drop(tx.send(test_fn()));
    });

    let timeout = if cfg!(miri) { MIRI_TIMEOUT } else { TIMEOUT };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            worker.join().expect("test thread finished sending, so it cannot panic anymore");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the {timeout:?} watchdog timeout - likely deadlocked");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match worker.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_returns_result() {
        assert_eq!(with_watchdog(|| "done"), "done");
    }

    #[test]
    #[should_panic(expected = "inner failure")]
    fn watchdog_forwards_panics() {
        with_watchdog(|| panic!("inner failure"));
    }
}
