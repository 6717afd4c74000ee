use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{CopyOrBorrow, LockPolicy, Passed};

/// Lock policy that guards the connection list with a spin lock.
///
/// Suited to signals that are fired from several threads but whose handlers are short. The lock
/// is held while handlers run and the argument is passed by reference.
///
/// A handler must not connect to, disconnect from or fire the signal that is invoking it, nor
/// drop the last reference to a subscriber of that signal. The lock is not reentrant, so any of
/// those deadlocks. Use [`SafeLock`][crate::SafeLock] if handlers need to do that.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl LockPolicy for SpinLock {
    const RELEASE_BEFORE_DISPATCH: bool = false;

    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Wait with plain loads so contending threads do not fight over the cache line.
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    unsafe fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<A> CopyOrBorrow<A> for SpinLock {
    fn copy_or_borrow(value: &A) -> Passed<'_, A> {
        Passed::Borrowed(value)
    }
}
