use std::cell::Cell;

use crate::{CopyOrBorrow, LockPolicy, Passed};

/// Lock policy for signals used from a single thread.
///
/// No synchronization happens. Signals and observers using this policy are neither `Send` nor
/// `Sync`, so the compiler rejects any attempt to share them across threads.
///
/// Handlers run while the connection list is in use, so a handler must not connect to,
/// disconnect from or fire the signal that is invoking it, nor drop the last reference to a
/// subscriber of that signal. Doing so is detected and panics.
/// Use [`SafeLock`][crate::SafeLock] if handlers need to do that.
#[derive(Debug, Default)]
pub struct NoLock {
    held: Cell<bool>,
}

impl LockPolicy for NoLock {
    const RELEASE_BEFORE_DISPATCH: bool = false;

    fn acquire(&self) {
        assert!(
            !self.held.replace(true),
            "a single-threaded signal or observer was re-entered while in use; handlers that modify or fire their own signal need SafeLock"
        );
    }

    unsafe fn release(&self) {
        self.held.set(false);
    }
}

impl<A> CopyOrBorrow<A> for NoLock {
    fn copy_or_borrow(value: &A) -> Passed<'_, A> {
        Passed::Borrowed(value)
    }
}
