use std::fmt;

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

use crate::{CopyOrBorrow, LockPolicy, Passed};

/// Lock policy for signals whose handlers may modify the signal that is invoking them.
///
/// The connection list is guarded by a mutex that is released before any handler runs. Dispatch
/// works on a snapshot of the connections and on a private copy of the argument, so the
/// argument type must be [`Clone`].
///
/// Handlers may connect, disconnect and fire recursively. A connection removed during dispatch
/// is never invoked after its removal has completed. Connections added during dispatch are
/// first invoked by the next dispatch.
pub struct SafeLock {
    raw: RawMutex,
}

impl Default for SafeLock {
    fn default() -> Self {
        Self { raw: RawMutex::INIT }
    }
}

impl fmt::Debug for SafeLock {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeLock")
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

impl LockPolicy for SafeLock {
    const RELEASE_BEFORE_DISPATCH: bool = true;

    fn acquire(&self) {
        self.raw.lock();
    }

    unsafe fn release(&self) {
        // SAFETY: Forwarding the guarantee from the caller that we hold the lock.
        unsafe { self.raw.unlock() };
    }
}

impl<A: Clone> CopyOrBorrow<A> for SafeLock {
    fn copy_or_borrow(value: &A) -> Passed<'_, A> {
        Passed::Copied(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Locked;

    assert_impl_all!(SafeLock: Send, Sync);

    #[test]
    fn guard_holds_mutex() {
        let lock = SafeLock::default();

        {
            let _guard = Locked::new(&lock);
            assert!(lock.raw.is_locked());
        }

        assert!(!lock.raw.is_locked());
    }
}
