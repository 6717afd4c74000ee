//! Locking policies that decide how a signal protects its connection list.
//!
//! Every signal and observer is parameterized by one policy type. The policy is a value stored
//! inside the connection list owner, so a policy that needs no synchronization costs no more
//! than a flag.

use std::fmt;
use std::ops::Deref;

mod no_lock;
mod safe_lock;
mod spin_lock;

pub use no_lock::*;
pub use safe_lock::*;
pub use spin_lock::*;

/// Restricts lock policies to the ones defined in this crate.
///
/// Connection lists are only as thread-safe as their policy, so a policy defined elsewhere
/// could hand out unsynchronized access to them.
trait Sealed {}

impl Sealed for NoLock {}
impl Sealed for SpinLock {}
impl Sealed for SafeLock {}

/// Restricts argument passing rules to the ones defined in this crate.
trait SealedFor<A> {}

impl<A> SealedFor<A> for NoLock {}
impl<A> SealedFor<A> for SpinLock {}
impl<A: Clone> SealedFor<A> for SafeLock {}

/// Mutual exclusion strategy for a connection list.
///
/// Implemented by [`NoLock`], [`SpinLock`] and [`SafeLock`]. This is a sealed trait. It is
/// public so that it can appear in bounds, but the rest of the crate relies on the exact
/// guarantees each policy provides, so no other type can implement it.
///
/// ```rust,compile_fail
/// use relay::LockPolicy;
///
/// #[derive(Debug, Default)]
/// struct NotALock;
///
/// impl LockPolicy for NotALock {
///     const RELEASE_BEFORE_DISPATCH: bool = false;
///
///     fn acquire(&self) {}
///
///     unsafe fn release(&self) {}
/// }
/// ```
#[expect(private_bounds, reason = "intentional - sealed trait")]
pub trait LockPolicy: Sealed + Default + fmt::Debug + 'static {
    /// Whether the lock is released before handlers are invoked.
    ///
    /// If `true`, dispatch works on a snapshot of the connection list and handlers may freely
    /// connect and disconnect on the signal that is invoking them. If `false`, the lock is held
    /// for the whole dispatch.
    const RELEASE_BEFORE_DISPATCH: bool;

    /// Acquires the lock, blocking (or panicking, for [`NoLock`]) if it is already held.
    fn acquire(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The caller must have acquired the lock with [`acquire()`][Self::acquire] and not yet
    /// released it.
    unsafe fn release(&self);
}

/// Decides whether a dispatched argument is passed through by reference or copied first.
///
/// Policies that release the lock before dispatch copy the argument, so handlers never observe a
/// value that the firing thread could mutate while they run.
///
/// This is a sealed trait, implemented only by the policies in this crate.
///
/// ```rust,compile_fail
/// use relay::{CopyOrBorrow, Passed, SafeLock};
///
/// struct NotClone;
///
/// impl CopyOrBorrow<NotClone> for SafeLock {
///     fn copy_or_borrow(value: &NotClone) -> Passed<'_, NotClone> {
///         Passed::Borrowed(value)
///     }
/// }
/// ```
#[expect(private_bounds, reason = "intentional - sealed trait")]
pub trait CopyOrBorrow<A>: LockPolicy + SealedFor<A> {
    /// Produces the form in which `value` is handed to the handlers.
    fn copy_or_borrow(value: &A) -> Passed<'_, A>;
}

/// An argument as handed to the handlers, either borrowed from the caller or copied.
#[derive(Debug)]
#[expect(
    clippy::exhaustive_enums,
    reason = "an argument is either borrowed or copied, there is no third way"
)]
pub enum Passed<'a, A> {
    /// The caller's value, passed through unchanged.
    Borrowed(&'a A),

    /// A private copy of the caller's value.
    Copied(A),
}

impl<A> Deref for Passed<'_, A> {
    type Target = A;

    fn deref(&self) -> &A {
        match self {
            Passed::Borrowed(value) => value,
            Passed::Copied(value) => value,
        }
    }
}

/// Holds a policy lock until dropped, including while unwinding out of a panicking handler.
pub(crate) struct Locked<'a, L: LockPolicy> {
    lock: &'a L,
}

impl<'a, L: LockPolicy> Locked<'a, L> {
    pub(crate) fn new(lock: &'a L) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl<L: LockPolicy> Drop for Locked<'_, L> {
    fn drop(&mut self) {
        // SAFETY: We acquired the lock in `new()` and only release it here, once.
        unsafe { self.lock.release() };
    }
}
