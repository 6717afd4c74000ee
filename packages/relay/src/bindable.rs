use crate::{LockPolicy, NoLock, SafeLock, SpinLock};

/// Marks types that may receive calls from a signal using the lock policy `L`.
///
/// Signals with a thread-safe policy invoke handlers on whichever thread fires them, and drop
/// their weak references to receivers on whichever thread disconnects them, so receivers of
/// such signals must be `Send + Sync`. Signals with [`NoLock`] never leave the thread that owns
/// them and accept any receiver.
///
/// This trait is implemented for every type that satisfies those rules and there is no reason
/// to implement it manually.
///
/// # Safety
///
/// An implementation for policy `L` asserts that values of the type may be invoked and released
/// from any thread that a signal with policy `L` can be used on.
pub unsafe trait Bindable<L: LockPolicy>: 'static {}

// SAFETY: NoLock signals are !Send and !Sync, so they only ever run on the thread that owns them.
unsafe impl<T: 'static> Bindable<NoLock> for T {}

// SAFETY: Send + Sync is exactly what cross-thread invocation and release require.
unsafe impl<T: Send + Sync + 'static> Bindable<SpinLock> for T {}

// SAFETY: Send + Sync is exactly what cross-thread invocation and release require.
unsafe impl<T: Send + Sync + 'static> Bindable<SafeLock> for T {}
