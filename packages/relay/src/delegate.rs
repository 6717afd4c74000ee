use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr;
use std::sync::{Arc, Weak};

use crate::{Bindable, LockPolicy, NoLock};

/// Entry token used for closure receivers. A closure has exactly one way to be called, so the
/// receiver address alone identifies it.
const CLOSURE_ENTRY: usize = usize::MAX;

/// Identity of a bound callable: the address of its receiver plus the address of the code that
/// runs on it.
///
/// Free functions have a receiver token of zero. Two delegates with equal keys are considered
/// the same connection by [`Signal`][crate::Signal], regardless of which delegate value they came
/// from.
///
/// A key holds no reference to the receiver. Receiver addresses cannot be reused while any
/// connection for that receiver is still registered, so a key never aliases a live connection of
/// an unrelated receiver.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DelegateKey {
    receiver: usize,
    entry: usize,
}

impl DelegateKey {
    /// Address of the receiver, or zero for a free function.
    #[must_use]
    pub fn receiver_token(&self) -> usize {
        self.receiver
    }

    /// Address of the code that is invoked.
    #[must_use]
    pub fn entry_token(&self) -> usize {
        self.entry
    }

    /// Whether this key identifies a free function, which has no receiver.
    #[must_use]
    pub fn is_free_function(&self) -> bool {
        self.receiver == 0
    }
}

/// Type-erased operations on a receiver stored as a raw `Weak<T>` pointer.
///
/// Modeled on `RawWakerVTable`: the delegate keeps a thin pointer and a reference to a static
/// table of functions that know the concrete type behind it.
pub(crate) struct ReceiverVTable {
    /// Adds one weak reference.
    retain: unsafe fn(*const ()),

    /// Drops one weak reference.
    release: unsafe fn(*const ()),

    /// Takes one strong reference if the receiver is still alive.
    upgrade: unsafe fn(*const ()) -> bool,

    /// Drops one strong reference taken by `upgrade`.
    release_strong: unsafe fn(*const ()),
}

static NO_RECEIVER: ReceiverVTable = ReceiverVTable {
    retain: no_op,
    release: no_op,
    upgrade: always_alive,
    release_strong: no_op,
};

fn no_op(_receiver: *const ()) {}

fn always_alive(_receiver: *const ()) -> bool {
    true
}

struct WeakReceiver<T>(PhantomData<T>);

impl<T> WeakReceiver<T> {
    const VTABLE: &'static ReceiverVTable = &ReceiverVTable {
        retain: retain_weak::<T>,
        release: release_weak::<T>,
        upgrade: upgrade_weak::<T>,
        release_strong: release_strong::<T>,
    };
}

/// # Safety
///
/// `receiver` must come from `Weak::<T>::into_raw()` and the caller must own that reference.
unsafe fn retain_weak<T>(receiver: *const ()) {
    // SAFETY: Forwarding the guarantees from the caller. ManuallyDrop keeps our own reference.
    let weak = ManuallyDrop::new(unsafe { Weak::from_raw(receiver.cast::<T>()) });
    mem::forget(Weak::clone(&weak));
}

/// # Safety
///
/// `receiver` must come from `Weak::<T>::into_raw()` and the caller must own that reference,
/// which is consumed.
unsafe fn release_weak<T>(receiver: *const ()) {
    // SAFETY: Forwarding the guarantees from the caller.
    drop(unsafe { Weak::from_raw(receiver.cast::<T>()) });
}

/// # Safety
///
/// `receiver` must come from `Weak::<T>::into_raw()` and the caller must own that reference.
unsafe fn upgrade_weak<T>(receiver: *const ()) -> bool {
    // SAFETY: Forwarding the guarantees from the caller. ManuallyDrop keeps our own reference.
    let weak = ManuallyDrop::new(unsafe { Weak::from_raw(receiver.cast::<T>()) });

    // The strong reference is leaked here and given back in `release_strong()`.
    weak.upgrade().map(Arc::into_raw).is_some()
}

/// # Safety
///
/// The caller must own a strong reference leaked by `upgrade_weak::<T>()` for this receiver.
unsafe fn release_strong<T>(receiver: *const ()) {
    // SAFETY: For sized `T`, `Weak::into_raw()` and `Arc::into_raw()` yield the same pointer,
    // and the caller guarantees there is a leaked strong reference for us to give back.
    unsafe {
        Arc::decrement_strong_count(receiver.cast::<T>());
    }
}

type Invoke<A, R> = unsafe fn(receiver: *const (), entry: *const (), args: &A) -> R;

/// # Safety
///
/// `entry` must have been created from a `fn(&A) -> R`.
unsafe fn invoke_free<A, R>(_receiver: *const (), entry: *const (), args: &A) -> R {
    // SAFETY: Forwarding the guarantees from the caller. Function pointers and data pointers
    // have the same size on every platform we support.
    let function = unsafe { mem::transmute_copy::<*const (), fn(&A) -> R>(&entry) };
    function(args)
}

/// # Safety
///
/// `entry` must have been created from a `fn(&T, &A) -> R` and the caller must hold a strong
/// reference to the `T` behind `receiver`.
unsafe fn invoke_method<T, A, R>(receiver: *const (), entry: *const (), args: &A) -> R {
    // SAFETY: Forwarding the guarantees from the caller.
    let method = unsafe { mem::transmute_copy::<*const (), fn(&T, &A) -> R>(&entry) };

    // SAFETY: The caller holds a strong reference, so the receiver is alive.
    method(unsafe { &*receiver.cast::<T>() }, args)
}

/// # Safety
///
/// The caller must hold a strong reference to the `F` behind `receiver`.
unsafe fn invoke_closure<F, A, R>(receiver: *const (), _entry: *const (), args: &A) -> R
where
    F: Fn(&A) -> R,
{
    // SAFETY: The caller holds a strong reference, so the closure is alive.
    let handler = unsafe { &*receiver.cast::<F>() };
    handler(args)
}

/// A delegate with its argument and return types erased, as stored in a connection record.
///
/// Owns one weak reference to the receiver, if there is one.
pub(crate) struct RawDelegate {
    key: DelegateKey,
    receiver: *const (),
    entry: *const (),
    invoke: *const (),
    vtable: &'static ReceiverVTable,
}

impl RawDelegate {
    pub(crate) fn key(&self) -> DelegateKey {
        self.key
    }

    /// Takes a strong reference to the receiver, keeping it alive until the returned value is
    /// dropped. Returns `None` if the receiver has already been destroyed.
    pub(crate) fn upgrade(&self) -> Option<StrongReceiver> {
        // SAFETY: The vtable matches the receiver and we own a weak reference to it.
        let alive = unsafe { (self.vtable.upgrade)(self.receiver) };

        alive.then(|| StrongReceiver {
            receiver: self.receiver,
            vtable: self.vtable,
        })
    }

    /// # Safety
    ///
    /// `A` and `R` must be the exact types the delegate was created with, and `alive` must be a
    /// strong reference obtained from this delegate.
    pub(crate) unsafe fn invoke<A, R>(&self, alive: &StrongReceiver, args: &A) -> R {
        debug_assert!(ptr::eq(alive.receiver, self.receiver));

        // SAFETY: The caller guarantees the signature matches the one we erased.
        let invoke = unsafe { mem::transmute_copy::<*const (), Invoke<A, R>>(&self.invoke) };

        // SAFETY: The entry matches the trampoline (they were stored together) and the caller
        // holds the receiver alive.
        unsafe { invoke(self.receiver, self.entry, args) }
    }
}

impl Clone for RawDelegate {
    fn clone(&self) -> Self {
        // SAFETY: The vtable matches the receiver and we own a weak reference to it.
        unsafe { (self.vtable.retain)(self.receiver) };

        Self {
            key: self.key,
            receiver: self.receiver,
            entry: self.entry,
            invoke: self.invoke,
            vtable: self.vtable,
        }
    }
}

impl Drop for RawDelegate {
    fn drop(&mut self) {
        // SAFETY: The vtable matches the receiver and we give back the weak reference we own.
        unsafe { (self.vtable.release)(self.receiver) };
    }
}

impl fmt::Debug for RawDelegate {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDelegate").field("key", &self.key).finish()
    }
}

/// One strong reference to a receiver, released on drop.
pub(crate) struct StrongReceiver {
    receiver: *const (),
    vtable: &'static ReceiverVTable,
}

impl Drop for StrongReceiver {
    fn drop(&mut self) {
        // SAFETY: We were created by a successful upgrade through this same vtable.
        unsafe { (self.vtable.release_strong)(self.receiver) };
    }
}

/// A bound callable taking `&A` and returning `R`: either a free function, a method on a
/// shared receiver or a shared closure.
///
/// The delegate refers to its receiver weakly. It never keeps the receiver alive on its own and
/// [`call()`][Self::call] returns `None` once the receiver is gone.
///
/// Equality and hashing use the [`DelegateKey`] only, so two delegates created separately from
/// the same receiver and method compare equal.
///
/// The lock policy `L` is that of the signals the delegate may be connected to. It decides which
/// receivers may be bound, see [`Bindable`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use relay::Delegate;
///
/// struct Scale(u32);
///
/// impl Scale {
///     fn apply(&self, value: &u32) -> u32 {
///         self.0 * value
///     }
/// }
///
/// let scale = Arc::new(Scale(3));
/// let delegate: Delegate<u32, u32> = Delegate::from_method(&scale, Scale::apply);
/// assert_eq!(delegate.call(&5), Some(15));
///
/// drop(scale);
/// assert_eq!(delegate.call(&5), None);
/// ```
pub struct Delegate<A, R = (), L: LockPolicy = NoLock> {
    raw: RawDelegate,

    _signature: PhantomData<(fn(&A) -> R, fn() -> L)>,
}

impl<A, R, L: LockPolicy> Delegate<A, R, L> {
    /// Binds a free function.
    #[must_use]
    pub fn from_fn(function: fn(&A) -> R) -> Self {
        let entry = function as *const ();

        Self::from_raw_parts(
            DelegateKey {
                receiver: 0,
                entry: entry.addr(),
            },
            ptr::null(),
            entry,
            invoke_free::<A, R> as Invoke<A, R>,
            &NO_RECEIVER,
        )
    }

    /// Binds a method to a shared receiver. The delegate keeps only a weak reference.
    #[must_use]
    pub fn from_method<T>(receiver: &Arc<T>, method: fn(&T, &A) -> R) -> Self
    where
        T: Bindable<L>,
    {
        let entry = method as *const ();
        let receiver = Weak::into_raw(Arc::downgrade(receiver)).cast::<()>();

        Self::from_raw_parts(
            DelegateKey {
                receiver: receiver.addr(),
                entry: entry.addr(),
            },
            receiver,
            entry,
            invoke_method::<T, A, R> as Invoke<A, R>,
            WeakReceiver::<T>::VTABLE,
        )
    }

    /// Binds a shared closure. The delegate keeps only a weak reference.
    #[must_use]
    pub fn from_closure<F>(handler: &Arc<F>) -> Self
    where
        F: Fn(&A) -> R + Bindable<L>,
    {
        let receiver = Weak::into_raw(Arc::downgrade(handler)).cast::<()>();

        Self::from_raw_parts(
            DelegateKey {
                receiver: receiver.addr(),
                entry: CLOSURE_ENTRY,
            },
            receiver,
            ptr::null(),
            invoke_closure::<F, A, R> as Invoke<A, R>,
            WeakReceiver::<F>::VTABLE,
        )
    }

    fn from_raw_parts(
        key: DelegateKey,
        receiver: *const (),
        entry: *const (),
        invoke: Invoke<A, R>,
        vtable: &'static ReceiverVTable,
    ) -> Self {
        Self {
            raw: RawDelegate {
                key,
                receiver,
                entry,
                invoke: invoke as *const (),
                vtable,
            },
            _signature: PhantomData,
        }
    }

    /// The identity of this delegate.
    #[must_use]
    pub fn key(&self) -> DelegateKey {
        self.raw.key
    }

    /// Invokes the bound callable, or returns `None` if the receiver no longer exists.
    pub fn call(&self, args: &A) -> Option<R> {
        let alive = self.raw.upgrade()?;

        // SAFETY: The raw delegate was created by this type with the same `A` and `R`, and
        // `alive` came from it.
        Some(unsafe { self.raw.invoke::<A, R>(&alive, args) })
    }

    pub(crate) fn into_raw(self) -> RawDelegate {
        self.raw
    }
}

/// The key a closure connection receives, without creating a delegate.
pub(crate) fn closure_key<F>(handler: &Arc<F>) -> DelegateKey {
    DelegateKey {
        receiver: Arc::as_ptr(handler).addr(),
        entry: CLOSURE_ENTRY,
    }
}

/// The key a method connection receives, without creating a delegate.
pub(crate) fn method_key<T, A, R>(receiver: &Arc<T>, method: fn(&T, &A) -> R) -> DelegateKey {
    DelegateKey {
        receiver: Arc::as_ptr(receiver).addr(),
        entry: (method as *const ()).addr(),
    }
}

/// The key a free function connection receives.
pub(crate) fn fn_key<A, R>(function: fn(&A) -> R) -> DelegateKey {
    DelegateKey {
        receiver: 0,
        entry: (function as *const ()).addr(),
    }
}

impl<A, R, L: LockPolicy> Clone for Delegate<A, R, L> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _signature: PhantomData,
        }
    }
}

impl<A, R, L: LockPolicy> PartialEq for Delegate<A, R, L> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<A, R, L: LockPolicy> Eq for Delegate<A, R, L> {}

impl<A, R, L: LockPolicy> Hash for Delegate<A, R, L> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl<A, R, L: LockPolicy> fmt::Debug for Delegate<A, R, L> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate").field("key", &self.key()).finish()
    }
}
