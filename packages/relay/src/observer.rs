use std::cell::UnsafeCell;
use std::fmt;
use std::iter;
use std::mem;
use std::ptr;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::trace;

use crate::{
    ConnectionList, CopyOrBorrow, DelegateKey, LockPolicy, Locked, NoLock, NodeRef, Removed,
    StrongReceiver,
};

/// Number of handlers a dispatch can track without touching the heap.
const INLINE_DISPATCH: usize = 16;

/// The side of a connection list owner that its counterparts talk to.
///
/// Only ever called without holding any list lock, so implementations may take their own.
pub(crate) trait Endpoint {
    /// Identity of this endpoint, matching the counterpart identity of records that point here.
    fn id(&self) -> usize;

    /// Silently drops every record with `key` whose counterpart is `counterpart`.
    fn detach(&self, key: DelegateKey, counterpart: usize);
}

/// The shared state of an [`Observer`]: a lock and the connection list it guards.
pub(crate) struct ObserverCore<L> {
    lock: L,
    connections: UnsafeCell<ConnectionList>,
}

// SAFETY: The list is only accessed while holding `lock`, which provides mutual exclusion
// across threads whenever the policy itself is Send + Sync.
unsafe impl<L: Send + Sync> Send for ObserverCore<L> {}

// SAFETY: See above.
unsafe impl<L: Send + Sync> Sync for ObserverCore<L> {}

impl<L: LockPolicy> ObserverCore<L> {
    fn new() -> Self {
        Self {
            lock: L::default(),
            connections: UnsafeCell::new(ConnectionList::default()),
        }
    }

    /// Runs `f` with exclusive access to the connection list.
    ///
    /// `f` must not drop user values that could re-enter this observer: anything that holds a
    /// receiver or a node alive has to be handed back and dropped after this returns.
    fn with_connections<T>(&self, f: impl FnOnce(&mut ConnectionList) -> T) -> T {
        let _locked = Locked::new(&self.lock);

        // SAFETY: We hold the lock, which is the only way anyone gets at the list.
        f(unsafe { &mut *self.connections.get() })
    }

    fn len(&self) -> usize {
        self.with_connections(|connections| connections.len())
    }

    fn is_empty(&self) -> bool {
        self.with_connections(|connections| connections.is_empty())
    }

    fn insert(&self, node: NodeRef) {
        self.with_connections(|connections| connections.push_back(node));
    }

    /// Removes every record matching `key` and, if given, pointing at `counterpart`.
    fn remove(&self, key: DelegateKey, counterpart: Option<usize>) -> Removed {
        self.with_connections(|connections| {
            connections.retain(|node| {
                node.key() != key
                    || counterpart.is_some_and(|counterpart| {
                        node.counterpart_id() != Some(counterpart)
                    })
            })
        })
    }

    /// Tells the counterpart of every removed record, other than ourselves, to drop its side.
    fn notify_counterparts(&self, removed: impl IntoIterator<Item = NodeRef>) {
        let own_id = self.id();

        for node in removed {
            if node.counterpart_id() == Some(own_id) {
                continue;
            }

            // A counterpart that is already gone has cleaned up its own list.
            if let Some(counterpart) = node.counterpart().and_then(Weak::upgrade) {
                counterpart.detach(node.key(), own_id);
            }
        }
    }

    fn disconnect_all(&self) {
        let mut drained = self.with_connections(mem::take);

        if drained.is_empty() {
            return;
        }

        trace!(
            observer = self.id(),
            connections = drained.len(),
            "disconnecting all"
        );

        self.notify_counterparts(iter::from_fn(|| drained.pop_front()));
    }

    /// Invokes every forward record in connection order.
    ///
    /// # Safety
    ///
    /// Every forward record in this list must have been created from a `Delegate<A, R, L>`.
    unsafe fn dispatch<A, R>(&self, args: &A, mut sink: impl FnMut(R))
    where
        L: CopyOrBorrow<A>,
    {
        if L::RELEASE_BEFORE_DISPATCH {
            let (snapshot, args) = self.with_connections(|connections| {
                let snapshot = connections
                    .iter()
                    .filter(|node| node.delegate().is_some())
                    .cloned()
                    .collect::<SmallVec<[NodeRef; INLINE_DISPATCH]>>();

                (snapshot, L::copy_or_borrow(args))
            });

            for node in &snapshot {
                // Disconnected by an earlier handler (or another thread) since the snapshot.
                if !node.is_live() {
                    continue;
                }

                let Some(delegate) = node.delegate() else {
                    continue;
                };

                if let Some(alive) = delegate.upgrade() {
                    // SAFETY: Forwarding the guarantee from the caller about the signature.
                    sink(unsafe { delegate.invoke::<A, R>(&alive, &args) });
                }
            }
        } else {
            // Strong receiver references taken during dispatch are released only after the lock
            // is, because releasing the last one runs the receiver's destructor, which may
            // disconnect from this very observer.
            let mut alive_receivers = SmallVec::<[StrongReceiver; INLINE_DISPATCH]>::new();

            self.with_connections(|connections| {
                let args = L::copy_or_borrow(args);

                for node in connections.iter() {
                    let Some(delegate) = node.delegate() else {
                        continue;
                    };

                    if let Some(alive) = delegate.upgrade() {
                        // SAFETY: Forwarding the guarantee from the caller about the signature.
                        sink(unsafe { delegate.invoke::<A, R>(&alive, &args) });
                        alive_receivers.push(alive);
                    }
                }
            });

            drop(alive_receivers);
        }
    }
}

impl<L: LockPolicy> Endpoint for ObserverCore<L> {
    fn id(&self) -> usize {
        ptr::from_ref(self).cast::<()>().addr()
    }

    fn detach(&self, key: DelegateKey, counterpart: usize) {
        // Dropped after the lock is released.
        drop(self.remove(key, Some(counterpart)));
    }
}

impl<L: LockPolicy> fmt::Debug for ObserverCore<L> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverCore")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Owner of a connection list: the part of a signal or subscriber that remembers what it is
/// connected to and severs every connection when dropped.
///
/// A type that wants its methods connected to signals in both directions embeds an `Observer`
/// and exposes it through [`Observe`]. When the type is dropped, so is the observer, which
/// removes the matching records from every signal the type was connected to. Every
/// [`Signal`][crate::Signal] is itself built on an observer.
///
/// The lock policy `L` must match the policy of the signals the observer connects to.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use relay::{Observe, Observer, SafeLock, Signal};
///
/// #[derive(Default)]
/// struct Thermometer {
///     observer: Observer<SafeLock>,
///     last: AtomicU32,
/// }
///
/// impl Observe<SafeLock> for Thermometer {
///     fn observer(&self) -> &Observer<SafeLock> {
///         &self.observer
///     }
/// }
///
/// impl Thermometer {
///     fn on_reading(&self, value: &u32) {
///         self.last.store(*value, Ordering::Relaxed);
///     }
/// }
///
/// let readings = Signal::<u32, (), SafeLock>::new();
/// let thermometer = Arc::new(Thermometer::default());
///
/// readings.connect_observer(&thermometer, Thermometer::on_reading);
/// readings.fire(&21);
/// assert_eq!(thermometer.last.load(Ordering::Relaxed), 21);
///
/// drop(thermometer);
/// assert!(readings.is_empty());
/// ```
pub struct Observer<L: LockPolicy = NoLock> {
    core: Arc<ObserverCore<L>>,
}

impl<L: LockPolicy> Observer<L> {
    /// Creates an observer with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(ObserverCore::new()),
        }
    }

    /// Whether there are no connection records, forward or mirror.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Number of connection records, forward and mirror.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Removes every record and tells each counterpart to drop its side of the connection.
    pub fn disconnect_all(&self) {
        self.core.disconnect_all();
    }

    /// Identity of this observer as seen by its counterparts.
    pub(crate) fn id(&self) -> usize {
        self.core.id()
    }

    /// Weak handle that counterparts store to reach back to this observer.
    pub(crate) fn endpoint(&self) -> Weak<dyn Endpoint> {
        let weak: Weak<ObserverCore<L>> = Arc::downgrade(&self.core);
        weak
    }

    pub(crate) fn insert(&self, node: NodeRef) {
        self.core.insert(node);
    }

    /// Removes every record matching `key` (and `counterpart`, if given), then notifies the
    /// counterparts of the removed records. Returns how many records were removed here.
    pub(crate) fn remove(&self, key: DelegateKey, counterpart: Option<usize>) -> usize {
        let removed = self.core.remove(key, counterpart);
        let count = removed.len();

        self.core.notify_counterparts(removed);

        count
    }

    /// Invokes every forward record in connection order, discarding results.
    ///
    /// # Safety
    ///
    /// Every forward record in this observer must have been created from a `Delegate<A, R, L>`.
    pub(crate) unsafe fn for_each<A, R>(&self, args: &A)
    where
        L: CopyOrBorrow<A>,
    {
        // SAFETY: Forwarding the guarantee from the caller.
        unsafe { self.core.dispatch::<A, R>(args, drop) };
    }

    /// Invokes every forward record in connection order, passing each result to `sink`.
    ///
    /// # Safety
    ///
    /// Every forward record in this observer must have been created from a `Delegate<A, R, L>`.
    pub(crate) unsafe fn for_each_accumulate<A, R>(&self, args: &A, sink: impl FnMut(R))
    where
        L: CopyOrBorrow<A>,
    {
        // SAFETY: Forwarding the guarantee from the caller.
        unsafe { self.core.dispatch::<A, R>(args, sink) };
    }
}

impl<L: LockPolicy> Default for Observer<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LockPolicy> Drop for Observer<L> {
    fn drop(&mut self) {
        self.core.disconnect_all();
    }
}

impl<L: LockPolicy> fmt::Debug for Observer<L> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id())
            .field("len", &self.len())
            .finish()
    }
}

/// Implemented by types that own an [`Observer`], allowing them to be connected to signals with
/// [`Signal::connect_observer()`][crate::Signal::connect_observer] so that dropping them
/// disconnects them automatically.
pub trait Observe<L: LockPolicy = NoLock> {
    /// The observer that records this value's connections.
    fn observer(&self) -> &Observer<L>;
}

impl<L: LockPolicy> Observe<L> for Observer<L> {
    fn observer(&self) -> &Self {
        self
    }
}
