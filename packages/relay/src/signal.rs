use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::delegate::{closure_key, fn_key, method_key};
use crate::{
    Bindable, CopyOrBorrow, Delegate, DelegateKey, LockPolicy, NoLock, NodeRef, Observe, Observer,
};

/// A typed event source that invokes every connected handler with `&A` when fired.
///
/// Handlers are free functions, methods bound to an [`Arc`] receiver or closures in an `Arc`.
/// The signal refers to receivers weakly and never keeps them alive: a handler whose receiver
/// is gone is skipped. Handlers fire in the order they were connected. Connecting the same
/// handler twice makes it fire twice, and a single disconnect removes both connections.
///
/// Receivers that implement [`Observe`] can be connected with
/// [`connect_observer()`][Self::connect_observer], which also records the connection on the
/// receiver's side. Dropping such a receiver then disconnects it from every signal, and dropping
/// the signal removes the record from every receiver.
///
/// The lock policy `L` decides how the signal may be used:
///
/// * [`NoLock`] (the default) - single thread, handlers may not touch the signal.
/// * [`SpinLock`][crate::SpinLock] - any thread, handlers may not touch the signal.
/// * [`SafeLock`][crate::SafeLock] - any thread, handlers may connect, disconnect and fire.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use relay::Signal;
///
/// let clicked = Signal::<(u32, u32)>::new();
///
/// let log = Arc::new(|position: &(u32, u32)| println!("clicked at {position:?}"));
/// clicked.connect(&log);
///
/// clicked.fire(&(10, 20));
///
/// clicked.disconnect(&log);
/// assert!(clicked.is_empty());
/// ```
pub struct Signal<A, R = (), L: LockPolicy = NoLock> {
    observer: Observer<L>,

    _signature: PhantomData<fn(&A) -> R>,
}

impl<A, R, L: LockPolicy> Signal<A, R, L> {
    /// Creates a signal with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observer: Observer::new(),
            _signature: PhantomData,
        }
    }

    /// Connects a free function.
    pub fn connect_fn(&self, function: fn(&A) -> R) -> DelegateKey {
        self.connect_delegate(Delegate::from_fn(function))
    }

    /// Connects a closure. The signal holds it weakly, so the caller must keep the `Arc` alive
    /// for as long as the closure should keep firing.
    pub fn connect<F>(&self, handler: &Arc<F>) -> DelegateKey
    where
        F: Fn(&A) -> R + Bindable<L>,
    {
        self.connect_delegate(Delegate::from_closure(handler))
    }

    /// Connects a method of a receiver. The connection is recorded only on this side: the
    /// receiver is skipped once it is dropped, but the record stays until disconnected.
    pub fn connect_method<T>(&self, receiver: &Arc<T>, method: fn(&T, &A) -> R) -> DelegateKey
    where
        T: Bindable<L>,
    {
        self.connect_delegate(Delegate::from_method(receiver, method))
    }

    /// Connects a method of a receiver that owns an [`Observer`]. The connection is recorded on
    /// both sides, so dropping either the receiver or the signal removes it from the other.
    ///
    /// If the subscriber's observer is cleared with [`Observer::disconnect_all()`] on another
    /// thread while this call is in progress, the new connection may end up recorded only on
    /// this side. It then behaves like a [`connect_method()`][Self::connect_method] connection.
    pub fn connect_observer<T>(&self, receiver: &Arc<T>, method: fn(&T, &A) -> R) -> DelegateKey
    where
        T: Observe<L> + Bindable<L>,
    {
        let delegate = Delegate::<A, R, L>::from_method(receiver, method);
        let key = delegate.key();
        let subscriber = receiver.observer();

        // The two inserts are not atomic as a pair. A `disconnect_all()` on the subscriber's
        // observer that runs between them leaves the forward record without a mirror. That
        // record stays until this signal removes it, and it never reaches the receiver once the
        // receiver is gone because the delegate only holds it weakly.
        subscriber.insert(NodeRef::mirror(key, self.observer.endpoint()));
        self.observer.insert(NodeRef::forward(
            delegate.into_raw(),
            Some(subscriber.endpoint()),
        ));

        trace!(
            signal = self.observer.id(),
            subscriber = subscriber.id(),
            receiver = key.receiver_token(),
            entry = key.entry_token(),
            "connected observer"
        );

        key
    }

    /// Connects an existing delegate. The connection is recorded only on this side.
    pub fn connect_delegate(&self, delegate: Delegate<A, R, L>) -> DelegateKey {
        let key = delegate.key();

        self.observer.insert(NodeRef::forward(delegate.into_raw(), None));

        trace!(
            signal = self.observer.id(),
            receiver = key.receiver_token(),
            entry = key.entry_token(),
            "connected"
        );

        key
    }

    /// Disconnects every connection of a free function.
    pub fn disconnect_fn(&self, function: fn(&A) -> R) {
        self.disconnect_key(fn_key(function));
    }

    /// Disconnects every connection of a closure.
    pub fn disconnect<F>(&self, handler: &Arc<F>)
    where
        F: Fn(&A) -> R,
    {
        self.disconnect_key(closure_key(handler));
    }

    /// Disconnects every connection of a receiver's method, including the records on the
    /// receiver's side if it was connected with [`connect_observer()`][Self::connect_observer].
    pub fn disconnect_method<T>(&self, receiver: &Arc<T>, method: fn(&T, &A) -> R) {
        self.disconnect_key(method_key(receiver, method));
    }

    /// Disconnects every connection with the given identity. Does nothing if there is none.
    pub fn disconnect_key(&self, key: DelegateKey) {
        let removed = self.observer.remove(key, None);

        trace!(
            signal = self.observer.id(),
            receiver = key.receiver_token(),
            entry = key.entry_token(),
            removed,
            "disconnected"
        );
    }

    /// Disconnects everything, including the records on the side of every observer-owning
    /// receiver.
    pub fn disconnect_all(&self) {
        self.observer.disconnect_all();
    }

    /// Whether there are no connections.
    ///
    /// Records that this signal holds as a subscriber of other signals count as connections too.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observer.is_empty()
    }

    /// Number of connections, including records held as a subscriber of other signals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observer.len()
    }

    /// Invokes every connected handler with `args`, in connection order.
    pub fn fire(&self, args: &A)
    where
        L: CopyOrBorrow<A>,
    {
        // SAFETY: Only this signal adds forward records to its observer and it creates all of
        // them from `Delegate<A, R, L>`. Records added by other signals are mirrors.
        unsafe { self.observer.for_each::<A, R>(args) };
    }

    /// Invokes every connected handler with `args`, in connection order, passing each return
    /// value to `sink`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use relay::Signal;
    ///
    /// fn square(value: &u64) -> u64 {
    ///     value * value
    /// }
    ///
    /// fn cube(value: &u64) -> u64 {
    ///     value * value * value
    /// }
    ///
    /// let signal = Signal::<u64, u64>::new();
    /// signal.connect_fn(square);
    /// signal.connect_fn(cube);
    ///
    /// let mut results = Vec::new();
    /// signal.fire_accumulate(&3, |result| results.push(result));
    ///
    /// assert_eq!(results, vec![9, 27]);
    /// ```
    pub fn fire_accumulate(&self, args: &A, sink: impl FnMut(R))
    where
        L: CopyOrBorrow<A>,
    {
        // SAFETY: See `fire()`.
        unsafe { self.observer.for_each_accumulate::<A, R>(args, sink) };
    }

    /// The observer that holds this signal's connections.
    ///
    /// Records created when this signal is itself connected as a subscriber of another signal
    /// live here too.
    #[must_use]
    pub fn observer(&self) -> &Observer<L> {
        &self.observer
    }
}

impl<A, R, L: LockPolicy> Observe<L> for Signal<A, R, L> {
    fn observer(&self) -> &Observer<L> {
        &self.observer
    }
}

impl<A, R, L: LockPolicy> Default for Signal<A, R, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R, L: LockPolicy> fmt::Debug for Signal<A, R, L> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("observer", &self.observer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::{CallLog, with_watchdog};

    use super::*;
    use crate::{SafeLock, SpinLock};

    assert_impl_all!(Signal<u32, (), SafeLock>: Send, Sync);
    assert_impl_all!(Signal<u32, (), SpinLock>: Send, Sync);
    assert_not_impl_any!(Signal<u32>: Send, Sync);

    // Non-thread-safe arguments are fine, they never leave the firing thread.
    assert_impl_all!(Signal<Rc<u32>, (), SpinLock>: Send, Sync);

    #[derive(Default)]
    struct Subscriber {
        observer: Observer,
        hits: AtomicUsize,
    }

    impl Observe for Subscriber {
        fn observer(&self) -> &Observer {
            &self.observer
        }
    }

    impl Subscriber {
        fn on_value(&self, _value: &u32) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::Relaxed)
        }
    }

    fn square(value: &u64) -> u64 {
        value * value
    }

    #[test]
    fn is_empty_tracks_connections() {
        let signal = Signal::<u32>::new();
        assert!(signal.is_empty());

        let handler = Arc::new(|_value: &u32| {});
        signal.connect(&handler);
        assert!(!signal.is_empty());
        assert_eq!(signal.len(), 1);

        signal.disconnect(&handler);
        assert!(signal.is_empty());
    }

    #[test]
    fn fires_in_connection_order() {
        let signal = Signal::<u32>::new();
        let log = CallLog::new();

        let handlers = (0..5_u32)
            .map(|index| {
                let log = log.clone();
                Arc::new(move |_value: &u32| log.push(index))
            })
            .collect::<Vec<_>>();

        for handler in &handlers {
            signal.connect(handler);
        }

        signal.fire(&0);

        assert_eq!(log.entries(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fire_accumulate_collects_every_result() {
        let signal = Signal::<u64, u64>::new();

        let handlers = (0..10_u64)
            .map(|index| Arc::new(move |_value: &u64| index * index))
            .collect::<Vec<_>>();

        for handler in &handlers {
            signal.connect(handler);
        }

        let mut results = Vec::new();
        signal.fire_accumulate(&0, |result| results.push(result));

        assert_eq!(results, (0..10_u64).map(|index| index * index).collect::<Vec<_>>());
    }

    #[test]
    fn free_functions_fire_in_connection_order() {
        thread_local! {
            static LOG: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
        }

        fn zero(_args: &()) {
            LOG.with_borrow_mut(|log| log.push(0));
        }

        fn one(_args: &()) {
            LOG.with_borrow_mut(|log| log.push(1));
        }

        fn two(_args: &()) {
            LOG.with_borrow_mut(|log| log.push(2));
        }

        fn three(_args: &()) {
            LOG.with_borrow_mut(|log| log.push(3));
        }

        fn four(_args: &()) {
            LOG.with_borrow_mut(|log| log.push(4));
        }

        let signal = Signal::<()>::new();

        for function in [zero, one, two, three, four] {
            signal.connect_fn(function);
        }

        signal.fire(&());

        assert_eq!(LOG.with_borrow(Clone::clone), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fire_accumulate_over_many_inputs() {
        let signal = Signal::<u64, u64>::new();
        signal.connect_fn(square);

        let mut results = Vec::new();

        for input in 0..10 {
            signal.fire_accumulate(&input, |result| results.push(result));
        }

        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    }

    #[test]
    fn free_function_connect_and_disconnect() {
        let signal = Signal::<u64, u64>::new();

        signal.connect_fn(square);

        let mut results = Vec::new();
        signal.fire_accumulate(&7, |result| results.push(result));
        assert_eq!(results, vec![49]);

        signal.disconnect_fn(square);
        assert!(signal.is_empty());
    }

    #[test]
    fn double_connect_single_disconnect_removes_both() {
        let signal = Signal::<u32>::new();
        let subscriber = Arc::new(Subscriber::default());

        signal.connect_method(&subscriber, Subscriber::on_value);
        signal.connect_method(&subscriber, Subscriber::on_value);

        signal.fire(&1);
        assert_eq!(subscriber.hits(), 2);

        signal.disconnect_method(&subscriber, Subscriber::on_value);
        assert!(signal.is_empty());

        signal.fire(&1);
        assert_eq!(subscriber.hits(), 2);
    }

    #[test]
    fn duplicate_observer_connection_is_removed_by_single_disconnect() {
        let signal = Signal::<u32>::new();
        let subscriber = Arc::new(Subscriber::default());

        signal.connect_observer(&subscriber, Subscriber::on_value);
        signal.connect_observer(&subscriber, Subscriber::on_value);
        assert_eq!(signal.len(), 2);
        assert_eq!(subscriber.observer.len(), 2);

        signal.disconnect_method(&subscriber, Subscriber::on_value);

        assert!(signal.is_empty());
        assert!(subscriber.observer.is_empty());
    }

    #[test]
    fn dropped_subscriber_is_disconnected_from_every_signal() {
        let signals = (0..3).map(|_| Signal::<u32>::new()).collect::<Vec<_>>();
        let subscriber = Arc::new(Subscriber::default());

        for signal in &signals {
            signal.connect_observer(&subscriber, Subscriber::on_value);
        }

        assert_eq!(subscriber.observer.len(), 3);
        drop(subscriber);

        for signal in &signals {
            assert!(signal.is_empty());
            signal.fire(&1);
        }
    }

    #[test]
    fn dropped_signal_is_removed_from_subscriber() {
        let subscriber = Arc::new(Subscriber::default());

        {
            let signal = Signal::<u32>::new();
            signal.connect_observer(&subscriber, Subscriber::on_value);
            assert_eq!(subscriber.observer.len(), 1);
        }

        assert!(subscriber.observer.is_empty());
    }

    #[test]
    fn one_sided_connection_skips_dropped_receiver() {
        let signal = Signal::<u32>::new();
        let subscriber = Arc::new(Subscriber::default());

        signal.connect_method(&subscriber, Subscriber::on_value);
        drop(subscriber);

        // The record stays until disconnected, but firing must not reach the dead receiver.
        assert_eq!(signal.len(), 1);
        signal.fire(&1);
    }

    #[test]
    fn disconnect_all_clears_both_sides() {
        let signal = Signal::<u32>::new();
        let first = Arc::new(Subscriber::default());
        let second = Arc::new(Subscriber::default());

        signal.connect_observer(&first, Subscriber::on_value);
        signal.connect_observer(&second, Subscriber::on_value);
        signal.connect_fn(|_value| {});

        signal.disconnect_all();

        assert!(signal.is_empty());
        assert!(first.observer.is_empty());
        assert!(second.observer.is_empty());
    }

    #[test]
    fn disconnect_of_unknown_handler_is_no_op() {
        let signal = Signal::<u32>::new();
        let connected = Arc::new(|_value: &u32| {});
        let stranger = Arc::new(|_value: &u32| {});

        signal.connect(&connected);
        signal.disconnect(&stranger);

        assert_eq!(signal.len(), 1);
    }

    #[test]
    fn distinct_methods_on_same_receiver_are_distinct() {
        struct Two {
            log: CallLog<&'static str>,
        }

        impl Two {
            fn first(&self, _value: &u32) {
                self.log.push("first");
            }

            fn second(&self, _value: &u32) {
                self.log.push("second");
            }
        }

        let signal = Signal::<u32>::new();
        let two = Arc::new(Two {
            log: CallLog::new(),
        });

        signal.connect_method(&two, Two::first);
        signal.connect_method(&two, Two::second);
        signal.disconnect_method(&two, Two::first);

        signal.fire(&0);

        assert_eq!(two.log.entries(), vec!["second"]);
    }

    #[test]
    fn delegate_connection_can_be_removed_by_key() {
        let signal = Signal::<u32>::new();
        let subscriber = Arc::new(Subscriber::default());

        let key =
            signal.connect_delegate(Delegate::from_method(&subscriber, Subscriber::on_value));
        signal.fire(&0);
        signal.disconnect_key(key);
        signal.fire(&0);

        assert_eq!(subscriber.hits(), 1);
        assert!(signal.is_empty());
    }

    #[test]
    #[should_panic]
    fn single_threaded_reentry_panics() {
        let signal = Rc::new(Signal::<u32>::new());
        let inner = Rc::downgrade(&signal);

        let handler = Arc::new(move |value: &u32| {
            if let Some(signal) = inner.upgrade() {
                signal.fire(value);
            }
        });

        signal.connect(&handler);
        signal.fire(&1);
    }

    #[test]
    fn single_threaded_receivers_need_not_be_thread_safe() {
        let signal = Signal::<u32>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let handler = Arc::new({
            let seen = Rc::clone(&seen);
            move |value: &u32| seen.borrow_mut().push(*value)
        });

        signal.connect(&handler);
        signal.fire(&5);
        signal.fire(&6);

        assert_eq!(*seen.borrow(), vec![5, 6]);
    }

    #[test]
    fn safe_handler_disconnecting_itself_runs_once() {
        let signal = Arc::new(Signal::<(), (), SafeLock>::new());
        let calls = CallLog::new();
        let own_key = Arc::new(OnceLock::<DelegateKey>::new());

        let handler = Arc::new({
            let signal = Arc::downgrade(&signal);
            let calls = calls.clone();
            let own_key = Arc::clone(&own_key);

            move |_args: &()| {
                calls.push(());

                if let (Some(signal), Some(key)) = (signal.upgrade(), own_key.get()) {
                    signal.disconnect_key(*key);
                }
            }
        });

        own_key
            .set(signal.connect(&handler))
            .expect("key is set only once");

        signal.fire(&());
        signal.fire(&());

        assert_eq!(calls.len(), 1);
        assert!(signal.is_empty());
    }

    #[test]
    fn safe_handler_disconnecting_later_handler_prevents_its_call() {
        let signal = Arc::new(Signal::<(), (), SafeLock>::new());
        let calls = CallLog::new();

        let later = Arc::new({
            let calls = calls.clone();
            move |_args: &()| calls.push("later")
        });

        let earlier = Arc::new({
            let signal = Arc::downgrade(&signal);
            let later = Arc::clone(&later);
            let calls = calls.clone();

            move |_args: &()| {
                calls.push("earlier");

                if let Some(signal) = signal.upgrade() {
                    signal.disconnect(&later);
                }
            }
        });

        signal.connect(&earlier);
        signal.connect(&later);
        signal.fire(&());

        assert_eq!(calls.entries(), vec!["earlier"]);
    }

    #[test]
    fn safe_handler_disconnecting_whole_signal_stops_dispatch() {
        let signal = Arc::new(Signal::<(), (), SafeLock>::new());
        let calls = CallLog::new();

        let clearing = Arc::new({
            let signal = Arc::downgrade(&signal);
            let calls = calls.clone();

            move |_args: &()| {
                calls.push("clearing");

                if let Some(signal) = signal.upgrade() {
                    signal.disconnect_all();
                }
            }
        });

        let later = Arc::new({
            let calls = calls.clone();
            move |_args: &()| calls.push("later")
        });

        signal.connect(&clearing);
        signal.connect(&later);
        signal.fire(&());
        signal.fire(&());

        assert_eq!(calls.entries(), vec!["clearing"]);
        assert!(signal.is_empty());
    }

    #[test]
    fn safe_handler_connecting_during_fire_takes_effect_next_time() {
        let signal = Arc::new(Signal::<(), (), SafeLock>::new());
        let calls = CallLog::new();

        let added = Arc::new({
            let calls = calls.clone();
            move |_args: &()| calls.push("added")
        });

        let adder = Arc::new({
            let signal = Arc::downgrade(&signal);
            let added = Arc::clone(&added);
            let calls = calls.clone();

            move |_args: &()| {
                calls.push("adder");

                if let Some(signal) = signal.upgrade() {
                    signal.connect(&added);
                }
            }
        });

        signal.connect(&adder);

        signal.fire(&());
        assert_eq!(calls.entries(), vec!["adder"]);
        assert_eq!(signal.len(), 2);

        calls.clear();
        signal.fire(&());
        assert_eq!(calls.entries(), vec!["adder", "added"]);
    }

    #[test]
    fn safe_lock_passes_a_copy() {
        let signal = Signal::<Vec<u32>, usize, SafeLock>::new();
        signal.connect_fn(Vec::len);

        let mut lengths = Vec::new();
        signal.fire_accumulate(&vec![1, 2, 3], |len| lengths.push(len));

        assert_eq!(lengths, vec![3]);
    }

    #[test]
    fn signal_forwards_to_signal() {
        let upstream = Signal::<u32>::new();
        let downstream = Arc::new(Signal::<u32>::new());
        let log = CallLog::new();

        let handler = Arc::new({
            let log = log.clone();
            move |value: &u32| log.push(*value)
        });
        downstream.connect(&handler);

        upstream.connect_observer(&downstream, Signal::fire);
        upstream.fire(&7);

        assert_eq!(log.entries(), vec![7]);

        // Forwarding is tracked on both sides.
        drop(downstream);
        assert!(upstream.is_empty());
    }

    #[test]
    fn receiver_released_during_dispatch_is_destroyed_after_unlock() {
        // Owns the only strong reference to itself until a handler lets go of it.
        struct SelfOwned {
            observer: Observer<SpinLock>,
            this: parking_lot::Mutex<Option<Arc<SelfOwned>>>,
        }

        impl Observe<SpinLock> for SelfOwned {
            fn observer(&self) -> &Observer<SpinLock> {
                &self.observer
            }
        }

        impl SelfOwned {
            fn let_go(&self, _value: &u32) {
                drop(self.this.lock().take());
            }
        }

        with_watchdog(|| {
            let signal = Signal::<u32, (), SpinLock>::new();
            let owned = Arc::new(SelfOwned {
                observer: Observer::new(),
                this: parking_lot::Mutex::new(None),
            });

            signal.connect_observer(&owned, SelfOwned::let_go);
            *owned.this.lock() = Some(Arc::clone(&owned));

            let weak = Arc::downgrade(&owned);
            drop(owned);

            // The destructor detaches from the signal, which would deadlock if it ran while
            // the dispatch still held the lock.
            signal.fire(&0);

            assert_eq!(weak.strong_count(), 0);
            assert!(signal.is_empty());
        });
    }
}
