#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Typed in-process signals: connect handlers to a [`Signal`], fire it, and every connected
//! handler is invoked in connection order.
//!
//! Handlers can be free functions, methods bound to a receiver in an [`Arc`][std::sync::Arc] or
//! closures in an `Arc`. A signal only ever holds receivers weakly, so it never extends their
//! lifetime and never calls into a destroyed one.
//!
//! # Automatic disconnection
//!
//! A receiver that owns an [`Observer`] and exposes it through [`Observe`] can be connected
//! with [`Signal::connect_observer()`]. The connection is then recorded on both sides:
//!
//! * dropping the receiver removes its connections from every signal it was connected to;
//! * dropping the signal removes the records from every receiver.
//!
//! Neither side ever holds its own lock while talking to the other, so tearing down both ends
//! of a connection from different threads at the same time cannot deadlock.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use relay::{Observe, Observer, Signal};
//!
//! #[derive(Default)]
//! struct Counter {
//!     observer: Observer,
//!     count: AtomicUsize,
//! }
//!
//! impl Observe for Counter {
//!     fn observer(&self) -> &Observer {
//!         &self.observer
//!     }
//! }
//!
//! impl Counter {
//!     fn on_tick(&self, _tick: &u64) {
//!         self.count.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let ticks = Signal::<u64>::new();
//! let counter = Arc::new(Counter::default());
//!
//! ticks.connect_observer(&counter, Counter::on_tick);
//! ticks.fire(&1);
//! ticks.fire(&2);
//! assert_eq!(counter.count.load(Ordering::Relaxed), 2);
//!
//! drop(counter);
//! assert!(ticks.is_empty());
//! ```
//!
//! # Lock policies
//!
//! Every signal and observer has a lock policy type parameter:
//!
//! * [`NoLock`] is the default. No synchronization, and the compiler keeps the signal on one
//!   thread.
//! * [`SpinLock`] makes the signal usable from many threads. Handlers run under the lock and
//!   must not modify the signal that invokes them.
//! * [`SafeLock`] makes the signal usable from many threads and releases the lock before
//!   invoking handlers, which may then connect, disconnect or fire freely. The fired argument
//!   is copied, so it must be `Clone`.
//!
//! Receivers connected to a thread-safe signal must be `Send + Sync`, see [`Bindable`].
//!
//! # Signal chaining
//!
//! A signal implements [`Observe`], so it can subscribe to another signal with the same
//! argument type and forward what it receives:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use relay::Signal;
//!
//! let upstream = Signal::<String>::new();
//! let downstream = Arc::new(Signal::<String>::new());
//!
//! upstream.connect_observer(&downstream, Signal::fire);
//! upstream.fire(&"hello".to_string());
//!
//! drop(downstream);
//! assert!(upstream.is_empty());
//! ```
//!
//! # Allocation
//!
//! Connection records come from a process-wide lock-free pool (see the `block_pool` package),
//! so connecting and disconnecting do not go through the global allocator once the pool has
//! warmed up.

mod bindable;
mod delegate;
mod lock;
mod node;
mod observer;
mod signal;

pub use bindable::*;
pub(crate) use delegate::{RawDelegate, StrongReceiver};
pub use delegate::*;
pub(crate) use lock::Locked;
pub use lock::*;
pub(crate) use node::*;
pub(crate) use observer::{Endpoint, ObserverCore};
pub use observer::*;
pub use signal::*;
