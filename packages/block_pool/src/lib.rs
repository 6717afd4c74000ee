#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A lock-free, growable free-list allocator for fixed-size records.
//!
//! [`BlockPool<T>`] hands out storage for one `T` at a time. The common path - taking a slot
//! from the free list and putting one back - is a single compare-and-swap loop with no locks,
//! so many threads can allocate and release concurrently. When the free list runs dry the pool
//! appends a new block of slots under a coarse lock and carries on.
//!
//! The pool amortizes allocation cost for workloads that create and destroy many small records
//! of the same type, such as connection bookkeeping in an event dispatcher. Memory is only ever
//! returned to the system when the pool is dropped, and a pool in a `static` is never dropped.
//!
//! # Example
//!
//! ```rust
//! use block_pool::BlockPool;
//!
//! static RECORDS: BlockPool<(u32, u32)> = BlockPool::new();
//!
//! let record = RECORDS.allocate();
//!
//! // SAFETY: Freshly allocated storage is valid for writes.
//! unsafe { record.write((1, 2)) };
//!
//! // SAFETY: We wrote a value above and nothing else references the slot.
//! let (a, b) = unsafe { record.read() };
//! assert_eq!(a + b, 3);
//!
//! // SAFETY: The pointer came from this pool and is released exactly once.
//! unsafe { RECORDS.release(record) };
//! ```
//!
//! # Safety contract
//!
//! The pool does not track which slots are in use. Releasing a pointer that did not come from
//! the same pool, or releasing the same pointer twice, corrupts the free list. The owner of the
//! records must pair every allocation with exactly one release.

mod block;
mod builder;
mod error;
mod pool;

pub(crate) use block::*;
pub use builder::*;
pub use error::*;
pub use pool::*;
