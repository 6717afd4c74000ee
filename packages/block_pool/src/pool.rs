use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, const_mutex};
use tracing::debug;

use crate::{
    BlockPoolBuilder, Error, MAX_BLOCKS, NIL, Slot, allocate_block, block_fits, block_len,
    block_start, free_block, locate,
};

/// Number of slots in the first block of a pool created via [`BlockPool::new()`].
pub const DEFAULT_BLOCK_LEN: NonZero<u32> = NonZero::new(64).expect("64 is not zero");

/// A lock-free, growable free-list allocator for fixed-size records of type `T`.
///
/// The pool hands out storage for one `T` at a time via [`allocate()`][1] and takes it back
/// via [`release()`][2]. Both operations are a compare-and-swap loop on a single atomic word
/// that holds the head of an intrusive free list, so concurrent callers never receive the same
/// slot twice and never block each other. Only growth, which happens when the free list runs
/// dry, takes a lock.
///
/// The pool deals purely in storage: [`allocate()`][1] returns uninitialized memory and
/// [`release()`][2] does not run any destructor. Initializing the value and dropping it before
/// release is the caller's responsibility.
///
/// # Resource usage
///
/// The pool only grows. Blocks are returned to the system allocator when the pool itself is
/// dropped, which for a pool in a `static` means never. Each block is twice the size of the
/// previous one, starting from the block length given at construction.
///
/// # Example
///
/// ```rust
/// use block_pool::BlockPool;
///
/// let pool = BlockPool::<u64>::new();
///
/// let slot = pool.allocate();
///
/// // SAFETY: The slot is valid for writes of one u64 until we release it.
/// unsafe { slot.write(42) };
///
/// // SAFETY: We initialized the slot above.
/// assert_eq!(unsafe { slot.read() }, 42);
///
/// // SAFETY: The slot came from this pool and is released exactly once.
/// unsafe { pool.release(slot) };
/// ```
///
/// [1]: Self::allocate
/// [2]: Self::release
pub struct BlockPool<T> {
    /// Head of the free list, packed as `(tag << 32) | index`. The tag is bumped on every
    /// successful update so that a compare-and-swap based on a stale read of the head can
    /// never succeed, even if the same index has returned to the head in the meantime.
    head: AtomicU64,

    /// Block `n` covers the index range described in `block.rs`. Entries are written once,
    /// under the growth lock, before any index from the block is published via `head`.
    blocks: [AtomicPtr<Slot<T>>; MAX_BLOCKS],

    /// Number of slots in the first block.
    first_block_len: u32,

    /// Number of blocks published in `blocks`. Only touched under this lock.
    growth: Mutex<usize>,

    /// Never less than the true number of vacant slots; equal to it whenever no allocation or
    /// release is in progress.
    free_len: AtomicUsize,

    capacity: AtomicUsize,

    _item: PhantomData<T>,
}

// SAFETY: The pool only stores storage for `T`, never references to one. Values written into
// slots may be released from any thread, which is fine as long as they could be sent there.
unsafe impl<T: Send> Sync for BlockPool<T> {}

impl<T> BlockPool<T> {
    /// Creates an empty pool whose first block holds [`DEFAULT_BLOCK_LEN`] slots.
    ///
    /// No memory is allocated until the first call to [`allocate()`][Self::allocate], so this
    /// is suitable for initializing a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_block_len(DEFAULT_BLOCK_LEN)
    }

    /// Creates an empty pool whose first block holds `first_block_len` slots.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub const fn with_block_len(first_block_len: NonZero<u32>) -> Self {
        assert!(size_of::<T>() > 0, "BlockPool must have non-zero item size");

        Self {
            head: AtomicU64::new(pack(NIL, 0)),
            blocks: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_BLOCKS],
            first_block_len: first_block_len.get(),
            growth: const_mutex(0),
            free_len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            _item: PhantomData,
        }
    }

    /// Starts building a new [`BlockPool`].
    ///
    /// Use this when you want to customize the pool configuration beyond the defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::<u32>::builder()
    ///     .block_len(NonZero::new(8).unwrap())
    ///     .build();
    ///
    /// assert_eq!(pool.capacity(), 0);
    /// ```
    pub fn builder() -> BlockPoolBuilder<T> {
        BlockPoolBuilder::new()
    }

    /// Reserves storage for one `T` and returns a pointer to it.
    ///
    /// The storage is uninitialized. It remains valid for reads and writes of a `T` until it is
    /// passed back to [`release()`][Self::release] or the pool is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the pool has run out of slot indexes. See [`Error::Exhausted`].
    #[must_use]
    pub fn allocate(&self) -> NonNull<T> {
        self.try_allocate()
            .expect("we do not intend to handle slot index exhaustion as a real possibility - it is a leak")
    }

    /// Reserves storage for one `T`, returning an error if the pool can no longer grow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] if the free list is empty and the pool has already grown
    /// to cover its entire slot index space.
    pub fn try_allocate(&self) -> Result<NonNull<T>, Error> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (index, tag) = unpack(head);

            if index == NIL {
                self.grow()?;
                continue;
            }

            let slot = self.slot(index);

            // If someone else takes this slot before us, the value we read here may be garbage.
            // That is fine because the tag will have changed and our exchange will fail.
            let next = slot.next_free.load(Ordering::Relaxed);

            // Acquire on success to synchronize with the Release of whoever last pushed the
            // slot, so their final writes to the value happen-before ours.
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(next, tag.wrapping_add(1)),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.free_len.fetch_sub(1, Ordering::Relaxed);
                return Ok(slot.value_ptr());
            }
        }
    }

    /// Returns storage previously obtained from [`allocate()`][Self::allocate] to the pool.
    ///
    /// The pool does not drop the value in the slot; if the slot holds an initialized value
    /// that needs dropping, drop it in place before calling this.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that:
    ///
    /// * `ptr` was returned by [`allocate()`][Self::allocate] or
    ///   [`try_allocate()`][Self::try_allocate] on this same pool instance.
    /// * `ptr` has not been released since it was last allocated.
    /// * No references to the slot's contents remain.
    ///
    /// Double release is not detected and corrupts the free list.
    pub unsafe fn release(&self, ptr: NonNull<T>) {
        let slot_ptr = ptr.cast::<Slot<T>>();

        // SAFETY: The caller guarantees the pointer came from this pool, so it points to the
        // value field of a live slot, which is the first field of the `repr(C)` slot.
        let slot = unsafe { slot_ptr.as_ref() };

        debug_assert!(
            self.owns(slot),
            "released pointer did not come from this {}",
            type_name::<Self>()
        );

        // Counted before the push so that `free_len` never drops below the true value.
        self.free_len.fetch_add(1, Ordering::Relaxed);

        loop {
            let head = self.head.load(Ordering::Relaxed);
            let (next, tag) = unpack(head);

            slot.next_free.store(next, Ordering::Relaxed);

            // Release to publish both `next_free` and the caller's last writes to the value to
            // whoever pops this slot next.
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(slot.index, tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// The number of vacant slots on the free list.
    ///
    /// While allocations or releases are in flight on other threads this may briefly
    /// overestimate, but it is exact whenever the pool is quiescent.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free_len.load(Ordering::Relaxed)
    }

    /// The total number of slots the pool has allocated from the system, vacant or not.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// The number of blocks the pool has allocated from the system.
    #[must_use]
    pub fn block_count(&self) -> usize {
        *self.growth.lock()
    }

    fn slot(&self, index: u32) -> &Slot<T> {
        let (block, offset) = locate(self.first_block_len, index);

        let base = self
            .blocks
            .get(block)
            .expect("every index below NIL maps to a directory entry")
            .load(Ordering::Acquire);

        assert!(
            !base.is_null(),
            "slot {index} belongs to block {block} which has not been allocated in {}",
            type_name::<Self>()
        );

        // SAFETY: Indexes only become reachable after their block is published in the
        // directory and blocks are never freed while the pool is alive, so the offset is
        // within a live allocation.
        unsafe { &*base.add(offset) }
    }

    fn owns(&self, slot: &Slot<T>) -> bool {
        let (block, offset) = locate(self.first_block_len, slot.index);

        let Some(entry) = self.blocks.get(block) else {
            return false;
        };

        let base = entry.load(Ordering::Acquire);

        // Address arithmetic only, nothing is dereferenced here.
        !base.is_null() && ptr::eq(base.wrapping_add(offset), slot)
    }

    #[cold]
    fn grow(&self) -> Result<(), Error> {
        let mut block_count = self.growth.lock();

        // Someone may have grown the pool or released a slot while we waited for the lock.
        if unpack(self.head.load(Ordering::Acquire)).0 != NIL {
            return Ok(());
        }

        let block = *block_count;
        let start = block_start(self.first_block_len, block);
        let len = block_len(self.first_block_len, block);

        if !block_fits(self.first_block_len, block) {
            return Err(Error::Exhausted {
                capacity: self.capacity(),
            });
        }

        let start = u32::try_from(start).expect("guarded by block_fits() above");
        let len = u32::try_from(len).expect("guarded by block_fits() above");

        let base = allocate_block::<T>(start, len);

        self.blocks
            .get(block)
            .expect("guarded by block_fits() above")
            .store(base, Ordering::Release);

        *block_count = block
            .checked_add(1)
            .expect("guarded by block_fits() above");

        let len_usize = len as usize;
        let capacity = self.capacity.fetch_add(len_usize, Ordering::Relaxed) + len_usize;
        self.free_len.fetch_add(len_usize, Ordering::Relaxed);

        // SAFETY: The block has `len` > 0 slots.
        let last = unsafe { &*base.add(len_usize - 1) };

        // Releases may have raced with us since the emptiness check, so splice the new chain
        // in front of whatever the free list holds now instead of overwriting it.
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let (next, tag) = unpack(head);

            last.next_free.store(next, Ordering::Relaxed);

            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(start, tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        debug!(
            item_type = type_name::<T>(),
            block,
            slots = len,
            capacity,
            "block pool grew"
        );

        Ok(())
    }
}

impl<T> Default for BlockPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BlockPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("first_block_len", &self.first_block_len)
            .field("block_count", &self.block_count())
            .field("capacity", &self.capacity())
            .field("free_len", &self.free_len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for BlockPool<T> {
    fn drop(&mut self) {
        let block_count = *self.growth.get_mut();

        for (block, entry) in self.blocks.iter_mut().enumerate().take(block_count) {
            let len = usize::try_from(block_len(self.first_block_len, block))
                .expect("a block we managed to allocate has a length that fits in usize");

            // SAFETY: Every published block came from `allocate_block()` with exactly this
            // length, and we have exclusive access to the pool so no slot is referenced.
            unsafe { free_block(*entry.get_mut(), len) };
        }
    }
}

#[must_use]
const fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    reason = "truncation is how we split the packed word"
)]
const fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}
