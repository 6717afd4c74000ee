//! Storage blocks and the slot index space that spans them.
//!
//! Slots are addressed by a single 32-bit index that is stable for the life of the pool. The
//! first block holds `first_len` slots and every following block is twice as large as the one
//! before it, so block `n` covers the index range
//! `first_len * (2^n - 1) .. first_len * (2^(n+1) - 1)`. This keeps the block directory a small
//! fixed-size array no matter how large the pool grows.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU32;

/// Upper bound on the number of blocks a pool can ever own.
///
/// With a first block of a single slot, 32 doubling blocks cover the entire 32-bit index space,
/// so no valid configuration can need more.
pub(crate) const MAX_BLOCKS: usize = 32;

/// Sentinel index meaning "no slot". Never handed out as a real slot index.
pub(crate) const NIL: u32 = u32::MAX;

/// One fixed-size record slot.
///
/// The value must stay the first field: callers only ever see a pointer to the value, and we
/// get back to the slot by casting that pointer.
#[repr(C)]
pub(crate) struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,

    /// Index of the next vacant slot while this slot is on the free list. Only meaningful while
    /// vacant, though it may be read by a thread that lost a race for the slot - the tag on the
    /// free list head makes such stale reads harmless.
    pub(crate) next_free: AtomicU32,

    /// Our own index in the pool. Immutable after the block is created.
    pub(crate) index: u32,
}

impl<T> Slot<T> {
    pub(crate) fn value_ptr(&self) -> NonNull<T> {
        // SAFETY: UnsafeCell never hands out a null pointer.
        unsafe { NonNull::new_unchecked(self.value.get().cast::<T>()) }
    }
}

/// Index of the first slot in `block`.
#[must_use]
pub(crate) fn block_start(first_len: u32, block: usize) -> u64 {
    u64::from(first_len) * ((1_u64 << block) - 1)
}

/// Number of slots in `block`.
#[must_use]
pub(crate) fn block_len(first_len: u32, block: usize) -> u64 {
    u64::from(first_len) << block
}

/// Whether `block` can be allocated without any of its indexes reaching [`NIL`].
#[must_use]
pub(crate) fn block_fits(first_len: u32, block: usize) -> bool {
    block < MAX_BLOCKS
        && block_start(first_len, block)
            .checked_add(block_len(first_len, block))
            .is_some_and(|end| end <= u64::from(NIL))
}

/// Translates a slot index into `(block, offset within block)`.
#[must_use]
pub(crate) fn locate(first_len: u32, index: u32) -> (usize, usize) {
    let quotient = u64::from(index) / u64::from(first_len);

    // The +1 cannot overflow: the quotient is at most u32::MAX.
    let block = (quotient + 1).ilog2() as usize;
    let offset = u64::from(index) - block_start(first_len, block);

    (
        block,
        usize::try_from(offset).expect("offset within a block always fits in usize"),
    )
}

/// Heap-allocates a block of `len` vacant slots whose indexes start at `start`, chained into a
/// free list in index order. The last slot of the block terminates the chain with [`NIL`].
///
/// The returned pointer must eventually be passed to [`free_block()`] with the same length.
pub(crate) fn allocate_block<T>(start: u32, len: u32) -> *mut Slot<T> {
    let block = (0..len)
        .map(|offset| {
            let index = start
                .checked_add(offset)
                .expect("caller guarantees the block fits into the index space");

            Slot {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                next_free: AtomicU32::new(if offset + 1 < len { index + 1 } else { NIL }),
                index,
            }
        })
        .collect::<Box<[Slot<T>]>>();

    Box::into_raw(block).cast::<Slot<T>>()
}

/// Releases a block created by [`allocate_block()`]. Does not drop any values in the slots.
///
/// # Safety
///
/// `base` must have been returned by `allocate_block::<T>()` with the same `len`, and no
/// references to any of its slots may exist anymore.
pub(crate) unsafe fn free_block<T>(base: *mut Slot<T>, len: usize) {
    // SAFETY: Forwarding the guarantees from the caller - this is exactly the boxed slice
    // that `allocate_block()` leaked.
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)) });
}
