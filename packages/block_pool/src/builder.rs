use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{BlockPool, DEFAULT_BLOCK_LEN};

/// Builder for creating an instance of [`BlockPool`].
///
/// You only need to use this builder if you want to customize the pool configuration.
/// The default configuration used by [`BlockPool::new()`][1] is sufficient for most use cases.
///
/// For pools that live in a `static`, use the `const` constructor
/// [`BlockPool::with_block_len()`][2] instead.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use block_pool::BlockPool;
///
/// let pool = BlockPool::<u64>::builder()
///     .block_len(NonZero::new(1024).unwrap())
///     .build();
/// ```
///
/// [1]: BlockPool::new
/// [2]: BlockPool::with_block_len
#[must_use]
pub struct BlockPoolBuilder<T> {
    block_len: NonZero<u32>,

    _item: PhantomData<T>,
}

impl<T> fmt::Debug for BlockPoolBuilder<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPoolBuilder")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("block_len", &self.block_len)
            .finish()
    }
}

impl<T> BlockPoolBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            block_len: DEFAULT_BLOCK_LEN,
            _item: PhantomData,
        }
    }

    /// Sets the number of slots in the first block. Every later block is twice the size of the
    /// one before it.
    ///
    /// Larger values mean fewer growth events (each of which takes the growth lock) at the
    /// cost of reserving more memory up front on first use.
    pub fn block_len(mut self, len: NonZero<u32>) -> Self {
        self.block_len = len;
        self
    }

    /// Builds the block pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn build(self) -> BlockPool<T> {
        BlockPool::with_block_len(self.block_len)
    }
}
