use thiserror::Error;

/// Errors that can occur when allocating from a [`BlockPool`][crate::BlockPool].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Every slot index the pool can address is already in use, so the pool cannot grow.
    ///
    /// Slots are addressed by 32-bit indexes, which bounds the total number of slots a single
    /// pool can ever hand out. Reaching this limit almost always means records are being
    /// allocated and never released.
    #[error("block pool cannot grow beyond {capacity} slots")]
    Exhausted {
        /// The number of slots the pool had when growth was refused.
        capacity: usize,
    },
}
