use std::num::NonZero;

/// A point-in-time snapshot of one pool of a registry.
///
/// Obtained via [`PoolRegistry::pool_stats()`][crate::PoolRegistry::pool_stats] or
/// [`PoolAllocator::pool_stats()`][crate::PoolAllocator::pool_stats].
///
/// # Example
///
/// ```rust
/// use size_class_pool::PoolRegistry;
///
/// let mut registry = PoolRegistry::new();
/// let _block = registry.allocate_bytes(100).unwrap();
///
/// let stats = registry.pool_stats();
/// assert_eq!(stats.len(), 1);
/// assert_eq!(stats[0].block_size().get(), 104);
/// assert_eq!(stats[0].in_use(), 1);
/// assert_eq!(stats[0].free(), 63);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolStats {
    pub(crate) block_size: NonZero<usize>,
    pub(crate) chunk_count: usize,
    pub(crate) capacity: usize,
    pub(crate) in_use: usize,
    pub(crate) free: usize,
}

impl PoolStats {
    /// Size of every block in the pool.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }

    /// Number of chunks the pool has obtained from the upstream provider.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Number of blocks carved from the pool's chunks.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks currently handed out.
    #[inline]
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of blocks on the free list.
    #[inline]
    #[must_use]
    pub fn free(&self) -> usize {
        self.free
    }
}
