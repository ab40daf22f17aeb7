use std::alloc::GlobalAlloc;
use std::ptr::NonNull;
use std::thread;

use tracing::debug;

use crate::error::Result;
use crate::{
    DefaultUpstream, DropPolicy, Pool, PoolRegistryBuilder, PoolSet, PoolStats, SizeClassifier,
};

/// A collection of pools, one per block size, that serves untyped blocks of memory.
///
/// Every request is rounded up to a block size by the registry's [`SizeClassifier`] and served
/// by the pool for that block size. Pools are created the first time their block size is
/// requested and obtain memory from the upstream provider one chunk of
/// [`BLOCKS_PER_CHUNK`][crate::BLOCKS_PER_CHUNK] blocks at a time.
///
/// Memory only ever flows back to the upstream provider when the registry is dropped. Until then,
/// returned blocks are kept on the free list of their pool for reuse.
///
/// To share one registry between several typed handles, wrap it in a
/// [`PoolAllocator`][crate::PoolAllocator] via `From`.
///
/// # Example
///
/// ```rust
/// use size_class_pool::PoolRegistry;
///
/// let mut registry = PoolRegistry::new();
///
/// let block = registry.allocate_bytes(100).unwrap();
/// assert!(block.is_some());
///
/// // The caller must remember the size it asked for.
/// registry.deallocate_bytes(block, 100);
///
/// // Zero-byte requests are served without touching any pool.
/// assert!(registry.allocate_bytes(0).unwrap().is_none());
/// assert_eq!(registry.pool_count(), 1);
/// ```
///
/// # Thread safety
///
/// The registry is thread-mobile ([`Send`]) if its upstream provider is, but not thread-safe
/// ([`Sync`]). Every operation takes `&mut self`.
#[derive(Debug)]
pub struct PoolRegistry<B: GlobalAlloc = DefaultUpstream> {
    classifier: SizeClassifier,

    pools: PoolSet,

    drop_policy: DropPolicy,

    /// Every chunk of every pool came from here and goes back here at teardown.
    upstream: B,
}

impl PoolRegistry {
    /// Creates a registry with the default configuration.
    ///
    /// Use [`builder()`](Self::builder) to customize the size classifier, the drop policy or
    /// the upstream provider.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a new registry.
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::new()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: GlobalAlloc> PoolRegistry<B> {
    #[must_use]
    pub(crate) fn new_inner(classifier: SizeClassifier, drop_policy: DropPolicy, upstream: B) -> Self {
        Self {
            classifier,
            pools: PoolSet::for_classifier(classifier),
            drop_policy,
            upstream,
        }
    }

    /// The classifier that maps request sizes to block sizes in this registry.
    #[must_use]
    pub fn classifier(&self) -> SizeClassifier {
        self.classifier
    }

    /// The largest request, in bytes, that this registry can serve.
    #[must_use]
    pub fn max_block_size(&self) -> usize {
        self.classifier.max_block_size()
    }

    /// Hands out a block of at least `bytes` bytes, aligned to
    /// [`BLOCK_ALIGN`][crate::BLOCK_ALIGN].
    ///
    /// Returns `Ok(None)` for a zero-byte request, which has no effect on the registry.
    ///
    /// The block stays valid until it is returned via [`deallocate_bytes()`](Self::deallocate_bytes)
    /// or the registry is dropped, whichever comes first. Its contents are unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeUnsupported`][crate::Error::SizeUnsupported] if `bytes` exceeds
    /// [`max_block_size()`](Self::max_block_size).
    ///
    /// Returns [`Error::ResourceExhausted`][crate::Error::ResourceExhausted] if the pool had no
    /// free block and the upstream provider could not supply a new chunk. The registry is left
    /// exactly as it was before the call.
    pub fn allocate_bytes(&mut self, bytes: usize) -> Result<Option<NonNull<u8>>> {
        if bytes == 0 {
            return Ok(None);
        }

        let class = self.classifier.bytes_to_class(bytes)?;
        let upstream = &self.upstream;

        if let Some(pool) = self.pools.get_mut(class) {
            if pool.is_exhausted() {
                pool.refill(upstream).inspect_err(|error| {
                    debug!(
                        block_size = class.block_size().get(),
                        %error,
                        "pool refill failed"
                    );
                })?;
            }

            return Ok(Some(pool.take()));
        }

        // A new pool only becomes part of the registry once it holds memory, so a failed first
        // request for a block size leaves no trace.
        let mut pool = Pool::new(class.block_size());
        pool.refill(upstream).inspect_err(|error| {
            debug!(
                block_size = class.block_size().get(),
                %error,
                "first chunk for new pool could not be obtained"
            );
        })?;

        let block = pool.take();
        self.pools.insert(class, pool);

        Ok(Some(block))
    }

    /// Returns a block previously obtained from [`allocate_bytes()`](Self::allocate_bytes) to
    /// the free list of its pool.
    ///
    /// `bytes` must be the size that was passed when allocating the block. Passing `None` or
    /// zero bytes does nothing.
    ///
    /// # Panics
    ///
    /// Panics if the block could not have been handed out by this registry for a request of
    /// `bytes`, or if it has already been returned.
    pub fn deallocate_bytes(&mut self, block: Option<NonNull<u8>>, bytes: usize) {
        let Some(block) = block else {
            return;
        };

        if bytes == 0 {
            return;
        }

        let class = self.classifier.bytes_to_class(bytes).unwrap_or_else(|error| {
            panic!("returned block claims a size this registry never serves: {error}")
        });

        self.pools
            .get_mut(class)
            .unwrap_or_else(|| {
                panic!(
                    "returned block of {bytes} bytes but no pool of {} byte blocks exists",
                    class.block_size()
                )
            })
            .give(block);
    }

    /// Number of pools created so far. A pool exists for every block size that has been
    /// successfully requested at least once.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Number of chunks obtained from the upstream provider across all pools.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.pools.iter().map(Pool::chunk_count).sum()
    }

    /// Number of blocks currently handed out across all pools.
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.pools.iter().map(Pool::in_use).sum()
    }

    /// Whether no block is currently handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks_in_use() == 0
    }

    /// Snapshot of every pool, ordered by ascending block size.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.iter().map(Pool::stats).collect();
        stats.sort_unstable_by_key(PoolStats::block_size);
        stats
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        for pool in self.pools.iter() {
            pool.integrity_check();
        }
    }
}

impl<B: GlobalAlloc> Drop for PoolRegistry<B> {
    fn drop(&mut self) {
        let blocks_in_use = self.blocks_in_use();

        debug!(
            pool_count = self.pools.len(),
            chunk_count = self.chunk_count(),
            blocks_in_use,
            "tearing down pool registry"
        );

        for pool in self.pools.iter_mut() {
            // SAFETY: Pools only ever obtain chunks from the upstream provider of their registry.
            unsafe {
                pool.release_chunks(&self.upstream);
            }
        }

        // We check at the end so the memory is released first. If we are already panicking,
        // we do not want to panic again because that would obscure the original panic.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropBlocks) {
            assert!(
                blocks_in_use == 0,
                "dropped a pool registry with {blocks_in_use} blocks still in use - this is forbidden by DropPolicy::MustNotDropBlocks"
            );
        }
    }
}

// SAFETY: The registry owns its chunks exclusively. The raw pointers inside are only used to
// manage that memory and are never shared by the registry itself, so moving it to another thread
// is sound as long as the upstream provider may move along with it.
unsafe impl<B: GlobalAlloc + Send> Send for PoolRegistry<B> {}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::System;
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::ptr;
    use std::rc::Rc;

    use mockall::Sequence;
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{
        BLOCKS_PER_CHUNK, Error, MAX_BOUNDED_BLOCK_SIZE, MockUpstream, system_alloc,
        system_dealloc,
    };

    assert_impl_all!(PoolRegistry: Send, std::fmt::Debug, Default);
    assert_not_impl_any!(PoolRegistry: Sync);

    fn mock_registry(upstream: MockUpstream) -> PoolRegistry<MockUpstream> {
        PoolRegistry::builder().upstream(upstream).build()
    }

    #[test]
    fn zero_byte_request_touches_nothing() {
        let mut upstream = MockUpstream::new();
        upstream.expect_alloc().never();
        upstream.expect_dealloc().never();

        let mut registry = mock_registry(upstream);

        assert_eq!(registry.allocate_bytes(0).unwrap(), None);
        registry.deallocate_bytes(None, 0);
        registry.deallocate_bytes(None, 100);

        assert_eq!(registry.pool_count(), 0);
    }

    #[test]
    fn one_chunk_serves_a_full_batch() {
        let mut upstream = MockUpstream::new();

        // Counts requests as they happen, so each batch can be checked on its own.
        let requests = Rc::new(Cell::new(0_usize));
        upstream
            .expect_alloc()
            .withf(|layout| layout.size() == 24 * BLOCKS_PER_CHUNK.get())
            .times(2)
            .returning_st({
                let requests = Rc::clone(&requests);
                move |layout| {
                    requests.set(requests.get() + 1);
                    system_alloc(layout)
                }
            });
        upstream
            .expect_dealloc()
            .times(2)
            .returning(system_dealloc);

        let mut registry = mock_registry(upstream);

        let mut blocks = HashSet::new();

        for _ in 0..BLOCKS_PER_CHUNK.get() {
            blocks.insert(registry.allocate_bytes(24).unwrap().unwrap());
        }

        assert_eq!(blocks.len(), BLOCKS_PER_CHUNK.get());
        assert_eq!(requests.get(), 1);
        assert_eq!(registry.chunk_count(), 1);

        blocks.insert(registry.allocate_bytes(24).unwrap().unwrap());

        assert_eq!(blocks.len(), BLOCKS_PER_CHUNK.get() + 1);
        assert_eq!(requests.get(), 2);
        assert_eq!(registry.chunk_count(), 2);
        assert_eq!(registry.blocks_in_use(), BLOCKS_PER_CHUNK.get() + 1);

        registry.integrity_check();

        for block in blocks {
            registry.deallocate_bytes(Some(block), 24);
        }

        assert!(registry.is_empty());
        registry.integrity_check();
    }

    #[test]
    fn returned_block_is_reused_first() {
        let mut registry = PoolRegistry::new();

        let first = registry.allocate_bytes(40).unwrap();
        let second = registry.allocate_bytes(40).unwrap();

        registry.deallocate_bytes(second, 40);
        registry.deallocate_bytes(first, 40);

        assert_eq!(registry.allocate_bytes(40).unwrap(), first);
        assert_eq!(registry.allocate_bytes(40).unwrap(), second);
    }

    #[test]
    fn sizes_in_one_class_share_a_pool() {
        let mut registry = PoolRegistry::new();

        // 97..=104 all round to 104.
        let a = registry.allocate_bytes(97).unwrap();
        let b = registry.allocate_bytes(104).unwrap();

        assert_eq!(registry.pool_count(), 1);

        // Returning with a different size of the same class is fine.
        registry.deallocate_bytes(a, 100);
        registry.deallocate_bytes(b, 98);

        assert!(registry.is_empty());
    }

    #[test]
    fn blocks_are_aligned_and_large_enough() {
        let mut registry = PoolRegistry::new();

        for bytes in [1, 7, 9, 130, 600, 2100, MAX_BOUNDED_BLOCK_SIZE] {
            let block = registry.allocate_bytes(bytes).unwrap().unwrap();
            assert_eq!(block.as_ptr().addr() % crate::BLOCK_ALIGN, 0);

            // The whole requested range is writable.
            // SAFETY: The block holds at least `bytes` bytes.
            unsafe { block.as_ptr().write_bytes(0xAB, bytes) };

            registry.deallocate_bytes(Some(block), bytes);
        }
    }

    #[test]
    fn chunk_count_never_decreases() {
        // Later rounds are served entirely from recycled blocks.
        let mut registry = mock_registry(MockUpstream::serving(2));

        let mut blocks = Vec::new();
        let mut last_chunk_count = 0;

        for round in 0..3 {
            for _ in 0..100 {
                blocks.push(registry.allocate_bytes(16).unwrap());
            }

            for block in blocks.drain(..) {
                registry.deallocate_bytes(block, 16);
            }

            assert!(registry.chunk_count() >= last_chunk_count, "round {round}");
            last_chunk_count = registry.chunk_count();
        }

        assert_eq!(last_chunk_count, 2);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut upstream = MockUpstream::new();
        upstream.expect_alloc().never();

        let mut registry = mock_registry(upstream);

        let result = registry.allocate_bytes(MAX_BOUNDED_BLOCK_SIZE + 1);

        assert_eq!(
            result,
            Err(Error::SizeUnsupported {
                bytes: MAX_BOUNDED_BLOCK_SIZE + 1,
                max_bytes: MAX_BOUNDED_BLOCK_SIZE,
            })
        );
        assert_eq!(registry.pool_count(), 0);
    }

    #[test]
    fn exhaustion_on_first_request_creates_no_pool() {
        let mut upstream = MockUpstream::new();

        let mut seq = Sequence::new();
        upstream
            .expect_alloc()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| ptr::null_mut());
        upstream
            .expect_alloc()
            .once()
            .in_sequence(&mut seq)
            .returning(system_alloc);
        upstream
            .expect_dealloc()
            .once()
            .returning(system_dealloc);

        let mut registry = mock_registry(upstream);

        let result = registry.allocate_bytes(64);
        assert!(matches!(result, Err(Error::ResourceExhausted { chunk_bytes: 4096 })));
        assert_eq!(registry.pool_count(), 0);

        assert!(registry.allocate_bytes(64).unwrap().is_some());
        assert_eq!(registry.pool_count(), 1);
    }

    #[test]
    fn exhaustion_on_refill_leaves_pool_unchanged() {
        let mut upstream = MockUpstream::new();

        let mut seq = Sequence::new();
        upstream
            .expect_alloc()
            .once()
            .in_sequence(&mut seq)
            .returning(system_alloc);
        upstream
            .expect_alloc()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| ptr::null_mut());
        upstream
            .expect_dealloc()
            .once()
            .returning(system_dealloc);

        let mut registry = mock_registry(upstream);

        let blocks: Vec<_> = (0..BLOCKS_PER_CHUNK.get())
            .map(|_| registry.allocate_bytes(8).unwrap())
            .collect();

        let before = registry.pool_stats();

        assert!(matches!(
            registry.allocate_bytes(8),
            Err(Error::ResourceExhausted { .. })
        ));

        assert_eq!(registry.pool_stats(), before);
        registry.integrity_check();

        // Returned blocks can still be handed out without the upstream provider.
        registry.deallocate_bytes(blocks[10], 8);
        assert_eq!(registry.allocate_bytes(8).unwrap(), blocks[10]);
    }

    #[test]
    fn dynamic_list_serves_large_sizes() {
        let mut registry = PoolRegistry::builder()
            .classifier(SizeClassifier::dynamic_list(nz!(32)))
            .upstream(MockUpstream::serving(3))
            .build();

        let large = registry.allocate_bytes(MAX_BOUNDED_BLOCK_SIZE + 1).unwrap();
        let huge = registry.allocate_bytes(100_000).unwrap();
        let small = registry.allocate_bytes(3).unwrap();

        assert_eq!(registry.pool_count(), 3);

        let block_sizes: Vec<_> = registry
            .pool_stats()
            .iter()
            .map(|stats| stats.block_size().get())
            .collect();
        assert_eq!(block_sizes, [32, 8224, 100_000]);

        registry.deallocate_bytes(large, MAX_BOUNDED_BLOCK_SIZE + 1);
        registry.deallocate_bytes(huge, 100_000);
        registry.deallocate_bytes(small, 3);
    }

    #[test]
    fn teardown_releases_every_chunk_once() {
        let (upstream, released) = MockUpstream::serving_with_release_count(4);

        let mut registry = mock_registry(upstream);

        for bytes in [8, 8, 200, 5000] {
            _ = registry.allocate_bytes(bytes).unwrap();
        }

        for _ in 0..BLOCKS_PER_CHUNK.get() {
            _ = registry.allocate_bytes(8).unwrap();
        }

        assert_eq!(registry.chunk_count(), 4);
        assert_eq!(released.get(), 0);

        // Blocks still in use are fine under the default policy.
        drop(registry);

        assert_eq!(released.get(), 4);
    }

    #[test]
    fn must_not_drop_blocks_allows_empty_registry() {
        let mut registry = PoolRegistry::builder()
            .drop_policy(DropPolicy::MustNotDropBlocks)
            .build();

        let block = registry.allocate_bytes(64).unwrap();
        registry.deallocate_bytes(block, 64);

        drop(registry);
    }

    #[test]
    #[should_panic]
    fn must_not_drop_blocks_panics_with_blocks_in_use() {
        let mut registry = PoolRegistry::builder()
            .drop_policy(DropPolicy::MustNotDropBlocks)
            .upstream(System)
            .build();

        _ = registry.allocate_bytes(64).unwrap();

        drop(registry);
    }

    #[test]
    #[should_panic]
    fn deallocate_without_pool_panics() {
        let mut registry = PoolRegistry::new();
        let block = registry.allocate_bytes(64).unwrap();

        registry.deallocate_bytes(block, 1000);
    }

    #[test]
    #[should_panic]
    fn deallocate_with_wrong_class_panics() {
        let mut registry = PoolRegistry::new();
        let block = registry.allocate_bytes(64).unwrap();
        _ = registry.allocate_bytes(128).unwrap();

        // The 128 byte pool exists but never handed out this block.
        registry.deallocate_bytes(block, 128);
    }

    #[test]
    #[should_panic]
    fn deallocate_twice_panics() {
        let mut registry = PoolRegistry::new();
        let block = registry.allocate_bytes(64).unwrap();

        registry.deallocate_bytes(block, 64);
        registry.deallocate_bytes(block, 64);
    }

    #[test]
    #[should_panic]
    fn deallocate_oversized_panics() {
        let mut registry = PoolRegistry::new();
        let block = registry.allocate_bytes(64).unwrap();

        registry.deallocate_bytes(block, MAX_BOUNDED_BLOCK_SIZE + 1);
    }

    #[test]
    fn registry_send_trait() {
        let mut registry = PoolRegistry::new();
        let block = registry.allocate_bytes(32).unwrap();
        let address = block.map(|block| block.as_ptr().addr());
        registry.deallocate_bytes(block, 32);

        let handle = std::thread::spawn(move || {
            let block = registry.allocate_bytes(32).unwrap();
            let address = block.map(|block| block.as_ptr().addr());
            registry.deallocate_bytes(block, 32);
            address
        });

        assert_eq!(handle.join().expect("thread completed successfully"), address);
    }
}
