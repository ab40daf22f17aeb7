use std::alloc::{GlobalAlloc, Layout};
use std::collections::BTreeMap;
use std::num::NonZero;
use std::ptr::NonNull;

use num_integer::Integer;
use tracing::trace;

use crate::error::Result;
use crate::{BLOCK_ALIGN, BLOCKS_PER_CHUNK, Chunk, Error, PoolStats};

/// Serves blocks of one fixed size, carved from chunks obtained from the upstream provider.
///
/// Blocks are addressed by a pool-local block index (`chunk_index * BLOCKS_PER_CHUNK + slot`).
/// The free list is a stack of such indexes kept beside the chunks; nothing is ever written into
/// the memory of a block. Each chunk additionally tracks which of its blocks are handed out,
/// which lets us reject foreign pointers and double returns instead of corrupting the free list.
///
/// [`take()`](Self::take) is O(1). [`give()`](Self::give) finds the owning chunk through an
/// ordered map of chunk base addresses, so it is O(log chunks).
///
/// The pool only grows. Chunks are returned to the upstream provider all at once via
/// [`release_chunks()`](Self::release_chunks) when the owning registry is torn down.
#[derive(Debug)]
pub(crate) struct Pool {
    /// Fixed for the lifetime of the pool.
    block_size: NonZero<usize>,

    /// Layout of every chunk of this pool, as requested from the upstream provider.
    chunk_layout: Layout,

    /// Chunks in the order they were obtained. A chunk's position is part of the index of
    /// each of its blocks, so chunks are never reordered or removed before teardown.
    chunks: Vec<Chunk>,

    /// Maps the base address of every chunk to its position in `chunks`, so a block pointer
    /// can be traced back to its chunk when the block is returned.
    chunk_index_by_base: BTreeMap<usize, usize>,

    /// Stack of indexes of blocks that are ready to be handed out.
    free_indexes: Vec<usize>,

    /// Number of blocks currently handed out.
    in_use: usize,
}

impl Pool {
    /// Creates an empty pool for blocks of `block_size` bytes. No memory is obtained until
    /// the first [`refill()`](Self::refill).
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is not a multiple of [`BLOCK_ALIGN`] or if a chunk of
    /// [`BLOCKS_PER_CHUNK`] such blocks does not form a valid memory layout. Block sizes
    /// produced by a size classifier always satisfy both conditions.
    #[must_use]
    pub(crate) fn new(block_size: NonZero<usize>) -> Self {
        assert!(
            Integer::is_multiple_of(&block_size.get(), &BLOCK_ALIGN),
            "pool block size {block_size} must be a multiple of the block alignment {BLOCK_ALIGN}"
        );

        let chunk_layout = block_size
            .get()
            .checked_mul(BLOCKS_PER_CHUNK.get())
            .and_then(|chunk_size| Layout::from_size_align(chunk_size, BLOCK_ALIGN).ok())
            .expect("size classifiers only produce block sizes whose chunks form a valid layout");

        Self {
            block_size,
            chunk_layout,
            chunks: Vec::new(),
            chunk_index_by_base: BTreeMap::new(),
            free_indexes: Vec::new(),
            in_use: 0,
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }

    /// Size of each chunk this pool requests from the upstream provider.
    #[inline]
    #[must_use]
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_layout.size()
    }

    #[inline]
    #[must_use]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total number of blocks carved so far, handed out or not.
    #[inline]
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        // Cannot overflow, as that would imply the chunks exceed virtual memory.
        self.chunks.len().wrapping_mul(BLOCKS_PER_CHUNK.get())
    }

    #[inline]
    #[must_use]
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    #[must_use]
    pub(crate) fn free_count(&self) -> usize {
        self.free_indexes.len()
    }

    /// Whether the free list is empty, meaning the next [`take()`](Self::take) requires a
    /// [`refill()`](Self::refill) first.
    #[inline]
    #[must_use]
    pub(crate) fn is_exhausted(&self) -> bool {
        self.free_indexes.is_empty()
    }

    #[inline]
    #[must_use]
    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            chunk_count: self.chunk_count(),
            capacity: self.capacity(),
            in_use: self.in_use,
            free: self.free_count(),
        }
    }

    /// Obtains one more chunk from the upstream provider and adds all of its blocks to the
    /// free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the upstream provider cannot supply the chunk.
    /// The pool is left exactly as it was.
    pub(crate) fn refill<B: GlobalAlloc>(&mut self, upstream: &B) -> Result<()> {
        let chunk = Chunk::obtain(upstream, self.chunk_layout).ok_or(Error::ResourceExhausted {
            chunk_bytes: self.chunk_size(),
        })?;

        let chunk_index = self.chunks.len();

        // Cannot overflow, as that would imply the chunks exceed virtual memory.
        let first_block_index = chunk_index.wrapping_mul(BLOCKS_PER_CHUNK.get());

        self.chunk_index_by_base
            .insert(chunk.base_address(), chunk_index);
        self.chunks.push(chunk);

        // Pushed in reverse so that the block with the lowest address is taken first.
        self.free_indexes.extend(
            (0..BLOCKS_PER_CHUNK.get())
                .rev()
                .map(|slot| first_block_index.wrapping_add(slot)),
        );

        trace!(
            block_size = self.block_size.get(),
            chunk_count = self.chunks.len(),
            "pool refilled with new chunk"
        );

        Ok(())
    }

    /// Hands out one block from the free list.
    ///
    /// # Panics
    ///
    /// Panics if the free list is empty. The caller is responsible for refilling first.
    #[must_use]
    pub(crate) fn take(&mut self) -> NonNull<u8> {
        let block_index = self.free_indexes.pop().unwrap_or_else(|| {
            panic!(
                "take() from exhausted pool of {} byte blocks, refill() must come first",
                self.block_size
            )
        });

        let (chunk_index, slot) = block_index.div_rem(&BLOCKS_PER_CHUNK.get());

        let chunk = self
            .chunks
            .get_mut(chunk_index)
            .expect("free list only contains blocks of chunks owned by this pool");

        chunk.mark_occupied(slot);

        // Cannot overflow because every block in use occupies at least one byte of memory.
        self.in_use = self.in_use.wrapping_add(1);

        chunk.block_ptr(slot, self.block_size)
    }

    /// Returns a block to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the block was not handed out by this pool or has already been returned.
    pub(crate) fn give(&mut self, block: NonNull<u8>) {
        let address = block.as_ptr().addr();

        let (chunk_index, slot) = self.locate(address).unwrap_or_else(|| {
            panic!(
                "block at {address:#x} was not handed out by the pool of {} byte blocks",
                self.block_size
            )
        });

        self.chunks
            .get_mut(chunk_index)
            .expect("chunk index map only refers to owned chunks")
            .mark_vacant(slot);

        // Cannot overflow, as that would imply the chunks exceed virtual memory.
        self.free_indexes.push(
            chunk_index
                .wrapping_mul(BLOCKS_PER_CHUNK.get())
                .wrapping_add(slot),
        );

        // Cannot wrap, the chunk just confirmed the block was handed out.
        self.in_use = self.in_use.wrapping_sub(1);
    }

    /// Returns every chunk to the upstream provider, leaving the pool empty.
    ///
    /// Blocks still handed out become invalid. Each chunk is released exactly once and is
    /// not touched again afterwards.
    ///
    /// # Safety
    ///
    /// `upstream` must be the provider that all chunks of this pool were obtained from.
    pub(crate) unsafe fn release_chunks<B: GlobalAlloc>(&mut self, upstream: &B) {
        self.free_indexes.clear();
        self.chunk_index_by_base.clear();

        for chunk in self.chunks.drain(..) {
            // SAFETY: The caller guarantees this is the upstream the chunk came from and every
            // chunk of this pool was obtained with `chunk_layout`.
            unsafe {
                chunk.release(upstream, self.chunk_layout);
            }
        }
    }

    /// Finds the chunk and slot of the block starting at `address`, if any.
    fn locate(&self, address: usize) -> Option<(usize, usize)> {
        let (&base, &chunk_index) = self.chunk_index_by_base.range(..=address).next_back()?;

        // Cannot wrap, the range lookup only yields bases at or below the address.
        let offset = address.wrapping_sub(base);

        if offset >= self.chunk_layout.size() {
            return None;
        }

        let (slot, misalignment) = offset.div_rem(&self.block_size.get());

        (misalignment == 0).then_some((chunk_index, slot))
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        let occupied: usize = self.chunks.iter().map(Chunk::occupied_count).sum();

        assert_eq!(
            occupied, self.in_use,
            "pool of {} byte blocks counts {} blocks in use but its chunks report {occupied}",
            self.block_size, self.in_use
        );

        assert_eq!(
            self.in_use.wrapping_add(self.free_indexes.len()),
            self.capacity(),
            "pool of {} byte blocks has blocks that are neither free nor in use",
            self.block_size
        );

        for &block_index in &self.free_indexes {
            let (chunk_index, slot) = block_index.div_rem(&BLOCKS_PER_CHUNK.get());
            let chunk = self
                .chunks
                .get(chunk_index)
                .expect("free block index refers to a chunk the pool does not own");

            assert!(
                !chunk.is_occupied(slot),
                "block {block_index} is on the free list while handed out"
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::collections::HashSet;
    use std::ptr;

    use mockall::Sequence;
    use new_zealand::nz;

    use super::*;
    use crate::{MockUpstream, system_alloc, system_dealloc};

    fn refilled_pool(block_size: NonZero<usize>, upstream: &MockUpstream) -> Pool {
        let mut pool = Pool::new(block_size);
        pool.refill(upstream).unwrap();
        pool
    }

    #[test]
    fn new_pool_owns_nothing() {
        let pool = Pool::new(nz!(32));

        assert_eq!(pool.block_size().get(), 32);
        assert_eq!(pool.chunk_size(), 32 * 64);
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert!(pool.is_exhausted());
    }

    #[test]
    fn refill_carves_one_chunk_into_blocks() {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_alloc()
            .withf(|layout| layout.size() == 24 * 64 && layout.align() == BLOCK_ALIGN)
            .once()
            .returning(system_alloc);
        upstream
            .expect_dealloc()
            .withf(|_, layout| layout.size() == 24 * 64)
            .once()
            .returning(system_dealloc);

        let mut pool = refilled_pool(nz!(24), &upstream);

        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.free_count(), 64);
        assert_eq!(pool.in_use(), 0);
        pool.integrity_check();

        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    fn refill_grows_capacity_each_time() {
        let upstream = MockUpstream::serving(3);
        let mut pool = refilled_pool(nz!(8), &upstream);

        pool.refill(&upstream).unwrap();
        pool.refill(&upstream).unwrap();

        assert_eq!(pool.chunk_count(), 3);
        assert_eq!(pool.capacity(), 3 * 64);
        assert_eq!(pool.free_count(), 3 * 64);
        pool.integrity_check();

        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    fn take_hands_out_distinct_blocks_in_ascending_order() {
        let upstream = MockUpstream::serving(1);
        let mut pool = refilled_pool(nz!(16), &upstream);

        let blocks: Vec<_> = (0..64).map(|_| pool.take()).collect();

        let distinct: HashSet<_> = blocks.iter().map(|block| block.as_ptr().addr()).collect();
        assert_eq!(distinct.len(), 64);

        for pair in blocks.windows(2) {
            assert_eq!(pair[1].as_ptr().addr() - pair[0].as_ptr().addr(), 16);
        }

        assert!(pool.is_exhausted());
        assert_eq!(pool.in_use(), 64);
        pool.integrity_check();

        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    fn give_then_take_reuses_most_recent_block() {
        let upstream = MockUpstream::serving(1);
        let mut pool = refilled_pool(nz!(40), &upstream);

        let first = pool.take();
        let second = pool.take();

        pool.give(first);
        assert_eq!(pool.take(), first);

        pool.give(second);
        pool.give(first);
        assert_eq!(pool.take(), first);
        assert_eq!(pool.take(), second);
        pool.integrity_check();

        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    fn blocks_from_later_chunks_can_be_returned() {
        let upstream = MockUpstream::serving(4);
        let mut pool = refilled_pool(nz!(64), &upstream);

        let mut blocks = Vec::new();
        for _ in 0..3 {
            while !pool.is_exhausted() {
                blocks.push(pool.take());
            }
            pool.refill(&upstream).unwrap();
        }

        for block in blocks.drain(..).rev() {
            pool.give(block);
        }

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_count(), pool.capacity());
        pool.integrity_check();

        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    fn failed_refill_leaves_pool_untouched() {
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

        let mut pool = refilled_pool(nz!(8), &upstream);
        let block = pool.take();

        assert_eq!(
            pool.refill(&upstream),
            Err(Error::ResourceExhausted {
                chunk_bytes: 8 * 64
            })
        );
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.free_count(), 63);
        assert_eq!(pool.in_use(), 1);
        pool.integrity_check();

        pool.give(block);
        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    fn release_chunks_returns_every_chunk_once() {
        let mut upstream = MockUpstream::serving(2);
        let mut pool = refilled_pool(nz!(8), &upstream);
        pool.refill(&upstream).unwrap();
        _ = pool.take();

        unsafe { pool.release_chunks(&upstream) };

        upstream.checkpoint();
        assert_eq!(pool.chunk_count(), 0);
        assert!(pool.is_exhausted());
    }

    #[test]
    fn stats_reflect_usage() {
        let upstream = MockUpstream::serving(1);
        let mut pool = refilled_pool(nz!(96), &upstream);
        let _a = pool.take();
        let _b = pool.take();

        let stats = pool.stats();
        assert_eq!(stats.block_size().get(), 96);
        assert_eq!(stats.chunk_count(), 1);
        assert_eq!(stats.capacity(), 64);
        assert_eq!(stats.in_use(), 2);
        assert_eq!(stats.free(), 62);

        unsafe { pool.release_chunks(&upstream) };
    }

    #[test]
    #[should_panic]
    fn take_from_exhausted_pool_panics() {
        let mut pool = Pool::new(nz!(8));
        _ = pool.take();
    }

    #[test]
    #[should_panic]
    fn give_twice_panics() {
        let upstream = MockUpstream::serving(1);
        let mut pool = refilled_pool(nz!(8), &upstream);

        let block = pool.take();
        pool.give(block);
        pool.give(block);
    }

    #[test]
    #[should_panic]
    fn give_foreign_block_panics() {
        let upstream = MockUpstream::serving(2);
        let mut pool = refilled_pool(nz!(8), &upstream);
        let mut other = refilled_pool(nz!(8), &upstream);

        let block = other.take();
        pool.give(block);
    }

    #[test]
    #[should_panic]
    fn give_misaligned_block_panics() {
        let upstream = MockUpstream::serving(1);
        let mut pool = refilled_pool(nz!(16), &upstream);

        let block = pool.take();
        pool.give(unsafe { block.add(8) });
    }

    #[test]
    #[should_panic]
    fn block_size_must_be_block_aligned() {
        let _pool = Pool::new(nz!(12));
    }
}
