use std::alloc::{GlobalAlloc, Layout};
use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;

/// Every chunk obtained from the upstream provider is carved into exactly this many blocks.
///
/// This matches the number of bits in the chunk occupancy mask, so each block has one bit.
pub const BLOCKS_PER_CHUNK: NonZero<usize> = nz!(64);

/// Every block handed out by a pool is aligned to at least this many bytes.
///
/// Chunks are requested from the upstream provider with this alignment and every block size
/// produced by a [`SizeClassifier`][crate::SizeClassifier] is a multiple of it.
pub const BLOCK_ALIGN: usize = 8;

/// The type used to track which blocks of a chunk are in use.
type OccupancyMask = u64;

/// A region obtained from the upstream provider in one piece and carved into
/// [`BLOCKS_PER_CHUNK`] equally sized blocks.
///
/// The chunk never reads or writes the memory of its blocks. It only remembers where the
/// region starts and which blocks are currently handed out, one bit per block.
///
/// A chunk does not release its memory on drop because it does not know the upstream provider.
/// The owning pool returns it via [`release()`](Self::release) at teardown.
#[derive(Debug)]
pub(crate) struct Chunk {
    base: NonNull<u8>,

    /// Bit `n` is set while block `n` is handed out.
    occupied: OccupancyMask,
}

impl Chunk {
    /// Requests one chunk of `layout` from the upstream provider.
    ///
    /// Returns `None` if the upstream provider could not supply the memory.
    #[must_use]
    pub(crate) fn obtain<B: GlobalAlloc>(upstream: &B, layout: Layout) -> Option<Self> {
        assert!(layout.size() > 0, "chunk layout must have non-zero size");

        // SAFETY: The layout has non-zero size, as asserted above.
        let base = NonNull::new(unsafe { upstream.alloc(layout) })?;

        Some(Self { base, occupied: 0 })
    }

    /// Returns the chunk memory to the upstream provider, consuming the chunk.
    ///
    /// # Safety
    ///
    /// The chunk must have been obtained from the same `upstream` with the same `layout`.
    pub(crate) unsafe fn release<B: GlobalAlloc>(self, upstream: &B, layout: Layout) {
        // SAFETY: Forwarding the guarantee from the caller that this memory was obtained
        // from this upstream provider with this layout.
        unsafe {
            upstream.dealloc(self.base.as_ptr(), layout);
        }
    }

    /// Address of the first byte of the chunk.
    #[must_use]
    pub(crate) fn base_address(&self) -> usize {
        self.base.as_ptr().addr()
    }

    /// Returns a pointer to the block at `slot` for a pool with blocks of `block_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not less than [`BLOCKS_PER_CHUNK`].
    #[must_use]
    pub(crate) fn block_ptr(&self, slot: usize, block_size: NonZero<usize>) -> NonNull<u8> {
        assert!(
            slot < BLOCKS_PER_CHUNK.get(),
            "slot {slot} out of bounds in chunk of {BLOCKS_PER_CHUNK} blocks"
        );

        // Cannot overflow because the whole chunk was successfully allocated.
        let offset = slot.wrapping_mul(block_size.get());

        // SAFETY: The slot is within the chunk, so the offset stays inside the allocation.
        unsafe { self.base.add(offset) }
    }

    /// Whether the block at `slot` is currently handed out.
    #[must_use]
    pub(crate) fn is_occupied(&self, slot: usize) -> bool {
        self.occupied & slot_bit(slot) != 0
    }

    /// Marks the block at `slot` as handed out.
    ///
    /// # Panics
    ///
    /// Panics if the block is already handed out.
    pub(crate) fn mark_occupied(&mut self, slot: usize) {
        assert!(
            !self.is_occupied(slot),
            "block {slot} handed out twice from the same chunk"
        );

        self.occupied |= slot_bit(slot);
    }

    /// Marks the block at `slot` as free again.
    ///
    /// # Panics
    ///
    /// Panics if the block is not currently handed out.
    pub(crate) fn mark_vacant(&mut self, slot: usize) {
        assert!(
            self.is_occupied(slot),
            "block {slot} returned to its chunk but was not handed out"
        );

        self.occupied &= !slot_bit(slot);
    }

    /// Number of blocks of this chunk that are currently handed out.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn occupied_count(&self) -> usize {
        self.occupied.count_ones() as usize
    }
}

fn slot_bit(slot: usize) -> OccupancyMask {
    assert!(
        slot < BLOCKS_PER_CHUNK.get(),
        "slot {slot} out of bounds in chunk of {BLOCKS_PER_CHUNK} blocks"
    );

    // Cannot truncate, we just checked that slot < 64.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot is bounds-checked against the mask width"
    )]
    let shift = slot as u32;

    1 << shift
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::System;

    use static_assertions::{assert_not_impl_any, const_assert_eq};

    use super::*;

    // The occupancy mask has exactly one bit per block.
    const_assert_eq!(BLOCKS_PER_CHUNK.get(), OccupancyMask::BITS as usize);

    // Chunks hold raw memory and are not meant to cross threads.
    assert_not_impl_any!(Chunk: Send, Sync);

    fn layout_for(block_size: usize) -> Layout {
        Layout::from_size_align(block_size * BLOCKS_PER_CHUNK.get(), BLOCK_ALIGN).unwrap()
    }

    #[test]
    fn fresh_chunk_has_no_occupied_blocks() {
        let layout = layout_for(16);
        let chunk = Chunk::obtain(&System, layout).unwrap();

        assert_eq!(chunk.occupied_count(), 0);
        assert!(!chunk.is_occupied(0));
        assert!(!chunk.is_occupied(63));

        unsafe { chunk.release(&System, layout) };
    }

    #[test]
    fn block_pointers_are_spaced_by_block_size() {
        let layout = layout_for(48);
        let chunk = Chunk::obtain(&System, layout).unwrap();
        let block_size = NonZero::new(48).unwrap();

        let first = chunk.block_ptr(0, block_size);
        let second = chunk.block_ptr(1, block_size);
        let last = chunk.block_ptr(63, block_size);

        assert_eq!(first.as_ptr().addr(), chunk.base_address());
        assert_eq!(second.as_ptr().addr() - first.as_ptr().addr(), 48);
        assert_eq!(last.as_ptr().addr() - first.as_ptr().addr(), 63 * 48);
        assert_eq!(first.as_ptr().addr() % BLOCK_ALIGN, 0);

        unsafe { chunk.release(&System, layout) };
    }

    #[test]
    fn occupancy_round_trip() {
        let layout = layout_for(8);
        let mut chunk = Chunk::obtain(&System, layout).unwrap();

        chunk.mark_occupied(3);
        chunk.mark_occupied(63);
        assert_eq!(chunk.occupied_count(), 2);
        assert!(chunk.is_occupied(3));
        assert!(chunk.is_occupied(63));

        chunk.mark_vacant(3);
        assert_eq!(chunk.occupied_count(), 1);
        assert!(!chunk.is_occupied(3));

        unsafe { chunk.release(&System, layout) };
    }

    #[test]
    #[should_panic]
    fn double_occupy_panics() {
        let layout = layout_for(8);
        let mut chunk = Chunk::obtain(&System, layout).unwrap();

        chunk.mark_occupied(5);
        chunk.mark_occupied(5);
    }

    #[test]
    #[should_panic]
    fn vacating_free_block_panics() {
        let layout = layout_for(8);
        let mut chunk = Chunk::obtain(&System, layout).unwrap();

        chunk.mark_vacant(5);
    }

    #[test]
    #[should_panic]
    fn slot_out_of_bounds_panics() {
        let layout = layout_for(8);
        let chunk = Chunk::obtain(&System, layout).unwrap();

        _ = chunk.block_ptr(64, NonZero::new(8).unwrap());
    }
}
