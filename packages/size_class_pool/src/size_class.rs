use std::num::NonZero;

use num_integer::Integer;

use crate::error::Result;
use crate::{BLOCK_ALIGN, BLOCKS_PER_CHUNK, Error};

/// One tier of the bounded size class table.
///
/// Block sizes in a tier run from `min` to `max` (both inclusive) in increments of `step`.
/// The `min` of each tier is exactly one `step` above the `max` of the previous tier and every
/// `max` is a multiple of the next tier's `step`, which is what makes rounding up within a tier
/// land on the smallest class that can hold the request.
#[derive(Clone, Copy, Debug)]
struct Tier {
    min: usize,
    max: usize,
    step: usize,
}

impl Tier {
    #[expect(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "tier bounds are compile-time constants that divide evenly"
    )]
    const fn class_count(&self) -> usize {
        (self.max - self.min) / self.step + 1
    }
}

/// Larger tiers use coarser steps. This bounds the relative waste per block while keeping the
/// number of classes (and therefore pools) small.
const TIERS: [Tier; 4] = [
    Tier {
        min: 8,
        max: 128,
        step: 8,
    },
    Tier {
        min: 144,
        max: 512,
        step: 16,
    },
    Tier {
        min: 544,
        max: 2048,
        step: 32,
    },
    Tier {
        min: 2112,
        max: 8192,
        step: 64,
    },
];

/// Number of size classes in the bounded table (16 + 24 + 48 + 96).
pub const BOUNDED_CLASS_COUNT: usize = count_bounded_classes();

/// The largest request, in bytes, that the bounded table can serve.
pub const MAX_BOUNDED_BLOCK_SIZE: usize = TIERS[TIERS.len() - 1].max;

#[expect(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "evaluated at compile time over a fixed table"
)]
const fn count_bounded_classes() -> usize {
    let mut total = 0;
    let mut tier_index = 0;

    while tier_index < TIERS.len() {
        total += TIERS[tier_index].class_count();
        tier_index += 1;
    }

    total
}

/// A size class: a stable index together with the canonical block size that serves every
/// request mapped to that index.
///
/// # Example
///
/// ```rust
/// use size_class_pool::SizeClassifier;
///
/// let class = SizeClassifier::BoundedTable.bytes_to_class(130).unwrap();
///
/// assert_eq!(class.block_size().get(), 144);
/// assert_eq!(class.index(), 16);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SizeClass {
    index: usize,
    block_size: NonZero<usize>,
}

impl SizeClass {
    /// The stable index of the class within its classifier.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The size of every block handed out for requests in this class.
    #[must_use]
    #[inline]
    pub fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }
}

/// Maps request sizes in bytes to size classes and back.
///
/// The mapping is a pure function of the classifier value, so the block size of a block can be
/// re-derived at free time from the byte count the caller passes in. No per-block metadata is
/// kept anywhere.
///
/// Both variants guarantee that for every supported byte count `b`, the block size of
/// `bytes_to_class(b)` is the smallest class block size that is at least `b`, and that
/// `bytes_to_class(class_to_bytes(i))` yields `i` again for every valid index `i`.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZero;
///
/// use size_class_pool::SizeClassifier;
///
/// let bounded = SizeClassifier::BoundedTable;
/// assert_eq!(bounded.bytes_to_class(9).unwrap().block_size().get(), 16);
/// assert!(bounded.bytes_to_class(8193).is_err());
///
/// let dynamic = SizeClassifier::dynamic_list(NonZero::new(32).unwrap());
/// assert_eq!(dynamic.bytes_to_class(8193).unwrap().block_size().get(), 8224);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum SizeClassifier {
    /// Four tiers with growing step size, covering 8 to 8192 bytes in
    /// [`BOUNDED_CLASS_COUNT`] classes. Pools are kept in a table indexed by class index.
    #[default]
    BoundedTable,

    /// A single granularity without tiers. Every multiple of `granularity` is its own class and
    /// pools are created on demand and searched by block size.
    ///
    /// Use [`SizeClassifier::dynamic_list()`] to create this variant.
    #[non_exhaustive]
    DynamicList {
        /// Requests are rounded up to a multiple of this many bytes.
        granularity: NonZero<usize>,
    },
}

impl SizeClassifier {
    /// Creates a [`SizeClassifier::DynamicList`] that rounds requests up to a multiple of
    /// `granularity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is not a multiple of [`BLOCK_ALIGN`], as blocks would then lose
    /// their alignment guarantee.
    ///
    /// Panics if `granularity` is so large that a chunk of even one class would not form a valid
    /// memory layout.
    #[must_use]
    pub fn dynamic_list(granularity: NonZero<usize>) -> Self {
        assert!(
            Integer::is_multiple_of(&granularity.get(), &BLOCK_ALIGN),
            "dynamic list granularity {granularity} must be a multiple of the block alignment {BLOCK_ALIGN}"
        );
        assert!(
            dynamic_max_block_size(granularity) >= granularity.get(),
            "dynamic list granularity {granularity} leaves no block size that fits in a chunk"
        );

        Self::DynamicList { granularity }
    }

    /// Maps a request size to the size class that serves it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeUnsupported`] if `bytes` is zero or exceeds
    /// [`max_block_size()`](Self::max_block_size).
    pub fn bytes_to_class(self, bytes: usize) -> Result<SizeClass> {
        let class = match self {
            Self::BoundedTable => bounded_class_of(bytes),
            Self::DynamicList { granularity } => dynamic_class_of(bytes, granularity),
        };

        class.ok_or(Error::SizeUnsupported {
            bytes,
            max_bytes: self.max_block_size(),
        })
    }

    /// Maps a class index back to the block size of that class.
    ///
    /// Returns `None` if the index does not name a class of this classifier.
    #[must_use]
    pub fn class_to_bytes(self, index: usize) -> Option<usize> {
        match self {
            Self::BoundedTable => bounded_block_size(index),
            Self::DynamicList { granularity } => dynamic_block_size(index, granularity),
        }
    }

    /// The largest request, in bytes, that this classifier maps to a class.
    #[must_use]
    pub fn max_block_size(self) -> usize {
        match self {
            Self::BoundedTable => MAX_BOUNDED_BLOCK_SIZE,
            Self::DynamicList { granularity } => dynamic_max_block_size(granularity),
        }
    }

    /// The number of distinct size classes this classifier can produce.
    #[must_use]
    pub fn class_count(self) -> usize {
        match self {
            Self::BoundedTable => BOUNDED_CLASS_COUNT,
            Self::DynamicList { granularity } => {
                Integer::div_floor(&dynamic_max_block_size(granularity), &granularity.get())
            }
        }
    }
}

fn bounded_class_of(bytes: usize) -> Option<SizeClass> {
    let mut first_index_in_tier: usize = 0;

    for tier in &TIERS {
        if bytes <= tier.max {
            // Zero bytes round to zero, which falls below the first tier and yields `None` here.
            let block_size = bytes.checked_next_multiple_of(tier.step)?;
            let index_in_tier = Integer::div_floor(&block_size.checked_sub(tier.min)?, &tier.step);

            return Some(SizeClass {
                index: first_index_in_tier.checked_add(index_in_tier)?,
                block_size: NonZero::new(block_size)?,
            });
        }

        first_index_in_tier = first_index_in_tier.checked_add(tier.class_count())?;
    }

    None
}

fn bounded_block_size(index: usize) -> Option<usize> {
    let mut index_in_tier = index;

    for tier in &TIERS {
        let class_count = tier.class_count();

        if index_in_tier < class_count {
            return tier.min.checked_add(index_in_tier.checked_mul(tier.step)?);
        }

        // Cannot wrap, we just checked that the index is at least the class count.
        index_in_tier = index_in_tier.wrapping_sub(class_count);
    }

    None
}

/// The chunk for the largest block still has to form a valid `Layout`, which caps the
/// size of a dynamic class well below `usize::MAX`.
fn dynamic_max_block_size(granularity: NonZero<usize>) -> usize {
    // Layout requires the size, rounded up to the alignment, to not exceed `isize::MAX`.
    let max_chunk_size = isize::MAX
        .unsigned_abs()
        .saturating_sub(BLOCK_ALIGN.saturating_sub(1));
    let max_block_size = Integer::div_floor(&max_chunk_size, &BLOCKS_PER_CHUNK.get());

    Integer::div_floor(&max_block_size, &granularity.get()).saturating_mul(granularity.get())
}

fn dynamic_class_of(bytes: usize, granularity: NonZero<usize>) -> Option<SizeClass> {
    if bytes == 0 || bytes > dynamic_max_block_size(granularity) {
        return None;
    }

    let block_size = bytes.checked_next_multiple_of(granularity.get())?;

    Some(SizeClass {
        index: Integer::div_floor(&block_size, &granularity.get()).checked_sub(1)?,
        block_size: NonZero::new(block_size)?,
    })
}

fn dynamic_block_size(index: usize, granularity: NonZero<usize>) -> Option<usize> {
    let block_size = index.checked_add(1)?.checked_mul(granularity.get())?;

    (block_size <= dynamic_max_block_size(granularity)).then_some(block_size)
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, const_assert_eq};

    use super::*;

    assert_impl_all!(SizeClassifier: Copy, Send, Sync, std::fmt::Debug);
    assert_impl_all!(SizeClass: Copy, Send, Sync, std::fmt::Debug);

    const_assert_eq!(BOUNDED_CLASS_COUNT, 184);
    const_assert_eq!(MAX_BOUNDED_BLOCK_SIZE, 8192);

    fn block_size_of(classifier: SizeClassifier, bytes: usize) -> usize {
        classifier
            .bytes_to_class(bytes)
            .expect("size is within the supported range")
            .block_size()
            .get()
    }

    #[test]
    fn eight_bytes_is_first_class() {
        let class = SizeClassifier::BoundedTable.bytes_to_class(8).unwrap();

        assert_eq!(class.index(), 0);
        assert_eq!(class.block_size().get(), 8);
    }

    #[test]
    fn nine_bytes_rounds_to_sixteen() {
        assert_eq!(block_size_of(SizeClassifier::BoundedTable, 9), 16);
        assert_eq!(block_size_of(SizeClassifier::BoundedTable, 1), 8);
    }

    #[test]
    fn tier_boundaries_round_into_next_tier() {
        let classifier = SizeClassifier::BoundedTable;

        assert_eq!(block_size_of(classifier, 128), 128);
        assert_eq!(block_size_of(classifier, 129), 144);
        assert_eq!(block_size_of(classifier, 130), 144);
        assert_eq!(block_size_of(classifier, 512), 512);
        assert_eq!(block_size_of(classifier, 513), 544);
        assert_eq!(block_size_of(classifier, 2048), 2048);
        assert_eq!(block_size_of(classifier, 2049), 2112);
        assert_eq!(block_size_of(classifier, 8192), 8192);
    }

    #[test]
    fn tier_first_indexes_follow_cumulative_counts() {
        let classifier = SizeClassifier::BoundedTable;

        assert_eq!(classifier.bytes_to_class(128).unwrap().index(), 15);
        assert_eq!(classifier.bytes_to_class(144).unwrap().index(), 16);
        assert_eq!(classifier.bytes_to_class(544).unwrap().index(), 40);
        assert_eq!(classifier.bytes_to_class(2112).unwrap().index(), 88);
        assert_eq!(classifier.bytes_to_class(8192).unwrap().index(), 183);
    }

    #[test]
    fn zero_bytes_is_unsupported() {
        assert_eq!(
            SizeClassifier::BoundedTable.bytes_to_class(0),
            Err(Error::SizeUnsupported {
                bytes: 0,
                max_bytes: MAX_BOUNDED_BLOCK_SIZE
            })
        );
    }

    #[test]
    fn above_largest_tier_is_unsupported() {
        assert_eq!(
            SizeClassifier::BoundedTable.bytes_to_class(8193),
            Err(Error::SizeUnsupported {
                bytes: 8193,
                max_bytes: MAX_BOUNDED_BLOCK_SIZE
            })
        );

        assert!(
            SizeClassifier::BoundedTable
                .bytes_to_class(usize::MAX)
                .is_err()
        );
    }

    #[test]
    fn bounded_block_size_is_minimal_covering_class() {
        let classifier = SizeClassifier::BoundedTable;
        let all_block_sizes: Vec<usize> = (0..BOUNDED_CLASS_COUNT)
            .map(|index| classifier.class_to_bytes(index).unwrap())
            .collect();

        for bytes in 1..=MAX_BOUNDED_BLOCK_SIZE {
            let block_size = block_size_of(classifier, bytes);

            assert!(block_size >= bytes);

            let smallest_covering = all_block_sizes
                .iter()
                .copied()
                .filter(|&candidate| candidate >= bytes)
                .min()
                .unwrap();
            assert_eq!(block_size, smallest_covering, "for {bytes} bytes");
        }
    }

    #[test]
    fn bounded_mapping_is_monotone() {
        let classifier = SizeClassifier::BoundedTable;
        let mut previous = classifier.bytes_to_class(1).unwrap();

        for bytes in 2..=MAX_BOUNDED_BLOCK_SIZE {
            let current = classifier.bytes_to_class(bytes).unwrap();

            assert!(current.index() >= previous.index());
            assert!(current.block_size() >= previous.block_size());

            previous = current;
        }
    }

    #[test]
    fn bounded_class_round_trip() {
        let classifier = SizeClassifier::BoundedTable;

        for index in 0..BOUNDED_CLASS_COUNT {
            let block_size = classifier.class_to_bytes(index).unwrap();
            let class = classifier.bytes_to_class(block_size).unwrap();

            assert_eq!(class.index(), index);
            assert_eq!(class.block_size().get(), block_size);
        }
    }

    #[test]
    fn bounded_block_sizes_are_block_aligned() {
        let classifier = SizeClassifier::BoundedTable;

        for index in 0..BOUNDED_CLASS_COUNT {
            let block_size = classifier.class_to_bytes(index).unwrap();
            assert_eq!(block_size % BLOCK_ALIGN, 0);
        }
    }

    #[test]
    fn bounded_index_out_of_range_is_none() {
        assert_eq!(
            SizeClassifier::BoundedTable.class_to_bytes(BOUNDED_CLASS_COUNT),
            None
        );
        assert_eq!(SizeClassifier::BoundedTable.class_to_bytes(usize::MAX), None);
    }

    #[test]
    fn dynamic_rounds_to_granularity() {
        let classifier = SizeClassifier::dynamic_list(nz!(16));

        assert_eq!(block_size_of(classifier, 1), 16);
        assert_eq!(block_size_of(classifier, 16), 16);
        assert_eq!(block_size_of(classifier, 17), 32);
        assert_eq!(block_size_of(classifier, 100_000), 100_000);
        assert_eq!(block_size_of(classifier, 100_001), 100_016);

        assert_eq!(classifier.bytes_to_class(17).unwrap().index(), 1);
    }

    #[test]
    fn dynamic_block_size_is_minimal_covering_multiple() {
        const GRANULARITY: usize = 24;

        let classifier = SizeClassifier::dynamic_list(NonZero::new(GRANULARITY).unwrap());

        let mut previous = classifier.bytes_to_class(1).unwrap();

        for bytes in 1..5000 {
            let class = classifier.bytes_to_class(bytes).unwrap();
            let block_size = class.block_size().get();

            assert!(block_size >= bytes, "{bytes} bytes got a {block_size} byte block");
            assert!(
                block_size - bytes < GRANULARITY,
                "{bytes} bytes got a {block_size} byte block"
            );
            assert_eq!(block_size % GRANULARITY, 0);

            assert!(class.index() >= previous.index());
            assert!(class.block_size() >= previous.block_size());
            previous = class;
        }
    }

    #[test]
    fn dynamic_class_round_trip() {
        let classifier = SizeClassifier::dynamic_list(nz!(8));

        for index in (0..10_000).chain([classifier.class_count() - 1]) {
            let block_size = classifier.class_to_bytes(index).unwrap();
            assert_eq!(classifier.bytes_to_class(block_size).unwrap().index(), index);
        }

        assert_eq!(classifier.class_to_bytes(classifier.class_count()), None);
    }

    #[test]
    fn dynamic_rejects_zero_and_oversized() {
        let classifier = SizeClassifier::dynamic_list(nz!(64));

        assert!(classifier.bytes_to_class(0).is_err());
        assert!(classifier.bytes_to_class(usize::MAX).is_err());

        let max = classifier.max_block_size();
        assert_eq!(block_size_of(classifier, max), max);
        assert!(classifier.bytes_to_class(max + 1).is_err());
    }

    #[test]
    fn dynamic_largest_chunk_forms_valid_layout() {
        let classifier = SizeClassifier::dynamic_list(nz!(8));
        let chunk_size = classifier.max_block_size() * BLOCKS_PER_CHUNK.get();

        assert!(std::alloc::Layout::from_size_align(chunk_size, BLOCK_ALIGN).is_ok());
    }

    #[test]
    #[should_panic]
    fn dynamic_granularity_must_keep_block_alignment() {
        let _classifier = SizeClassifier::dynamic_list(nz!(12));
    }

    #[test]
    #[should_panic]
    fn dynamic_granularity_must_fit_in_a_chunk() {
        let granularity =
            NonZero::new((usize::MAX / BLOCKS_PER_CHUNK.get() + 1).next_multiple_of(BLOCK_ALIGN))
                .unwrap();

        let _classifier = SizeClassifier::dynamic_list(granularity);
    }

    #[test]
    fn default_is_bounded_table() {
        assert_eq!(SizeClassifier::default(), SizeClassifier::BoundedTable);
    }
}
