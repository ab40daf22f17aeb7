use std::alloc::GlobalAlloc;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::rc::Rc;

use num_integer::Integer;

use crate::error::Result;
use crate::{BLOCK_ALIGN, DefaultUpstream, Error, PoolRegistry, PoolStats, SizeClassifier};

/// A typed, cloneable handle to a shared [`PoolRegistry`], serving arrays of `T`.
///
/// Every clone and every [`rebind()`](Self::rebind) of a handle shares the same registry. The
/// registry stays alive as long as at least one handle exists and is torn down, returning every
/// chunk to the upstream provider, when the last handle is dropped.
///
/// The handle translates element counts into byte counts and forwards to
/// [`PoolRegistry::allocate_bytes()`] and [`PoolRegistry::deallocate_bytes()`]. Like the
/// registry, it never initializes memory. Use [`construct()`](Self::construct) and
/// [`destroy()`](Self::destroy) to manage values in place.
///
/// # Example
///
/// ```rust
/// use size_class_pool::PoolAllocator;
///
/// let numbers = PoolAllocator::<u64>::new();
/// let names = numbers.rebind::<String>();
///
/// // Both handles draw from the same registry.
/// assert!(numbers == names);
///
/// let ptr = names.allocate(1).unwrap().unwrap();
///
/// // SAFETY: The block was just allocated for one String and is not yet initialized.
/// unsafe { names.construct(ptr, "hello".to_string()) };
///
/// // SAFETY: The block holds a valid String.
/// assert_eq!(unsafe { ptr.as_ref() }, "hello");
///
/// // SAFETY: The block holds a valid String that is not used afterwards.
/// unsafe { names.destroy(ptr) };
/// names.deallocate(Some(ptr), 1);
/// ```
///
/// # Single-threaded design
///
/// This type is neither [`Send`] nor [`Sync`]. All handles that share a registry must live on
/// the same thread.
pub struct PoolAllocator<T, B: GlobalAlloc = DefaultUpstream> {
    registry: Rc<RefCell<PoolRegistry<B>>>,

    _element: PhantomData<fn() -> T>,
}

impl<T> PoolAllocator<T> {
    /// Creates a handle to a new registry with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[must_use]
    pub fn new() -> Self {
        Self::from(PoolRegistry::new())
    }
}

impl<T> Default for PoolAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, B: GlobalAlloc> From<PoolRegistry<B>> for PoolAllocator<T, B> {
    /// Wraps a configured registry, making this handle its first owner.
    ///
    /// # Example
    ///
    /// ```rust
    /// use size_class_pool::{DropPolicy, PoolAllocator, PoolRegistry};
    ///
    /// let registry = PoolRegistry::builder()
    ///     .drop_policy(DropPolicy::MustNotDropBlocks)
    ///     .build();
    ///
    /// let allocator = PoolAllocator::<u32>::from(registry);
    /// assert_eq!(allocator.handle_count(), 1);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    fn from(registry: PoolRegistry<B>) -> Self {
        Self::with_shared(Rc::new(RefCell::new(registry)))
    }
}

impl<T, B: GlobalAlloc> PoolAllocator<T, B> {
    fn with_shared(registry: Rc<RefCell<PoolRegistry<B>>>) -> Self {
        assert!(
            mem::size_of::<T>() > 0,
            "PoolAllocator cannot serve zero-sized types"
        );

        Self {
            registry,
            _element: PhantomData,
        }
    }

    /// Hands out uninitialized memory for `n` consecutive values of `T`.
    ///
    /// Returns `Ok(None)` if `n` is zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlignmentUnsupported`] if `T` needs a stricter alignment than
    /// [`BLOCK_ALIGN`].
    ///
    /// Returns [`Error::SizeUnsupported`] if `n` exceeds [`max_size()`](Self::max_size).
    ///
    /// Returns [`Error::ResourceExhausted`] if the upstream provider could not supply more
    /// memory.
    pub fn allocate(&self, n: usize) -> Result<Option<NonNull<T>>> {
        if n == 0 {
            return Ok(None);
        }

        if mem::align_of::<T>() > BLOCK_ALIGN {
            return Err(Error::AlignmentUnsupported {
                align: mem::align_of::<T>(),
                max_align: BLOCK_ALIGN,
            });
        }

        let bytes = n
            .checked_mul(mem::size_of::<T>())
            .ok_or_else(|| Error::SizeUnsupported {
                bytes: usize::MAX,
                max_bytes: self.registry.borrow().max_block_size(),
            })?;

        let block = self.registry.borrow_mut().allocate_bytes(bytes)?;

        Ok(block.map(NonNull::cast))
    }

    /// Returns memory obtained from [`allocate()`](Self::allocate) with the same `n`.
    ///
    /// Any values still in the memory are not dropped. Passing `None` or zero does nothing.
    ///
    /// The memory may have been allocated through any handle that shares the registry, including
    /// handles for other element types, as long as the byte size is the same.
    ///
    /// # Panics
    ///
    /// Panics if the memory was not handed out by the shared registry for `n` values of `T` or
    /// has already been returned.
    pub fn deallocate(&self, ptr: Option<NonNull<T>>, n: usize) {
        let Some(ptr) = ptr else {
            return;
        };

        if n == 0 {
            return;
        }

        let bytes = n.checked_mul(mem::size_of::<T>()).unwrap_or_else(|| {
            panic!("returned {n} values of a type that could never have been allocated together")
        });

        self.registry
            .borrow_mut()
            .deallocate_bytes(Some(ptr.cast()), bytes);
    }

    /// The largest `n` for which [`allocate()`](Self::allocate) can succeed.
    ///
    /// This is zero if `T` needs a stricter alignment than [`BLOCK_ALIGN`].
    #[must_use]
    pub fn max_size(&self) -> usize {
        if mem::align_of::<T>() > BLOCK_ALIGN {
            return 0;
        }

        Integer::div_floor(
            &self.registry.borrow().max_block_size(),
            &mem::size_of::<T>(),
        )
    }

    /// Moves `value` into the memory at `ptr`, without dropping what was there before.
    ///
    /// # Safety
    ///
    /// `ptr` must point into memory obtained from this registry that is valid for writing a `T`.
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        // SAFETY: Forwarding the caller's guarantee that ptr is valid for writes of T.
        unsafe {
            ptr.write(value);
        }
    }

    /// Drops the value at `ptr` in place, leaving the memory allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid, initialized `T` that is not used again until it is
    /// reinitialized.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        // SAFETY: Forwarding the caller's guarantee that ptr holds a valid T we may drop.
        unsafe {
            ptr.drop_in_place();
        }
    }

    /// Creates a handle for element type `U` that shares the registry of this handle.
    ///
    /// # Panics
    ///
    /// Panics if `U` is a zero-sized type.
    #[must_use]
    pub fn rebind<U>(&self) -> PoolAllocator<U, B> {
        PoolAllocator::with_shared(Rc::clone(&self.registry))
    }

    /// Number of handles, of any element type, that share this registry.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.registry)
    }

    /// The classifier of the shared registry.
    #[must_use]
    pub fn classifier(&self) -> SizeClassifier {
        self.registry.borrow().classifier()
    }

    /// Number of chunks the shared registry has obtained from the upstream provider.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.registry.borrow().chunk_count()
    }

    /// Number of blocks handed out by the shared registry through any handle.
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.registry.borrow().blocks_in_use()
    }

    /// Snapshot of every pool of the shared registry, ordered by ascending block size.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.registry.borrow().pool_stats()
    }
}

impl<T, B: GlobalAlloc> Clone for PoolAllocator<T, B> {
    fn clone(&self) -> Self {
        Self {
            registry: Rc::clone(&self.registry),
            _element: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        // Assigning a handle to itself or to another handle of the same registry is a no-op.
        if !Rc::ptr_eq(&self.registry, &source.registry) {
            self.registry = Rc::clone(&source.registry);
        }
    }
}

impl<T, U, B: GlobalAlloc> PartialEq<PoolAllocator<U, B>> for PoolAllocator<T, B> {
    /// Handles are equal if they share a registry, so memory allocated through one can be
    /// returned through the other.
    fn eq(&self, other: &PoolAllocator<U, B>) -> bool {
        Rc::ptr_eq(&self.registry, &other.registry)
    }
}

impl<T, B: GlobalAlloc> Eq for PoolAllocator<T, B> {}

impl<T, B: GlobalAlloc + fmt::Debug> fmt::Debug for PoolAllocator<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("element", &std::any::type_name::<T>())
            .field("registry", &self.registry)
            .finish()
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
    use std::cell::Cell;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{BLOCKS_PER_CHUNK, DropPolicy, MAX_BOUNDED_BLOCK_SIZE, MockUpstream};

    assert_impl_all!(PoolAllocator<u64>: Clone, Default, Eq, fmt::Debug);
    assert_not_impl_any!(PoolAllocator<u64>: Send, Sync);

    fn mock_allocator<T>(upstream: MockUpstream) -> PoolAllocator<T, MockUpstream> {
        PoolAllocator::from(PoolRegistry::builder().upstream(upstream).build())
    }

    #[test]
    fn zero_elements_touch_nothing() {
        let mut upstream = MockUpstream::new();
        upstream.expect_alloc().never();
        upstream.expect_dealloc().never();

        let allocator = mock_allocator::<u32>(upstream);

        assert_eq!(allocator.allocate(0).unwrap(), None);
        allocator.deallocate(None, 0);
        allocator.deallocate(None, 5);

        assert!(allocator.pool_stats().is_empty());
    }

    #[test]
    fn element_count_is_scaled_to_bytes() {
        let allocator = PoolAllocator::<u64>::new();

        let ptr = allocator.allocate(5).unwrap();

        let stats = allocator.pool_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].block_size().get(), 40);

        allocator.deallocate(ptr, 5);
        assert_eq!(allocator.blocks_in_use(), 0);
    }

    #[test]
    fn max_size_scales_with_element_size() {
        let bytes = PoolAllocator::<u8>::new();
        let words = PoolAllocator::<u64>::new();
        let triples = PoolAllocator::<[u8; 3]>::new();

        assert_eq!(bytes.max_size(), MAX_BOUNDED_BLOCK_SIZE);
        assert_eq!(words.max_size(), MAX_BOUNDED_BLOCK_SIZE / 8);
        assert_eq!(triples.max_size(), MAX_BOUNDED_BLOCK_SIZE / 3);

        assert!(triples.allocate(triples.max_size()).unwrap().is_some());
        assert!(matches!(
            triples.allocate(triples.max_size() + 1),
            Err(Error::SizeUnsupported { .. })
        ));
    }

    #[test]
    fn element_count_overflow_is_unsupported() {
        let allocator = PoolAllocator::<u64>::new();

        assert_eq!(
            allocator.allocate(usize::MAX),
            Err(Error::SizeUnsupported {
                bytes: usize::MAX,
                max_bytes: MAX_BOUNDED_BLOCK_SIZE,
            })
        );
    }

    #[test]
    fn over_aligned_type_is_unsupported() {
        #[allow(dead_code, reason = "only the layout matters")]
        #[repr(align(16))]
        struct Wide(u8);

        let allocator = PoolAllocator::<Wide>::new();

        assert_eq!(
            allocator.allocate(1),
            Err(Error::AlignmentUnsupported {
                align: 16,
                max_align: BLOCK_ALIGN,
            })
        );
        assert_eq!(allocator.max_size(), 0);
        assert_eq!(allocator.chunk_count(), 0);
    }

    #[test]
    #[should_panic]
    fn zero_sized_type_panics() {
        _ = PoolAllocator::<()>::new();
    }

    #[test]
    #[should_panic]
    fn rebind_to_zero_sized_type_panics() {
        let allocator = PoolAllocator::<u8>::new();
        _ = allocator.rebind::<()>();
    }

    #[test]
    fn clones_and_rebinds_share_registry() {
        // One chunk serves every handle.
        let numbers = mock_allocator::<u64>(MockUpstream::serving(1));
        let copy = numbers.clone();
        let bytes = numbers.rebind::<[u8; 8]>();

        assert_eq!(numbers.handle_count(), 3);
        assert!(numbers == copy);
        assert!(numbers == bytes);

        // Same byte size, so memory can cross element types.
        let ptr = numbers.allocate(2).unwrap();
        bytes.deallocate(ptr.map(NonNull::cast), 2);
        assert_eq!(copy.blocks_in_use(), 0);
        assert_eq!(copy.chunk_count(), 1);
    }

    #[test]
    fn independent_handles_are_not_equal() {
        let a = PoolAllocator::<u32>::new();
        let b = PoolAllocator::<u32>::new();

        assert!(a != b);
        assert!(a == a.clone());
    }

    #[test]
    fn clone_from_switches_registry() {
        let a = PoolAllocator::<u32>::new();
        let mut b = PoolAllocator::<u32>::new();

        b.clone_from(&a);

        assert!(a == b);
        assert_eq!(a.handle_count(), 2);

        // Self-assignment keeps the count stable.
        let c = b.clone();
        b.clone_from(&c);
        assert_eq!(a.handle_count(), 3);
    }

    #[test]
    fn last_handle_tears_down_registry() {
        let (upstream, released) = MockUpstream::serving_with_release_count(2);

        let first = mock_allocator::<u16>(upstream);
        let mut handles: Vec<_> = (0..4).map(|_| first.rebind::<u32>()).collect();
        drop(first);

        for _ in 0..=BLOCKS_PER_CHUNK.get() {
            _ = handles[0].allocate(1).unwrap();
        }
        assert_eq!(handles[0].chunk_count(), 2);

        while handles.len() > 1 {
            handles.pop();
            assert_eq!(released.get(), 0);
        }

        assert_eq!(handles[0].handle_count(), 1);

        drop(handles);
        assert_eq!(released.get(), 2);
    }

    #[test]
    fn construct_and_destroy_manage_values_in_place() {
        struct Tracked<'a>(&'a Cell<usize>);

        impl Drop for Tracked<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Cell::new(0);
        let allocator = PoolAllocator::<Tracked<'_>>::new();

        let ptr = allocator.allocate(2).unwrap().unwrap();
        let second = unsafe { ptr.add(1) };

        unsafe {
            allocator.construct(ptr, Tracked(&drops));
            allocator.construct(second, Tracked(&drops));
        }
        assert_eq!(drops.get(), 0);

        unsafe {
            allocator.destroy(ptr);
            allocator.destroy(second);
        }
        assert_eq!(drops.get(), 2);

        allocator.deallocate(Some(ptr), 2);

        // Returning memory never drops values.
        assert_eq!(drops.get(), 2);
    }

    #[test]
    #[should_panic]
    fn must_not_drop_blocks_applies_to_last_handle() {
        let registry = PoolRegistry::builder()
            .drop_policy(DropPolicy::MustNotDropBlocks)
            .build();
        let allocator = PoolAllocator::<u64>::from(registry);
        let other = allocator.rebind::<u8>();

        _ = other.allocate(3).unwrap();

        drop(allocator);
        drop(other);
    }

    #[test]
    #[should_panic]
    fn deallocate_with_wrong_count_panics() {
        let allocator = PoolAllocator::<u64>::new();
        let ptr = allocator.allocate(1).unwrap();

        allocator.deallocate(ptr, 1000);
    }
}
