use std::alloc::{GlobalAlloc, Layout, alloc, dealloc};

#[cfg(test)]
mod mock;
#[cfg(test)]
pub(crate) use mock::*;

/// The upstream memory provider used when none is configured explicitly.
///
/// Chunks are requested from the process global allocator, i.e. whatever is registered via
/// `#[global_allocator]` (the system allocator if nothing is).
///
/// Any other [`GlobalAlloc`] implementation can serve as the upstream provider of a registry
/// via [`PoolRegistryBuilder::upstream()`][crate::PoolRegistryBuilder::upstream].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DefaultUpstream;

// SAFETY: We forward to the global allocator, which upholds the GlobalAlloc contract itself.
unsafe impl GlobalAlloc for DefaultUpstream {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantee that the layout has non-zero size.
        unsafe { alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantee that ptr came from alloc() with this layout.
        unsafe { dealloc(ptr, layout) }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(DefaultUpstream: Send, Sync, Copy, std::fmt::Debug);

    #[test]
    fn allocates_and_releases() {
        let layout = Layout::from_size_align(512, 8).unwrap();

        // SAFETY: The layout has non-zero size.
        let ptr = unsafe { DefaultUpstream.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr.addr() % 8, 0);

        // SAFETY: ptr was just allocated with this layout.
        unsafe { DefaultUpstream.dealloc(ptr, layout) };
    }
}
