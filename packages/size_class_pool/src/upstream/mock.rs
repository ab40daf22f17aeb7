use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::rc::Rc;

use mockall::mock;

mock! {
    #[derive(Debug)]
    pub Upstream {
    }

    unsafe impl GlobalAlloc for Upstream {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8;
        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);
    }
}

impl MockUpstream {
    /// Expects exactly `chunks` chunk requests, all served by the system allocator, and the
    /// release of every one of them.
    pub(crate) fn serving(chunks: usize) -> Self {
        let mut upstream = Self::new();

        upstream
            .expect_alloc()
            .times(chunks)
            .returning(system_alloc);
        upstream
            .expect_dealloc()
            .times(chunks)
            .returning(system_dealloc);

        upstream
    }

    /// Like [`serving()`](Self::serving), also counting the chunks released so far, so tests
    /// can tell when teardown happens.
    pub(crate) fn serving_with_release_count(chunks: usize) -> (Self, Rc<Cell<usize>>) {
        let mut upstream = Self::new();
        let released = Rc::new(Cell::new(0_usize));

        upstream
            .expect_alloc()
            .times(chunks)
            .returning(system_alloc);
        upstream.expect_dealloc().times(chunks).returning_st({
            let released = Rc::clone(&released);
            move |ptr, layout| {
                released.set(released.get().wrapping_add(1));
                system_dealloc(ptr, layout);
            }
        });

        (upstream, released)
    }
}

/// Serves a chunk request from the system allocator.
pub(crate) fn system_alloc(layout: Layout) -> *mut u8 {
    // SAFETY: Chunk layouts never have zero size.
    unsafe { System.alloc(layout) }
}

/// Returns a chunk obtained via [`system_alloc()`] to the system allocator.
pub(crate) fn system_dealloc(ptr: *mut u8, layout: Layout) {
    // SAFETY: Chunks are only released once, with the layout they were obtained with.
    unsafe { System.dealloc(ptr, layout) }
}
