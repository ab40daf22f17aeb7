//! Tests for registries shared between typed handles.
//!
//! These tests observe the registry from the outside through a mock upstream provider,
//! verifying when chunks are obtained and when they are returned.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::num::NonZero;
use std::ptr::{self, NonNull};

use mockall::Sequence;
use size_class_pool::{BLOCKS_PER_CHUNK, Error, PoolAllocator, PoolRegistry, SizeClassifier};

#[path = "../src/upstream/mock.rs"]
mod mock;

use mock::{MockUpstream, system_alloc, system_dealloc};

fn mock_allocator<T>(upstream: MockUpstream) -> PoolAllocator<T, MockUpstream> {
    PoolAllocator::from(PoolRegistry::builder().upstream(upstream).build())
}

#[test]
fn registry_lives_until_last_handle_is_dropped() {
    const HANDLES: usize = 8;

    let (upstream, released) = MockUpstream::serving_with_release_count(1);
    let first = mock_allocator::<u64>(upstream);

    let mut handles = vec![first.clone()];
    for _ in 1..HANDLES {
        handles.push(handles[0].clone());
    }
    drop(first);

    assert_eq!(handles[0].handle_count(), HANDLES);

    for handle in &handles {
        _ = handle.allocate(1).unwrap();
    }
    assert_eq!(handles[0].chunk_count(), 1);

    while handles.len() > 1 {
        handles.pop();
        assert_eq!(released.get(), 0);
    }

    drop(handles);
    assert_eq!(released.get(), 1);
}

#[test]
fn rebound_handles_keep_registry_alive() {
    let (upstream, released) = MockUpstream::serving_with_release_count(1);

    let bytes = {
        let numbers = mock_allocator::<u32>(upstream);
        _ = numbers.allocate(3).unwrap();
        numbers.rebind::<u8>()
    };

    // The original handle is gone, the rebound one still sees its block.
    assert_eq!(bytes.handle_count(), 1);
    assert_eq!(bytes.blocks_in_use(), 1);
    assert_eq!(released.get(), 0);

    drop(bytes);
    assert_eq!(released.get(), 1);
}

#[test]
fn every_chunk_is_released_exactly_once() {
    // 1 and 8 bytes share the 8 byte class, whose 258 blocks need 5 chunks. The other four
    // classes need 3 chunks each.
    let (upstream, released) = MockUpstream::serving_with_release_count(17);
    let allocator = mock_allocator::<u8>(upstream);

    let mut blocks = Vec::new();
    for size in [1, 8, 200, 1000, 3000, 8000] {
        for _ in 0..(BLOCKS_PER_CHUNK.get() * 2 + 1) {
            blocks.push((allocator.allocate(size).unwrap(), size));
        }
    }

    // Give back every other block; the rest stays in use at teardown.
    for (ptr, size) in blocks.iter().step_by(2) {
        allocator.deallocate(*ptr, *size);
    }

    assert_eq!(allocator.chunk_count(), 17);
    assert_eq!(allocator.pool_stats().len(), 5);
    assert_eq!(released.get(), 0);

    drop(allocator);
    assert_eq!(released.get(), 17);
}

#[test]
fn refused_chunk_is_reported_and_recoverable() {
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
        .expect_alloc()
        .once()
        .in_sequence(&mut seq)
        .returning(system_alloc);
    upstream
        .expect_dealloc()
        .times(2)
        .returning(system_dealloc);

    let allocator = mock_allocator::<u64>(upstream);

    let held: Vec<_> = (0..BLOCKS_PER_CHUNK.get())
        .map(|_| allocator.allocate(2).unwrap())
        .collect();

    assert!(matches!(
        allocator.allocate(2),
        Err(Error::ResourceExhausted { chunk_bytes }) if chunk_bytes == 16 * BLOCKS_PER_CHUNK.get()
    ));
    assert_eq!(allocator.chunk_count(), 1);

    let extra = allocator.allocate(2).unwrap();
    assert!(extra.is_some());
    assert_eq!(allocator.chunk_count(), 2);

    for ptr in held {
        allocator.deallocate(ptr, 2);
    }
    allocator.deallocate(extra, 2);
    assert_eq!(allocator.blocks_in_use(), 0);
}

/// A minimal singly linked list whose nodes live in pool blocks.
struct List<'a> {
    head: Option<NonNull<Node>>,
    allocator: &'a PoolAllocator<Node, MockUpstream>,
}

struct Node {
    value: String,
    next: Option<NonNull<Node>>,
}

impl<'a> List<'a> {
    fn new(allocator: &'a PoolAllocator<Node, MockUpstream>) -> Self {
        Self {
            head: None,
            allocator,
        }
    }

    fn push(&mut self, value: String) {
        let node = self.allocator.allocate(1).unwrap().unwrap();
        unsafe {
            self.allocator.construct(
                node,
                Node {
                    value,
                    next: self.head,
                },
            );
        }
        self.head = Some(node);
    }

    fn pop(&mut self) -> Option<String> {
        let node = self.head?;
        let Node { value, next } = unsafe { node.read() };
        self.head = next;
        self.allocator.deallocate(Some(node), 1);
        Some(value)
    }
}

impl Drop for List<'_> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[test]
fn linked_list_recycles_nodes() {
    // 100 nodes need two chunks, later rounds only reuse them.
    let allocator = mock_allocator::<Node>(MockUpstream::serving(2));

    {
        let mut list = List::new(&allocator);

        for round in 0..3 {
            for i in 0..100 {
                list.push(format!("{round}-{i}"));
            }

            assert_eq!(list.pop().as_deref(), Some(format!("{round}-99").as_str()));

            while list.pop().is_some() {}
        }

        list.push("kept".to_string());
        assert_eq!(allocator.blocks_in_use(), 1);
    }

    assert_eq!(allocator.chunk_count(), 2);
    assert_eq!(allocator.blocks_in_use(), 0);
}

#[test]
fn dynamic_list_handles_large_arrays() {
    let registry = PoolRegistry::builder()
        .classifier(SizeClassifier::dynamic_list(NonZero::new(256).unwrap()))
        .build();
    let allocator = PoolAllocator::<u64>::from(registry);

    assert!(allocator.max_size() > 1024);

    let ptr = allocator.allocate(1024).unwrap().unwrap();

    for i in 0..1024 {
        unsafe { allocator.construct(ptr.add(i), i as u64) };
    }

    let sum: u64 = (0..1024).map(|i| unsafe { ptr.add(i).read() }).sum();
    assert_eq!(sum, 1023 * 1024 / 2);

    allocator.deallocate(Some(ptr), 1024);

    let stats = allocator.pool_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].block_size().get(), 8192);
    assert_eq!(stats[0].in_use(), 0);
}
