//! Example of a container that keeps its nodes in pool blocks.
//!
//! A stack of strings is grown and shrunk repeatedly. After the first round, every node is served
//! from a recycled block and the upstream provider is not asked for more memory.

use std::ptr::NonNull;

use size_class_pool::PoolAllocator;

struct Node {
    value: String,
    next: Option<NonNull<Node>>,
}

struct Stack {
    head: Option<NonNull<Node>>,
    len: usize,
    allocator: PoolAllocator<Node>,
}

impl Stack {
    fn new(allocator: PoolAllocator<Node>) -> Self {
        Self {
            head: None,
            len: 0,
            allocator,
        }
    }

    fn push(&mut self, value: String) {
        let node = self
            .allocator
            .allocate(1)
            .expect("node size is far below the largest block size")
            .expect("one node is never a zero-sized request");

        // SAFETY: The block was just allocated for one Node and holds no value yet.
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
        self.len = self.len.wrapping_add(1);
    }

    fn pop(&mut self) -> Option<String> {
        let node = self.head?;

        // SAFETY: Every node on the stack was initialized in push() and is read out only once,
        // after which its memory is returned without dropping anything in place.
        let Node { value, next } = unsafe { node.read() };

        self.head = next;
        self.len = self.len.wrapping_sub(1);
        self.allocator.deallocate(Some(node), 1);

        Some(value)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

fn main() {
    let allocator = PoolAllocator::<Node>::new();
    let mut stack = Stack::new(allocator.clone());

    for round in 1..=3 {
        for i in 0..200 {
            stack.push(format!("item {i} of round {round}"));
        }

        println!(
            "Round {round}: {} items, {} chunks obtained so far",
            stack.len,
            allocator.chunk_count()
        );

        while stack.pop().is_some() {}
    }

    for stats in allocator.pool_stats() {
        println!(
            "Pool of {} byte blocks: {} chunks, {} blocks free, {} in use",
            stats.block_size(),
            stats.chunk_count(),
            stats.free(),
            stats.in_use()
        );
    }

    println!("Handles sharing the registry: {}", allocator.handle_count());
}
