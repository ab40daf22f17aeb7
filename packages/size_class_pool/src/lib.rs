//! A size-classed pool allocator that serves small blocks of memory from per-size free lists.
//!
//! Requests are rounded up to one of a fixed set of block sizes by a [`SizeClassifier`]. Each
//! block size is served by its own pool, which obtains memory from an upstream provider in chunks
//! of [`BLOCKS_PER_CHUNK`] blocks and recycles returned blocks through a free list. Memory is
//! only given back to the upstream provider when the whole [`PoolRegistry`] is torn down.
//!
//! # Key Features
//!
//! - **Fast recycling**: Returning and re-requesting a block is a stack push and pop
//! - **Few upstream calls**: One upstream request serves [`BLOCKS_PER_CHUNK`] blocks
//! - **Two classifiers**: A bounded table of 184 size classes up to
//!   [`MAX_BOUNDED_BLOCK_SIZE`] bytes, or a dynamic list of exact multiples of a granularity
//! - **Shared registries**: [`PoolAllocator<T>`] handles share one registry by reference
//!   counting, across clones and element types
//! - **Misuse detection**: Returning a foreign block or returning a block twice panics instead of
//!   corrupting the free list
//! - **Pluggable upstream**: Any [`GlobalAlloc`][std::alloc::GlobalAlloc] can supply the chunks
//! - **Flexible drop policies**: Optionally panic if blocks are still in use at teardown
//!
//! # Examples
//!
//! ## Untyped blocks from a registry
//!
//! ```rust
//! use size_class_pool::PoolRegistry;
//!
//! let mut registry = PoolRegistry::new();
//!
//! // 100 bytes round up to a 104 byte block.
//! let block = registry.allocate_bytes(100).unwrap();
//! assert_eq!(registry.pool_stats()[0].block_size().get(), 104);
//!
//! registry.deallocate_bytes(block, 100);
//! assert_eq!(registry.blocks_in_use(), 0);
//! ```
//!
//! ## Typed handles sharing a registry
//!
//! ```rust
//! use size_class_pool::PoolAllocator;
//!
//! let nodes = PoolAllocator::<[u64; 4]>::new();
//! let words = nodes.rebind::<u64>();
//!
//! assert_eq!(nodes.handle_count(), 2);
//!
//! // Memory of the same byte size can be returned through either handle.
//! let ptr = words.allocate(4).unwrap();
//! nodes.deallocate(ptr.map(|ptr| ptr.cast()), 1);
//! ```
//!
//! ## Custom configuration
//!
//! ```rust
//! use std::alloc::System;
//! use std::num::NonZero;
//!
//! use size_class_pool::{DropPolicy, PoolAllocator, PoolRegistry, SizeClassifier};
//!
//! let registry = PoolRegistry::builder()
//!     .classifier(SizeClassifier::dynamic_list(NonZero::new(64).unwrap()))
//!     .drop_policy(DropPolicy::MustNotDropBlocks)
//!     .upstream(System)
//!     .build();
//!
//! let buffers = PoolAllocator::<u8, System>::from(registry);
//!
//! // Sizes beyond the bounded table are fine with a dynamic list.
//! let ptr = buffers.allocate(100_000).unwrap();
//! buffers.deallocate(ptr, 100_000);
//! ```
//!
//! # Thread safety
//!
//! [`PoolRegistry`] is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
//! [`PoolAllocator`] is neither, as all handles of one registry share it without
//! synchronization.

mod allocator;
mod builder;
mod chunk;
mod drop_policy;
mod error;
mod pool;
mod pool_set;
mod registry;
mod size_class;
mod stats;
mod upstream;

pub use allocator::*;
pub use builder::*;
pub use chunk::{BLOCK_ALIGN, BLOCKS_PER_CHUNK};
pub(crate) use chunk::Chunk;
pub use drop_policy::*;
pub use error::Error;
pub(crate) use pool::*;
pub(crate) use pool_set::*;
pub use registry::*;
pub use size_class::*;
pub use stats::*;
pub use upstream::*;
