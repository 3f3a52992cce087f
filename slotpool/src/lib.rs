//! Fixed size class slab allocator
//!
//! Small requests are rounded up to one of [NUM_SIZE_CLASSES] size classes
//! ([SLOT_BASE_SIZE] bytes apart). Each class is a [SizeClassPool] that
//! carves equal slots out of large blocks and recycles freed slots through a
//! lock-free stack. Anything bigger than [MAX_SLOT_SIZE] goes straight to the
//! underlying [Environment].

pub mod arena;
pub mod env;
pub mod error;
pub mod free_list;
#[cfg(not(loom))]
pub mod global;
mod loom_testing;
pub mod pool;
pub mod router;
pub mod util;

pub use env::{Environment, SystemEnv};
pub use error::AllocError;
pub use free_list::{NaiveFreeList, SlotStack, TaggedFreeList};
pub use pool::{PoolStats, SizeClassPool};
pub use router::{RouterConfig, SizeRouter};

/// Granularity of size classes
pub const SLOT_BASE_SIZE: usize = 8;
pub const NUM_SIZE_CLASSES: usize = 64;
/// Largest request served from a pool
pub const MAX_SLOT_SIZE: usize = SLOT_BASE_SIZE * NUM_SIZE_CLASSES;
const _: () = assert!(MAX_SLOT_SIZE == 512);
/// Size of every block a pool requests from its environment
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
