//! Error type shared by every layer of the allocator
//!
//! Only configuration problems and environment exhaustion are reported.
//! Caller contract violations (wrong size on free, double free, foreign pointers)
//! are not detected at all; see the `# Safety` sections on the unsafe entry points.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("slot size must not be zero")]
    ZeroSlotSize,

    #[error("slot size {slot_size} cannot hold a free list link ({min} bytes)")]
    SlotTooSmall { slot_size: usize, min: usize },

    #[error("slot size {slot_size} is not a multiple of the free list link alignment {align}")]
    MisalignedSlotSize { slot_size: usize, align: usize },

    #[error("block size {block_size} cannot fit a header and one slot of {slot_size} bytes")]
    BlockTooSmall { block_size: usize, slot_size: usize },

    #[error("invalid router configuration: {0}")]
    InvalidRouterConfig(&'static str),

    #[error("environment could not supply {size} bytes (align {align})")]
    OutOfMemory { size: usize, align: usize },

    #[error("size class registry used before initialize_all()")]
    Uninitialized,
}
