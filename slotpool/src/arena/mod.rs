//! Per-pool carving of coarse blocks into fixed-size slots
//!
//! Every block requested from the [Environment] is laid out as:
//!
//! ```text
//! block                                                       block + block_size
//! +-----------+-----+--------+--------+-----     -----+--------+------+
//! | next blk  | pad | slot 0 | slot 1 |     ...       | slot n | tail |
//! +-----------+-----+--------+--------+-----     -----+--------+------+
//!  header      ^     ^ multiple of slot_size
//!              +---- pad_to(block + header, slot_size)
//! ```
//!
//! All arithmetic is done in byte offsets from the block base, never by
//! stepping a typed pointer, so the stride is always exactly `slot_size`.
//!
//! The cursor (`cur_offset`) is the offset of the next never-issued slot in
//! the newest block. The block counts as exhausted once the cursor reaches
//! `last_offset = block_size - slot_size + 1`, i.e. once a slot starting at the
//! cursor would no longer end at or before the block end. If the slot size
//! does not divide what remains after the header, the tail is wasted.
//!
//! Blocks form a singly linked list through their headers, newest first.
//! They are only given back to the environment when the arena is dropped.
//!
//! None of this is synchronized; the owning pool keeps the arena behind its block lock.

use std::{
    alloc::Layout,
    fmt::Debug,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    env::Environment,
    error::AllocError,
    util::{divroundup, pad_to, UsizePtr},
};

/// Width of the per-block header (one next-block pointer)
pub const BLOCK_HEADER_SIZE: usize = size_of::<*mut u8>();
/// Alignment blocks are requested with (enough for the header)
pub const BLOCK_ALIGN: usize = align_of::<*mut u8>();

/// Offset of the first slot in a block at `block_addr`
#[inline]
const fn first_slot_offset(block_addr: usize, slot_size: usize) -> usize {
    BLOCK_HEADER_SIZE + pad_to(block_addr + BLOCK_HEADER_SIZE, slot_size)
}

/// Counters reported by [BlockArena::stats]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Blocks currently held from the environment
    pub blocks: usize,
    /// Slots handed out by bump allocation (free list reuse not included)
    pub slots_issued: usize,
}

pub struct BlockArena<E: Environment> {
    env: E,
    block_layout: Layout,
    slot_size: usize,
    /// Newest block, head of the block list (null until the first block)
    first_block: *mut u8,
    /// Offset in `first_block` of the next never-issued slot
    cur_offset: usize,
    /// `cur_offset >= last_offset` means a new block is needed
    last_offset: usize,
    num_blocks: usize,
    slots_issued: usize,
}

// safety: the raw pointers are exclusively owned block memory
unsafe impl<E: Environment> Send for BlockArena<E> {}

impl<E: Environment> Debug for BlockArena<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockArena")
            .field("@addr", &(self as *const _))
            .field("block_layout", &self.block_layout)
            .field("slot_size", &self.slot_size)
            .field("first_block", &UsizePtr::from(self.first_block))
            .field("cur_offset", &self.cur_offset)
            .field("last_offset", &self.last_offset)
            .field("num_blocks", &self.num_blocks)
            .finish()
    }
}

impl<E: Environment> BlockArena<E> {
    /// Set up an empty arena; no memory is requested until the first [bump](Self::bump)
    ///
    /// Fails if a block of `block_size` could not hold the header, the
    /// worst-case alignment padding, and one slot.
    pub fn new(env: E, slot_size: usize, block_size: usize) -> Result<Self, AllocError> {
        if slot_size == 0 {
            return Err(AllocError::ZeroSlotSize);
        }
        let min_block = BLOCK_HEADER_SIZE
            .checked_add(slot_size - 1)
            .and_then(|x| x.checked_add(slot_size));
        if min_block.map_or(true, |min| block_size < min) {
            return Err(AllocError::BlockTooSmall {
                block_size,
                slot_size,
            });
        }
        let block_layout = Layout::from_size_align(block_size, BLOCK_ALIGN).map_err(|_| {
            AllocError::OutOfMemory {
                size: block_size,
                align: BLOCK_ALIGN,
            }
        })?;

        Ok(Self {
            env,
            block_layout,
            slot_size,
            first_block: ptr::null_mut(),
            cur_offset: 0,
            last_offset: 0,
            num_blocks: 0,
            slots_issued: 0,
        })
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_layout.size()
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            blocks: self.num_blocks,
            slots_issued: self.slots_issued,
        }
    }

    /// Request a fresh block, link it in as the newest, and point the cursor at its first slot
    ///
    /// Only called once the current block is exhausted: every block behind
    /// the newest one is assumed fully issued. On failure nothing changes
    /// (the arena stays exhausted).
    fn allocate_new_block(&mut self) -> Result<(), AllocError> {
        let block = self.env.allocate(self.block_layout)?.as_ptr();
        unsafe {
            // safety: block is at least BLOCK_HEADER_SIZE and aligned for a pointer
            block.cast::<*mut u8>().write(self.first_block);
        }
        debug_assert!(self.cur_offset >= self.last_offset);
        self.first_block = block;
        self.num_blocks += 1;

        self.cur_offset = first_slot_offset(block as usize, self.slot_size);
        self.last_offset = self.block_layout.size() - self.slot_size + 1;
        debug_assert!(self.cur_offset < self.last_offset);

        tracing::event!(
            Level::DEBUG,
            block = ?UsizePtr::from(block),
            slot_size = self.slot_size,
            first_slot_offset = self.cur_offset,
            num_blocks = self.num_blocks,
            "new block"
        );
        Ok(())
    }

    /// Hand out the next never-used slot, pulling in a new block if the current one is exhausted
    pub fn bump(&mut self) -> Result<NonNull<u8>, AllocError> {
        if self.cur_offset >= self.last_offset {
            self.allocate_new_block()?;
        }
        // safety: first_block is a live block and cur_offset + slot_size <= block_size
        let slot = unsafe { NonNull::new_unchecked(self.first_block.add(self.cur_offset)) };
        self.cur_offset += self.slot_size;
        self.slots_issued += 1;
        Ok(slot)
    }

    /// Iterate over `(block base, first slot offset, end offset)` of every block, newest first
    ///
    /// `end offset` is the first offset that has never been handed out
    /// (the cursor for the newest block).
    fn issued_ranges(&self) -> impl Iterator<Item = (*mut u8, usize, usize)> + '_ {
        let slot_size = self.slot_size;
        let full_end = self.block_layout.size() - slot_size + 1;
        let mut block = self.first_block;
        let mut is_newest = true;
        std::iter::from_fn(move || {
            if block.is_null() {
                return None;
            }
            let this = block;
            let start = first_slot_offset(this as usize, slot_size);
            let end = if is_newest {
                self.cur_offset
            } else {
                // round the boundary up to the stride: every slot below it was issued
                start + divroundup(full_end - start, slot_size) * slot_size
            };
            is_newest = false;
            // safety: every block on the list starts with a valid header
            block = unsafe { this.cast::<*mut u8>().read() };
            Some((this, start, end))
        })
    }

    /// Whether `ptr` is the start of a slot this arena has handed out
    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.issued_ranges().any(|(block, start, end)| {
            let base = block as usize;
            addr >= base + start && addr < base + end && (addr - base - start) % self.slot_size == 0
        })
    }

    /// Call `f` on every slot ever handed out by bump allocation
    pub fn for_each_issued_slot<F: FnMut(NonNull<u8>)>(&self, mut f: F) {
        for (block, start, end) in self.issued_ranges() {
            let mut off = start;
            while off < end {
                // safety: within a live block
                f(unsafe { NonNull::new_unchecked(block.add(off)) });
                off += self.slot_size;
            }
        }
    }
}

impl<E: Environment> Drop for BlockArena<E> {
    fn drop(&mut self) {
        let mut block = self.first_block;
        let mut released = 0;
        while let Some(this) = NonNull::new(block) {
            // header has to be read before the block goes away
            block = unsafe { this.as_ptr().cast::<*mut u8>().read() };
            unsafe { self.env.release(this, self.block_layout) };
            released += 1;
        }
        debug_assert_eq!(released, self.num_blocks);
        tracing::event!(
            Level::DEBUG,
            slot_size = self.slot_size,
            released,
            "arena torn down"
        );
    }
}
