//! Single size class allocator
//!
//! A [SizeClassPool] hands out slots of exactly one size. Returned slots go
//! onto a lock-free [SlotStack] and are reused first; only when that is empty
//! does allocation take the block lock and bump a fresh slot out of the
//! [BlockArena] (pulling a new block from the environment if necessary).
//!
//! ```text
//!   allocate ---> free_list.pop() --hit--> slot
//!                      |
//!                     miss
//!                      v
//!              lock(arena).bump() ---> slot
//!
//!   deallocate ---> free_list.push(slot)
//! ```
//!
//! Memory never goes back to the environment before the pool is dropped.
//! The pool does not check that a freed pointer came from it.

use std::{fmt::Debug, ptr::NonNull, sync::PoisonError};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{
    arena::BlockArena,
    env::{Environment, SystemEnv},
    error::AllocError,
    free_list::{SlotStack, TaggedFreeList, SLOT_LINK_ALIGN, SLOT_LINK_SIZE},
    loom_testing::*,
    util::UsizePtr,
    DEFAULT_BLOCK_SIZE,
};

/// Snapshot of a pool's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub slot_size: usize,
    pub block_size: usize,
    /// Blocks currently held from the environment
    pub blocks: usize,
    /// Slots ever carved out of blocks (reuse through the free list not counted)
    pub slots_issued: usize,
}

pub struct SizeClassPool<E: Environment = SystemEnv, S: SlotStack = TaggedFreeList> {
    slot_size: usize,
    free_list: S,
    /// Block lock. Only cursor, boundary, and block list live behind it.
    arena: Mutex<BlockArena<E>>,
}

impl<E: Environment, S: SlotStack + Debug> Debug for SizeClassPool<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassPool")
            .field("@addr", &(self as *const _))
            .field("slot_size", &self.slot_size)
            .field("free_list", &self.free_list)
            .field("arena", &*self.lock_arena())
            .finish()
    }
}

impl SizeClassPool {
    /// Pool of `slot_size` slots carved out of [DEFAULT_BLOCK_SIZE] blocks from the system allocator
    pub fn new(slot_size: usize) -> Result<Self, AllocError> {
        Self::with_env(slot_size, DEFAULT_BLOCK_SIZE, SystemEnv)
    }
}

impl<E: Environment, S: SlotStack> SizeClassPool<E, S> {
    /// Configure a pool
    ///
    /// `slot_size` is fixed for the life of the pool. It must be nonzero, large
    /// enough to hold a free list link, and a multiple of the link alignment.
    /// No memory is requested until the first allocation.
    pub fn with_env(slot_size: usize, block_size: usize, env: E) -> Result<Self, AllocError> {
        if slot_size == 0 {
            return Err(AllocError::ZeroSlotSize);
        }
        if slot_size < SLOT_LINK_SIZE {
            return Err(AllocError::SlotTooSmall {
                slot_size,
                min: SLOT_LINK_SIZE,
            });
        }
        if slot_size % SLOT_LINK_ALIGN != 0 {
            return Err(AllocError::MisalignedSlotSize {
                slot_size,
                align: SLOT_LINK_ALIGN,
            });
        }
        let arena = BlockArena::new(env, slot_size, block_size)?;

        Ok(Self {
            slot_size,
            free_list: S::default(),
            arena: Mutex::new(arena),
        })
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// A panic while holding the block lock cannot leave the arena half-updated
    /// (the only fallible step happens before anything is written), so poisoning is ignored.
    fn lock_arena(&self) -> MutexGuard<'_, BlockArena<E>> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get one slot
    ///
    /// The contents of the slot are unspecified.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "pool::allocate",
            slot_size = self.slot_size
        );
        let _span_enter = trace_span.enter();

        if let Some(slot) = self.free_list.pop() {
            tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot), reused = true);
            return Ok(slot);
        }

        let slot = self.lock_arena().bump()?;
        // safety: freshly carved, nobody else can see it yet
        #[cfg(loom)]
        unsafe {
            crate::free_list::FreeSlot::prepare(slot);
        }
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot), reused = false);
        Ok(slot)
    }

    /// Give a slot back for reuse; null is ignored
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a slot obtained from [allocate](Self::allocate)
    /// on this same pool that has not been deallocated since. The caller must
    /// not touch it afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(slot) = NonNull::new(ptr) else {
            return;
        };
        let trace_span = tracing::span!(
            Level::TRACE,
            "pool::deallocate",
            slot_size = self.slot_size
        );
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot));

        self.free_list.push(slot);
    }

    pub fn stats(&self) -> PoolStats {
        let arena = self.lock_arena();
        let arena_stats = arena.stats();
        PoolStats {
            slot_size: self.slot_size,
            block_size: arena.block_size(),
            blocks: arena_stats.blocks,
            slots_issued: arena_stats.slots_issued,
        }
    }

    /// Whether `ptr` is a slot this pool has carved out (free or not)
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.lock_arena().owns(ptr)
    }

    /// Slots that have been handed out and not given back
    ///
    /// Panics if the free list contains something that is not an issued slot,
    /// or contains the same slot twice.
    pub fn _debug_outstanding_slots(&mut self) -> FxHashSet<usize> {
        let mut outstanding = FxHashSet::default();
        self.lock_arena().for_each_issued_slot(|s| {
            outstanding.insert(s.as_ptr() as usize);
        });
        self.free_list.for_each_slot(|s| {
            let was_outstanding = outstanding.remove(&(s.as_ptr() as usize));
            if !was_outstanding {
                panic!(
                    "Free slot {:?} not issued by this pool or found on the free list twice",
                    UsizePtr::from(s)
                );
            }
        });
        outstanding
    }
}
