//! Dispatch of arbitrary sized requests to the right size class
//!
//! Size class `i` serves slots of `(i + 1) * base_slot_size` bytes. A request
//! of `s` bytes (`0 < s <= max_slot_size`) goes to class
//! `ceil(s / base_slot_size) - 1`. Larger requests skip the pools and go
//! straight to the environment.
//!
//! ```text
//!   size:   1..=8   9..=16   17..=24   ...   505..=512   513..
//!   class:    0       1         2      ...      63       (direct)
//! ```
//!
//! Freeing recomputes the class from the size, so it has to be given the
//! size that was originally asked for. Nothing checks this.

use std::{alloc::Layout, fmt::Debug, ptr::NonNull};

use tracing::Level;

use crate::{
    env::{Environment, SystemEnv},
    error::AllocError,
    free_list::{SlotStack, TaggedFreeList},
    pool::SizeClassPool,
    util::{divroundup, UsizePtr},
    DEFAULT_BLOCK_SIZE, NUM_SIZE_CLASSES, SLOT_BASE_SIZE,
};

mod typed;

/// Alignment of requests that bypass the pools, matching what the system allocator promises
pub const MIN_PASSTHROUGH_ALIGN: usize = 16;

/// Fixed parameters of a router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Granularity of size classes
    pub base_slot_size: usize,
    /// Number of size classes
    pub num_classes: usize,
    /// Block size of every pool
    pub block_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_slot_size: SLOT_BASE_SIZE,
            num_classes: NUM_SIZE_CLASSES,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl RouterConfig {
    /// Largest request served from a pool
    pub const fn max_slot_size(&self) -> usize {
        self.base_slot_size * self.num_classes
    }
}

/// Where a request of a given layout is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Pool(usize),
    Direct(Layout),
}

pub struct SizeRouter<E: Environment + Clone = SystemEnv, S: SlotStack = TaggedFreeList> {
    config: RouterConfig,
    /// Index `i` serves `(i + 1) * base_slot_size`, fully populated at construction
    pools: Box<[SizeClassPool<E, S>]>,
    /// Used for oversized requests
    env: E,
}

impl<E: Environment + Clone, S: SlotStack> Debug for SizeRouter<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeRouter")
            .field("@addr", &(self as *const _))
            .field("config", &self.config)
            .finish()
    }
}

impl SizeRouter {
    /// Router backed by the system allocator
    pub fn new(config: RouterConfig) -> Result<Self, AllocError> {
        Self::with_env(config, SystemEnv)
    }
}

impl Default for SizeRouter {
    fn default() -> Self {
        match Self::new(RouterConfig::default()) {
            Ok(x) => x,
            Err(e) => panic!("Default router configuration rejected: {}", e),
        }
    }
}

impl<E: Environment + Clone, S: SlotStack> SizeRouter<E, S> {
    /// Validate `config` and initialize every size class pool
    ///
    /// Every pool shares (a clone of) `env`. No blocks are requested yet.
    pub fn with_env(config: RouterConfig, env: E) -> Result<Self, AllocError> {
        if config.base_slot_size == 0 {
            return Err(AllocError::InvalidRouterConfig(
                "base slot size must not be zero",
            ));
        }
        if config.num_classes == 0 {
            return Err(AllocError::InvalidRouterConfig(
                "there must be at least one size class",
            ));
        }
        if config
            .base_slot_size
            .checked_mul(config.num_classes)
            .is_none()
        {
            return Err(AllocError::InvalidRouterConfig(
                "largest size class overflows",
            ));
        }

        let pools = Self::initialize_all(&config, &env)?;
        tracing::event!(
            Level::DEBUG,
            base_slot_size = config.base_slot_size,
            num_classes = config.num_classes,
            block_size = config.block_size,
            "size classes initialized"
        );

        Ok(Self { config, pools, env })
    }

    fn initialize_all(
        config: &RouterConfig,
        env: &E,
    ) -> Result<Box<[SizeClassPool<E, S>]>, AllocError> {
        (0..config.num_classes)
            .map(|i| {
                SizeClassPool::with_env(
                    (i + 1) * config.base_slot_size,
                    config.block_size,
                    env.clone(),
                )
            })
            .collect()
    }

    #[inline]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Size class that serves `size` bytes, or `None` for zero and oversized requests
    #[inline]
    pub fn class_index(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.config.max_slot_size() {
            None
        } else {
            Some(divroundup(size, self.config.base_slot_size) - 1)
        }
    }

    pub fn pool(&self, index: usize) -> Option<&SizeClassPool<E, S>> {
        self.pools.get(index)
    }

    /// Decide where a nonzero, padded layout is served from
    ///
    /// A pool only qualifies if its slot addresses (multiples of the slot size)
    /// also satisfy the alignment. With a power of two base this always holds.
    fn route(&self, layout: Layout) -> Route {
        debug_assert!(layout.size() != 0);
        match self.class_index(layout.size()) {
            Some(i) if self.pools[i].slot_size() % layout.align() == 0 => Route::Pool(i),
            _ => Route::Direct(layout),
        }
    }

    fn direct_layout(layout: Layout) -> Result<Layout, AllocError> {
        let align = layout.align().max(MIN_PASSTHROUGH_ALIGN);
        Layout::from_size_align(layout.size(), align).map_err(|_| AllocError::OutOfMemory {
            size: layout.size(),
            align,
        })
    }

    fn alloc_nonzero(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        match self.route(layout) {
            Route::Pool(i) => self.pools[i].allocate(),
            Route::Direct(layout) => self.env.allocate(Self::direct_layout(layout)?),
        }
    }

    unsafe fn free_nonzero(&self, ptr: NonNull<u8>, layout: Layout) {
        match self.route(layout) {
            Route::Pool(i) => self.pools[i].deallocate(ptr.as_ptr()),
            Route::Direct(layout) => match Self::direct_layout(layout) {
                Ok(layout) => self.env.release(ptr, layout),
                // could never have been allocated
                Err(_) => unreachable!(),
            },
        }
    }

    /// Get `size` bytes
    ///
    /// Zero bytes gives `Ok(None)`. Sizes above the largest class are
    /// allocated directly from the environment (aligned to [MIN_PASSTHROUGH_ALIGN]).
    pub fn use_memory(&self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let trace_span = tracing::span!(Level::TRACE, "router::use_memory", size);
        let _span_enter = trace_span.enter();

        if size == 0 {
            return Ok(None);
        }
        let layout = Layout::from_size_align(size, 1).map_err(|_| AllocError::OutOfMemory {
            size,
            align: MIN_PASSTHROUGH_ALIGN,
        })?;
        let ptr = self.alloc_nonzero(layout)?;
        tracing::event!(
            Level::TRACE,
            ptr = ?UsizePtr::from(ptr),
            class = ?self.class_index(size)
        );
        Ok(Some(ptr))
    }

    /// Give back memory from [use_memory](Self::use_memory); null is ignored
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from `use_memory(size)` on this router,
    /// with the *same* `size`, and must not have been freed since.
    /// A different size can land in a different pool and corrupt it.
    pub unsafe fn free_memory(&self, ptr: *mut u8, size: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let trace_span = tracing::span!(Level::TRACE, "router::free_memory", size);
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));

        debug_assert!(size != 0, "non-null pointer freed with size 0");
        if size == 0 {
            return;
        }
        // safety: size was accepted by use_memory, so this layout is valid
        let layout = Layout::from_size_align_unchecked(size, 1);
        self.free_nonzero(ptr, layout);
    }

    /// Layout aware version of [use_memory](Self::use_memory)
    ///
    /// The size is padded up to the alignment before picking a class.
    pub fn use_layout(&self, layout: Layout) -> Result<Option<NonNull<u8>>, AllocError> {
        let layout = layout.pad_to_align();
        if layout.size() == 0 {
            return Ok(None);
        }
        self.alloc_nonzero(layout).map(Some)
    }

    /// Give back memory from [use_layout](Self::use_layout); null is ignored
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from `use_layout(layout)` on this
    /// router with the same `layout`, and must not have been freed since.
    pub unsafe fn free_layout(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let layout = layout.pad_to_align();
        if layout.size() == 0 {
            return;
        }
        self.free_nonzero(ptr, layout);
    }
}

#[cfg(test)]
mod tests;
