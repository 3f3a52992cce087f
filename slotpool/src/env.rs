//! The memory provider that pools carve blocks out of
//!
//! Everything the allocator ever gets from "outside" goes through an
//! [Environment]: whole blocks for the pools, and oversized requests that
//! bypass the size classes. Tests plug in an instrumented implementation to
//! count requests and releases.

use std::{alloc::Layout, ptr::NonNull, sync::Arc};

use crate::error::AllocError;

/// Source of raw memory
///
/// # Safety
///
/// `allocate` must return memory valid for reads and writes of `layout.size()`
/// bytes, aligned to `layout.align()`, and not handed out again until it is
/// passed back to `release`.
pub unsafe trait Environment: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Give memory back
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [Environment::allocate] on this same
    /// environment with exactly this `layout`, and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process allocator (`std::alloc`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

unsafe impl Environment for SystemEnv {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() != 0);
        // safety: callers never ask for zero sized layouts
        let p = unsafe { std::alloc::alloc(layout) };
        NonNull::new(p).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

unsafe impl<E: Environment + ?Sized> Environment for &E {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).release(ptr, layout)
    }
}

unsafe impl<E: Environment + ?Sized> Environment for Arc<E> {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).release(ptr, layout)
    }
}
