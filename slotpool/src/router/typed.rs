//! Construct and destroy whole objects through the size classes
//!
//! The size key is always `size_of::<T>()` (padded to `align_of::<T>()`),
//! so an object has to be destroyed as the same `T` it was constructed as.

use std::{alloc::Layout, mem, ptr::NonNull};

use crate::{env::Environment, error::AllocError, free_list::SlotStack};

use super::SizeRouter;

/// Hands the storage back if constructing the value panics
struct ReclaimOnUnwind<'r, E: Environment + Clone, S: SlotStack> {
    router: &'r SizeRouter<E, S>,
    ptr: NonNull<u8>,
    layout: Layout,
}

impl<'r, E: Environment + Clone, S: SlotStack> Drop for ReclaimOnUnwind<'r, E, S> {
    fn drop(&mut self) {
        // safety: ptr came from alloc_nonzero(layout) and was never initialized
        unsafe { self.router.free_nonzero(self.ptr, self.layout) };
    }
}

impl<E: Environment + Clone, S: SlotStack> SizeRouter<E, S> {
    /// Move `value` into pool memory
    pub fn construct_typed<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        self.construct_with(move || value)
    }

    /// Allocate storage for a `T`, then build it in place with `f`
    ///
    /// `f` only runs if the allocation succeeded. Zero sized types never touch
    /// the pools and get a dangling (but well aligned) pointer.
    pub fn construct_with<T, F: FnOnce() -> T>(&self, f: F) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::new::<T>().pad_to_align();
        if layout.size() == 0 {
            let p = NonNull::<T>::dangling();
            // safety: any well aligned pointer is valid for a ZST write
            unsafe { p.as_ptr().write(f()) };
            return Ok(p);
        }

        let raw = self.alloc_nonzero(layout)?;
        let guard = ReclaimOnUnwind {
            router: self,
            ptr: raw,
            layout,
        };
        let value = f();
        mem::forget(guard);

        let p = raw.cast::<T>();
        debug_assert!(p.as_ptr() as usize % mem::align_of::<T>() == 0);
        // safety: raw is fresh storage of at least size_of::<T>() bytes, suitably aligned
        unsafe { p.as_ptr().write(value) };
        Ok(p)
    }

    /// Drop the `T` at `ptr` and give its storage back; null is ignored
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from [construct_typed](Self::construct_typed)
    /// or [construct_with](Self::construct_with) on this router *as a `T`*,
    /// and must not have been destroyed already.
    pub unsafe fn destroy_typed<T>(&self, ptr: *mut T) {
        let Some(p) = NonNull::new(ptr) else {
            return;
        };
        p.as_ptr().drop_in_place();

        let layout = Layout::new::<T>().pad_to_align();
        if layout.size() == 0 {
            return;
        }
        self.free_nonzero(p.cast(), layout);
    }
}
