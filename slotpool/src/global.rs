//! One process-wide router with the default size classes
//!
//! [initialize_all] must run before anything else here. Until then the
//! fallible entry points return [AllocError::Uninitialized].

use std::{ptr::NonNull, sync::OnceLock};

use crate::{error::AllocError, router::SizeRouter};

static REGISTRY: OnceLock<SizeRouter> = OnceLock::new();

/// Set up all size classes; calling it again is harmless
pub fn initialize_all() -> &'static SizeRouter {
    REGISTRY.get_or_init(SizeRouter::default)
}

/// The registry, if [initialize_all] has run
pub fn registry() -> Result<&'static SizeRouter, AllocError> {
    registry_in(&REGISTRY)
}

fn registry_in(cell: &OnceLock<SizeRouter>) -> Result<&SizeRouter, AllocError> {
    cell.get().ok_or(AllocError::Uninitialized)
}

/// See [SizeRouter::use_memory]
pub fn use_memory(size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    registry()?.use_memory(size)
}

/// See [SizeRouter::free_memory]
///
/// # Safety
///
/// Same contract as [SizeRouter::free_memory], against the process-wide router.
/// Panics if a non-null pointer is freed before [initialize_all] (it cannot
/// have come from here).
pub unsafe fn free_memory(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    match registry() {
        Ok(router) => router.free_memory(ptr, size),
        Err(e) => panic!("free_memory: {}", e),
    }
}

/// See [SizeRouter::construct_typed]
pub fn construct_typed<T>(value: T) -> Result<NonNull<T>, AllocError> {
    registry()?.construct_typed(value)
}

/// See [SizeRouter::destroy_typed]
///
/// # Safety
///
/// Same contract as [SizeRouter::destroy_typed], against the process-wide router.
pub unsafe fn destroy_typed<T>(ptr: *mut T) {
    if ptr.is_null() {
        return;
    }
    match registry() {
        Ok(router) => router.destroy_typed(ptr),
        Err(e) => panic!("destroy_typed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_registry_is_reported() {
        let cell = OnceLock::new();
        assert_eq!(registry_in(&cell).unwrap_err(), AllocError::Uninitialized);
        cell.get_or_init(SizeRouter::default);
        assert!(registry_in(&cell).is_ok());
    }

    #[test]
    fn initialize_all_is_idempotent() {
        let a = initialize_all();
        let b = initialize_all();
        assert!(std::ptr::eq(a, b));
        assert!(std::ptr::eq(registry().unwrap(), a));
    }

    #[test]
    fn global_use_and_free() {
        initialize_all();
        assert_eq!(use_memory(0), Ok(None));
        let p = use_memory(100).unwrap().unwrap();
        assert_eq!(p.as_ptr() as usize % 104, 0);
        unsafe {
            p.as_ptr().write_bytes(1, 100);
            free_memory(p.as_ptr(), 100);
            free_memory(std::ptr::null_mut(), 100);
        }
        let big = use_memory(5000).unwrap().unwrap();
        unsafe { free_memory(big.as_ptr(), 5000) };
    }

    #[test]
    fn global_typed() {
        initialize_all();
        let p = construct_typed(String::from("slab")).unwrap();
        unsafe {
            assert_eq!(&*p.as_ptr(), "slab");
            destroy_typed(p.as_ptr());
            destroy_typed::<String>(std::ptr::null_mut());
        }
    }
}
