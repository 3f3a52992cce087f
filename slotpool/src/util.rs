use std::fmt;

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Number of bytes to skip so that `addr` becomes a multiple of `align`
///
/// `align` does not have to be a power of two (slot sizes such as 24 are fine)
pub const fn pad_to(addr: usize, align: usize) -> usize {
    let rem = addr % align;
    if rem == 0 {
        0
    } else {
        align - rem
    }
}

/// Pointer that prints as a bare hex address
///
/// Used for tracing fields, where `{:?}` on a raw pointer is noisy
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(usize);

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}
impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}
impl<T: ?Sized> From<std::ptr::NonNull<T>> for UsizePtr {
    fn from(value: std::ptr::NonNull<T>) -> Self {
        Self(value.as_ptr() as *const () as usize)
    }
}

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
