//! Lock-free LIFO of slots that have been given back to a pool
//!
//! A free slot stores exactly one thing: the address of the next free slot,
//! written through an atomic so that a racing reader never sees a torn value.
//! The list head is the only piece of pool state mutated without a lock.
//!
//! ```text
//!   head ---> +------+     +------+     +------+
//!             | next | --> | next | --> | next | --> 0
//!             | .... |     | .... |     | .... |
//!             +------+     +------+     +------+
//!              slot         slot         slot
//! ```
//!
//! Two strategies implement [SlotStack]:
//!
//! * [TaggedFreeList] packs a generation tag into the head next to the slot
//!   address. Every successful push or pop bumps the tag, so a pop that read
//!   `(X, t)` and `X.next == Y` cannot install `Y` after some other thread has
//!   popped `X`, popped `Y` and pushed `X` back: the head is now `(X, t + 3)`.
//!   Slots are never handed back to the environment while the pool is alive,
//!   so the stale read of `X.next` itself is a read of mapped memory whose
//!   value is then discarded.
//! * [NaiveFreeList] is the bare two-CAS Treiber stack. It has exactly the
//!   ABA problem described above and is only sound when pops do not race
//!   with other pops.
//!
//! Address bits: the tagged head assumes user-space addresses fit in 48 bits
//! (x86_64 4-level paging, aarch64 without top-byte tricks). Slot addresses
//! are aligned to [SLOT_LINK_ALIGN], so those low bits are dropped from the
//! head as well and go to the tag instead (19 tag bits on 64-bit targets).
//! Pushing a slot that breaks either assumption panics.

use std::{
    mem::{align_of, size_of},
    ptr::NonNull,
    sync::atomic::Ordering,
};

use crate::loom_testing::*;

/// Minimum number of bytes a slot needs in order to sit on a free list
pub const SLOT_LINK_SIZE: usize = size_of::<FreeSlot>();
/// Slots must be aligned to at least this much so the link is a valid atomic
pub const SLOT_LINK_ALIGN: usize = align_of::<FreeSlot>();

/// Contents of a slot while it is free
#[repr(C)]
pub(crate) struct FreeSlot {
    next: AtomicUsize,
}

impl FreeSlot {
    /// Create the link object in a freshly carved slot
    ///
    /// Under loom the link is a model object that has to exist for the whole
    /// life of the slot. A re-push must only store into it, never rebuild it,
    /// or a stale popper's read of `next` races a non-atomic write.
    #[cfg(loom)]
    pub(crate) unsafe fn prepare(slot: NonNull<u8>) {
        slot.cast::<FreeSlot>().as_ptr().write(FreeSlot {
            next: AtomicUsize::new(0),
        });
    }

    /// Start using slot memory as a free list node
    ///
    /// The caller owns `slot` exclusively at this point (it has not been published yet).
    #[inline]
    unsafe fn init<'a>(slot: NonNull<u8>, next: usize) -> &'a FreeSlot {
        let slot = slot.cast::<FreeSlot>().as_ref();
        slot.store_next(next);
        slot
    }

    #[inline]
    unsafe fn from_addr<'a>(addr: usize) -> &'a FreeSlot {
        &*(addr as *const FreeSlot)
    }

    /// Load next pointer with an atomic op (relaxed)
    #[inline]
    fn load_next(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Store next pointer with an atomic op (relaxed)
    #[inline]
    fn store_next(&self, next: usize) {
        self.next.store(next, Ordering::Relaxed);
    }
}

/// Replaceable free list strategy behind a pool's fast path
///
/// # Safety
///
/// Implementations must hand every pushed slot back out of [pop](SlotStack::pop)
/// at most once per push, and must publish the slot link with release
/// semantics and read it back with acquire semantics.
pub unsafe trait SlotStack: Default + Send + Sync {
    /// Make `slot` the new head
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of [SLOT_LINK_SIZE] bytes, aligned to
    /// [SLOT_LINK_ALIGN], not currently on any free list, and must stay mapped
    /// for as long as this stack is alive.
    unsafe fn push(&self, slot: NonNull<u8>);

    /// Remove and return the head, or `None` if the list is empty
    fn pop(&self) -> Option<NonNull<u8>>;

    /// Visit every slot currently on the list, head first
    ///
    /// Exclusive access means nobody can be pushing or popping concurrently.
    fn for_each_slot<F: FnMut(NonNull<u8>)>(&mut self, f: F);
}

/// log2 of the user-space address range
const ADDR_WIDTH: u32 = 48;
/// Low address bits that are always zero for a properly aligned slot
const ADDR_LOW_BITS: u32 = SLOT_LINK_ALIGN.trailing_zeros();
const TAG_SHIFT: u32 = ADDR_WIDTH - ADDR_LOW_BITS;
const ADDR_MASK: u64 = (1 << TAG_SHIFT) - 1;
const TAG_MASK: u64 = (1 << (64 - TAG_SHIFT)) - 1;

/// Free list whose head carries a generation tag (default strategy)
pub struct TaggedFreeList {
    /// `bits[TAG_SHIFT-1:0]` = address of first free slot >> ADDR_LOW_BITS (0 = empty),
    /// `bits[63:TAG_SHIFT]` = generation tag
    head: AtomicU64,
}

impl TaggedFreeList {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Masks `addr`: a racing pop may read garbage as `next`, but its CAS will fail
    #[inline]
    fn pack(addr: usize, tag: u64) -> u64 {
        ((tag & TAG_MASK) << TAG_SHIFT) | ((addr as u64 >> ADDR_LOW_BITS) & ADDR_MASK)
    }

    #[inline]
    fn unpack(head: u64) -> (usize, u64) {
        (((head & ADDR_MASK) << ADDR_LOW_BITS) as usize, head >> TAG_SHIFT)
    }
}

impl Default for TaggedFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaggedFreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (addr, tag) = Self::unpack(self.head.load(Ordering::Relaxed));
        f.debug_struct("TaggedFreeList")
            .field("head", &(addr as *const ()))
            .field("tag", &tag)
            .finish()
    }
}

unsafe impl SlotStack for TaggedFreeList {
    unsafe fn push(&self, slot: NonNull<u8>) {
        let slot_addr = slot.as_ptr() as usize;
        if (slot_addr as u64) >> ADDR_WIDTH != 0 || slot_addr % SLOT_LINK_ALIGN != 0 {
            panic!(
                "Slot address {:?} does not fit in tagged head",
                crate::util::UsizePtr::from(slot)
            );
        }
        // order: we are only picking a value to attempt the CAS against,
        // nothing reachable from the old head is read here
        let mut old_head = self.head.load(Ordering::Relaxed);
        let link = FreeSlot::init(slot, Self::unpack(old_head).0);
        loop {
            let (old_addr, tag) = Self::unpack(old_head);
            // private until the CAS below publishes it
            link.store_next(old_addr);
            let new_head = Self::pack(slot_addr, tag.wrapping_add(1));
            // order: on success, release so that the write to link.next
            // happens-before any pop that acquires this head
            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(x) => {
                    old_head = x;
                    spin_hint();
                }
            }
        }
    }

    fn pop(&self) -> Option<NonNull<u8>> {
        // order: acquire to synchronize-with the push that installed this head,
        // which makes its write of next visible to us.
        // intermediate pushes/pops are RmW operations and thus
        // part of the release sequence
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            let (addr, tag) = Self::unpack(old_head);
            if addr == 0 {
                return None;
            }
            // safety: addr was pushed onto this list, and slot memory outlives the list.
            // if it has been popped (and possibly reused) since we loaded the head,
            // the tag will have moved on and the CAS below fails
            let next = unsafe { FreeSlot::from_addr(addr).load_next() };
            let new_head = Self::pack(next, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                // safety: addr is nonzero
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(addr as *mut u8) }),
                Err(_) => {
                    spin_hint();
                    // the failure value was loaded relaxed, so reload in order to
                    // be allowed to dereference it
                    old_head = self.head.load(Ordering::Acquire);
                }
            }
        }
    }

    fn for_each_slot<F: FnMut(NonNull<u8>)>(&mut self, mut f: F) {
        let (mut addr, _) = Self::unpack(self.head.load(Ordering::Relaxed));
        while let Some(slot) = NonNull::new(addr as *mut u8) {
            f(slot);
            // safety: exclusive access, everything on the list is a live FreeSlot
            addr = unsafe { FreeSlot::from_addr(addr).load_next() };
        }
    }
}

/// Bare compare-and-swap free list
///
/// Not ABA safe: a pop can install a stale `next` if, between its read of the
/// head and its CAS, other threads pop that head, pop its successor, and push
/// the head back. Fine for single-consumer use.
pub struct NaiveFreeList {
    head: AtomicPtr<FreeSlot>,
}

impl NaiveFreeList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

impl Default for NaiveFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NaiveFreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NaiveFreeList")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

unsafe impl SlotStack for NaiveFreeList {
    unsafe fn push(&self, slot: NonNull<u8>) {
        let mut old_head = self.head.load(Ordering::Relaxed);
        let link = FreeSlot::init(slot, old_head as usize);
        loop {
            link.store_next(old_head as usize);
            match self.head.compare_exchange_weak(
                old_head,
                slot.as_ptr() as *mut FreeSlot,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(x) => {
                    old_head = x;
                    spin_hint();
                }
            }
        }
    }

    fn pop(&self) -> Option<NonNull<u8>> {
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            let head = NonNull::new(old_head)?;
            // XXX this is the racy read: head may already belong to someone else
            let next = unsafe { head.as_ref().load_next() } as *mut FreeSlot;
            match self.head.compare_exchange_weak(
                old_head,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(head.cast()),
                Err(_) => {
                    spin_hint();
                    old_head = self.head.load(Ordering::Acquire);
                }
            }
        }
    }

    fn for_each_slot<F: FnMut(NonNull<u8>)>(&mut self, mut f: F) {
        let mut cur = self.head.load(Ordering::Relaxed);
        while let Some(slot) = NonNull::new(cur) {
            f(slot.cast());
            // safety: exclusive access
            cur = unsafe { slot.as_ref().load_next() } as *mut FreeSlot;
        }
    }
}
