#[cfg(not(loom))]
use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[cfg(not(loom))]
use crate::env::counting::CountingEnv;
use crate::MAX_SLOT_SIZE;

use super::*;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[cfg(not(loom))]
fn counting_router(env: &CountingEnv) -> SizeRouter<&CountingEnv> {
    SizeRouter::with_env(RouterConfig::default(), env).unwrap()
}

#[test]
fn ensure_router_send_sync() {
    assert_send::<SizeRouter>();
    assert_sync::<SizeRouter>();
}

#[test]
fn default_config() {
    let config = RouterConfig::default();
    assert_eq!(config.base_slot_size, 8);
    assert_eq!(config.num_classes, 64);
    assert_eq!(config.block_size, 4096);
    assert_eq!(config.max_slot_size(), MAX_SLOT_SIZE);
}

#[cfg(not(loom))]
#[test]
fn router_rejects_bad_config() {
    let bad = |base_slot_size, num_classes, block_size| {
        SizeRouter::new(RouterConfig {
            base_slot_size,
            num_classes,
            block_size,
        })
        .unwrap_err()
    };
    assert!(matches!(bad(0, 64, 4096), AllocError::InvalidRouterConfig(_)));
    assert!(matches!(bad(8, 0, 4096), AllocError::InvalidRouterConfig(_)));
    assert!(matches!(
        bad(usize::MAX / 2, 4, 4096),
        AllocError::InvalidRouterConfig(_)
    ));
    // pools get validated too
    assert!(matches!(bad(8, 64, 256), AllocError::BlockTooSmall { .. }));
    assert!(matches!(bad(12, 4, 4096), AllocError::MisalignedSlotSize { .. }));
}

#[cfg(not(loom))]
#[test]
fn router_pool_sizes() {
    let router = SizeRouter::default();
    for i in 0..64 {
        assert_eq!(router.pool(i).unwrap().slot_size(), (i + 1) * 8);
    }
    assert!(router.pool(64).is_none());
}

#[cfg(not(loom))]
#[test]
fn router_class_index() {
    let router = SizeRouter::default();
    assert_eq!(router.class_index(0), None);
    assert_eq!(router.class_index(1), Some(0));
    assert_eq!(router.class_index(8), Some(0));
    assert_eq!(router.class_index(9), Some(1));
    assert_eq!(router.class_index(16), Some(1));
    assert_eq!(router.class_index(17), Some(2));
    assert_eq!(router.class_index(511), Some(63));
    assert_eq!(router.class_index(512), Some(63));
    assert_eq!(router.class_index(513), None);
    for size in 1..=512 {
        assert_eq!(router.class_index(size), Some((size + 7) / 8 - 1));
    }
}

#[cfg(not(loom))]
#[test]
fn router_zero_size_is_none() {
    let env = CountingEnv::default();
    let router = counting_router(&env);
    assert_eq!(router.use_memory(0), Ok(None));
    assert_eq!(router.use_layout(Layout::new::<()>()), Ok(None));
    assert_eq!(env.allocs(), 0);
}

#[cfg(not(loom))]
#[test]
fn router_serves_from_matching_pool() {
    let router = SizeRouter::default();
    for size in 1..=512 {
        let p = router.use_memory(size).unwrap().unwrap();
        let class_size = divroundup(size, 8) * 8;
        let idx = class_size / 8 - 1;
        assert!(router.pool(idx).unwrap().owns(p.as_ptr()), "size {}", size);
        assert_eq!(p.as_ptr() as usize % class_size, 0);
        // and from no other pool
        for other in [idx.wrapping_sub(1), idx + 1] {
            if let Some(pool) = router.pool(other) {
                assert!(!pool.owns(p.as_ptr()));
            }
        }
        unsafe { router.free_memory(p.as_ptr(), size) };
    }
}

#[cfg(not(loom))]
#[test]
fn router_oversized_bypasses_pools() {
    let env = CountingEnv::default();
    let router = counting_router(&env);
    for size in [513, 1000, 4096, 1 << 20] {
        let p = router.use_memory(size).unwrap().unwrap();
        assert_eq!(env.allocs(), 1);
        assert_eq!(env.bytes_live(), size);
        assert_eq!(p.as_ptr() as usize % MIN_PASSTHROUGH_ALIGN, 0);
        for i in 0..64 {
            assert!(!router.pool(i).unwrap().owns(p.as_ptr()));
            assert_eq!(router.pool(i).unwrap().stats().blocks, 0);
        }
        unsafe {
            p.as_ptr().write_bytes(0x5a, size);
            router.free_memory(p.as_ptr(), size);
        }
        assert_eq!(env.releases(), 1);
        assert_eq!(env.bytes_live(), 0);
        env.allocs.store(0, Ordering::SeqCst);
        env.releases.store(0, Ordering::SeqCst);
    }
}

#[cfg(not(loom))]
#[test]
fn router_free_recycles_into_same_class() {
    let router = SizeRouter::default();
    let p = router.use_memory(20).unwrap().unwrap();
    unsafe { router.free_memory(p.as_ptr(), 20) };
    // anything else in 17..=24 gets the same slot back
    let q = router.use_memory(17).unwrap().unwrap();
    assert_eq!(p, q);
    // but a different class does not
    let r = router.use_memory(25).unwrap().unwrap();
    assert_ne!(q, r);
    unsafe {
        router.free_memory(q.as_ptr(), 24);
        router.free_memory(r.as_ptr(), 25);
        router.free_memory(std::ptr::null_mut(), 25);
    }
}

#[cfg(not(loom))]
#[test]
fn router_teardown_releases_everything() {
    let env = CountingEnv::default();
    {
        let router = counting_router(&env);
        // pooled sizes are only ever returned by dropping the router
        for size in (1..=512).step_by(7) {
            for _ in 0..20 {
                router.use_memory(size).unwrap().unwrap();
            }
        }
        let big = router.use_memory(10_000).unwrap().unwrap();
        unsafe { router.free_memory(big.as_ptr(), 10_000) };
    }
    assert!(env.allocs() > 0);
    assert_eq!(env.releases(), env.allocs());
    assert_eq!(env.bytes_live(), 0);
}

#[cfg(not(loom))]
#[test]
fn router_layout_alignment() {
    let router = SizeRouter::default();
    for align in [1, 2, 4, 8, 16, 32, 64, 128, 256] {
        for size in [1, 3, 8, 24, 100, 256, 512] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let p = router.use_layout(layout).unwrap().unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "size {} align {}", size, align);
            unsafe { router.free_layout(p.as_ptr(), layout) };
        }
    }
    // padding pushes this one past the largest class
    let layout = Layout::from_size_align(300, 1024).unwrap();
    let p = router.use_layout(layout).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % 1024, 0);
    for i in 0..64 {
        assert!(!router.pool(i).unwrap().owns(p.as_ptr()));
    }
    unsafe { router.free_layout(p.as_ptr(), layout) };
}

#[cfg(not(loom))]
#[test]
fn router_non_power_of_two_base_goes_direct_when_misaligned() {
    let env = CountingEnv::default();
    let router = SizeRouter::<&CountingEnv>::with_env(
        RouterConfig {
            base_slot_size: 24,
            num_classes: 4,
            block_size: 4096,
        },
        &env,
    )
    .unwrap();
    // 16 byte aligned 16 byte value would land in the 24 byte class
    let layout = Layout::from_size_align(16, 16).unwrap();
    let p = router.use_layout(layout).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % 16, 0);
    assert!(!router.pool(0).unwrap().owns(p.as_ptr()));
    unsafe { router.free_layout(p.as_ptr(), layout) };
    assert_eq!(env.bytes_live(), 0);
}

#[cfg(not(loom))]
#[test]
fn router_oom_propagates() {
    let env = CountingEnv::failing_after(0);
    let router = counting_router(&env);
    assert_eq!(
        router.use_memory(16),
        Err(AllocError::OutOfMemory {
            size: 4096,
            align: crate::arena::BLOCK_ALIGN
        })
    );
    assert_eq!(
        router.use_memory(1000),
        Err(AllocError::OutOfMemory {
            size: 1000,
            align: MIN_PASSTHROUGH_ALIGN
        })
    );
}

#[cfg(not(loom))]
#[test]
fn router_not_loom_smoke_test() {
    let n_threads = 6;
    let n_cycles = 20_000;

    let env = Arc::new(CountingEnv::default());
    let router = Arc::new(
        SizeRouter::<Arc<CountingEnv>>::with_env(RouterConfig::default(), env.clone()).unwrap(),
    );

    let mut handles = Vec::new();
    for t in 0..n_threads {
        let router = router.clone();
        handles.push(std::thread::spawn(move || {
            let mut held: Vec<(NonNull<u8>, usize)> = Vec::new();
            for i in 0..n_cycles {
                // spread over classes and the direct path
                let size = 1 + (i * 37 + t * 101) % 700;
                let p = router.use_memory(size).unwrap().unwrap();
                unsafe { p.as_ptr().write_bytes(t as u8, size) };
                held.push((p, size));
                if i % 4 != 0 {
                    let (q, qsize) = held.swap_remove((i * 7) % held.len());
                    unsafe {
                        assert_eq!(*q.as_ptr(), t as u8);
                        assert_eq!(*q.as_ptr().add(qsize - 1), t as u8);
                        router.free_memory(q.as_ptr(), qsize);
                    }
                }
            }
            for (q, qsize) in held {
                unsafe { router.free_memory(q.as_ptr(), qsize) };
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let router = Arc::try_unwrap(router).unwrap();
    drop(router);
    assert_eq!(env.releases(), env.allocs());
    assert_eq!(env.bytes_live(), 0);
}

// typed helpers

#[cfg(not(loom))]
#[derive(Debug, PartialEq)]
struct P1(i32);
#[cfg(not(loom))]
#[derive(Debug, PartialEq)]
struct P2([i32; 5]);
#[cfg(not(loom))]
#[derive(Debug, PartialEq)]
struct P3([i32; 10]);
#[cfg(not(loom))]
#[derive(Debug, PartialEq)]
struct P4([i32; 20]);

#[cfg(not(loom))]
struct DropCounter<'a>(&'a AtomicUsize, #[allow(dead_code)] u64);
#[cfg(not(loom))]
impl<'a> Drop for DropCounter<'a> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(not(loom))]
#[test]
fn typed_construct_destroy() {
    let router = SizeRouter::default();
    let p1 = router.construct_typed(P1(1)).unwrap();
    let p2 = router.construct_typed(P2([2; 5])).unwrap();
    let p3 = router.construct_typed(P3([3; 10])).unwrap();
    let p4 = router.construct_typed(P4([4; 20])).unwrap();
    unsafe {
        assert_eq!(*p1.as_ptr(), P1(1));
        assert_eq!(*p2.as_ptr(), P2([2; 5]));
        assert_eq!(*p3.as_ptr(), P3([3; 10]));
        assert_eq!(*p4.as_ptr(), P4([4; 20]));
    }
    // each one lives in the class for its size
    assert!(router.pool(0).unwrap().owns(p1.as_ptr().cast::<u8>()));
    assert!(router.pool(2).unwrap().owns(p2.as_ptr().cast::<u8>()));
    assert!(router.pool(4).unwrap().owns(p3.as_ptr().cast::<u8>()));
    assert!(router.pool(9).unwrap().owns(p4.as_ptr().cast::<u8>()));

    unsafe {
        router.destroy_typed(p1.as_ptr());
        router.destroy_typed(p2.as_ptr());
        router.destroy_typed(p3.as_ptr());
        router.destroy_typed(p4.as_ptr());
    }
    // storage is reused by the next object of the same class
    let again = router.construct_typed(P4([5; 20])).unwrap();
    assert_eq!(again.cast::<u8>(), p4.cast::<u8>());
    unsafe { router.destroy_typed(again.as_ptr()) };
}

#[cfg(not(loom))]
#[test]
fn typed_destroy_runs_drop() {
    let drops = AtomicUsize::new(0);
    let router = SizeRouter::default();
    let objs: Vec<_> = (0..10)
        .map(|i| router.construct_typed(DropCounter(&drops, i)).unwrap())
        .collect();
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    for o in objs {
        unsafe { router.destroy_typed(o.as_ptr()) };
    }
    assert_eq!(drops.load(Ordering::SeqCst), 10);
    unsafe { router.destroy_typed::<DropCounter>(std::ptr::null_mut()) };
    assert_eq!(drops.load(Ordering::SeqCst), 10);
}

#[cfg(not(loom))]
#[test]
fn typed_zero_sized() {
    struct Unit;
    let env = CountingEnv::default();
    let router = counting_router(&env);
    let p = router.construct_typed(Unit).unwrap();
    assert_eq!(p, NonNull::dangling());
    unsafe { router.destroy_typed(p.as_ptr()) };
    assert_eq!(env.allocs(), 0);
    assert_eq!(env.releases(), 0);
}

#[cfg(not(loom))]
#[test]
fn typed_over_aligned_and_oversized() {
    #[repr(align(64))]
    struct Aligned([u8; 40]);
    struct Big([u64; 100]);

    let env = CountingEnv::default();
    let router = counting_router(&env);

    let a = router.construct_typed(Aligned([7; 40])).unwrap();
    assert_eq!(a.as_ptr() as usize % 64, 0);
    assert!(router.pool(7).unwrap().owns(a.as_ptr().cast::<u8>()));
    unsafe { assert_eq!((*a.as_ptr()).0, [7; 40]) };

    let b = router.construct_typed(Big([9; 100])).unwrap();
    for i in 0..64 {
        assert!(!router.pool(i).unwrap().owns(b.as_ptr().cast::<u8>()));
    }
    unsafe {
        assert_eq!((*b.as_ptr()).0[99], 9);
        router.destroy_typed(a.as_ptr());
        router.destroy_typed(b.as_ptr());
    }
    drop(router);
    assert_eq!(env.bytes_live(), 0);
}

#[cfg(not(loom))]
#[test]
fn typed_constructor_not_called_on_oom() {
    let env = CountingEnv::failing_after(0);
    let router = counting_router(&env);
    let called = Cell::new(false);
    let res = router.construct_with(|| {
        called.set(true);
        P2([0; 5])
    });
    assert!(matches!(res, Err(AllocError::OutOfMemory { .. })));
    assert!(!called.get());
}

#[cfg(not(loom))]
#[test]
fn typed_constructor_panic_returns_storage() {
    let router = SizeRouter::default();
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        router.construct_with::<P3, _>(|| panic!("constructor failed"))
    }));
    assert!(res.is_err());
    // the slot that was allocated for it went back on the free list
    let issued = router.pool(4).unwrap().stats().slots_issued;
    assert_eq!(issued, 1);
    let p = router.construct_typed(P3([1; 10])).unwrap();
    assert_eq!(router.pool(4).unwrap().stats().slots_issued, 1);
    unsafe { router.destroy_typed(p.as_ptr()) };
}
