use self::format::init;

use super::*;
use crate::arena::{create_local, Backing, LocalProvider, MmapProvider, SysvProvider};
use crate::chain::Chain;
use crate::header::{SliceHeader, POOL_HEADER_SIZE};
use crate::pools::SyncFixedPool;

use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use static_assertions::{assert_impl_all, assert_not_impl_any};


// The busy flag is a status marker, not a lock: the core pool can't be shared between threads.
assert_not_impl_any!(FixedPool<LocalProvider>: Sync);
assert_impl_all!(FixedPool<LocalProvider>: Send);
assert_impl_all!(SyncFixedPool<LocalProvider>: Send, Sync);

/// A local heap provider that counts how many blocks it got back.
#[derive(Default, Clone)]
struct CountingProvider {
    releases: Arc<AtomicUsize>,
}

impl CountingProvider {
    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

unsafe impl Provider for CountingProvider {
    fn create(&self, size: usize) -> Result<Block, ArenaError> {
        LocalProvider.create(size)
    }

    unsafe fn release(&self, block: Block) -> Result<(), ArenaError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        LocalProvider.release(block)
    }
}

/// Returns the lengths of the free prefix and the busy suffix.
fn split<P: Provider>(pool: &FixedPool<P>) -> (usize, usize) {
    let walk = pool.debug_walk_with_limit(usize::MAX);
    let free = walk.iter().take_while(|s| !s.busy).count();
    assert!(
        walk[free..].iter().all(|s| s.busy),
        "Busy suffix should not contain free slots."
    );
    assert_eq!(walk.last().map(|s| s.next), Some(None));
    (free, walk.len() - free)
}

/// Lays out an initialised pool in a fresh local block, as another process would have.
fn foreign_pool(slice_num: u32, slice_size: u32) -> Block {
    let (_, stride) = util::checked_slice_size(slice_size as usize).unwrap();
    let block = create_local(util::required_size(slice_num as usize, stride).unwrap()).unwrap();
    let region = util::carve(&block).unwrap();
    let mut chain = Chain::new(region.pool, region.slots, stride);
    unsafe { chain.init(slice_size, slice_num) };
    block
}

fn in_block<P: Provider>(pool: &FixedPool<P>, ptr: NonNull<u8>, len: usize) -> bool {
    let base = pool.block().base().as_ptr() as usize;
    let addr = ptr.as_ptr() as usize;
    addr >= base && addr + len <= base + pool.block().size()
}

#[test]
fn test_1() {
    let _guard = init();
    let mut pool = FixedPool::new(LocalProvider, 4, 16).unwrap();
    assert_eq!(pool.capacity(), 4);
    assert_eq!(pool.slice_size(), 16);

    let mut handles: Vec<SliceHandle> = (0..4).map(|_| pool.allocate().unwrap()).collect();
    let addrs: HashSet<usize> = handles
        .iter()
        .map(|h| pool.payload_ptr(h).as_ptr() as usize)
        .collect();
    assert_eq!(addrs.len(), 4, "Addresses should be distinct.");
    for h in &handles {
        assert!(in_block(&pool, pool.payload_ptr(h), 16));
    }
    assert_eq!(pool.in_use(), 4);

    assert!(pool.allocate().is_none());
    assert!(pool.is_exhausted());
    assert_eq!(pool.in_use(), 4);

    let second = handles.remove(1);
    let second_addr = pool.payload_ptr(&second);
    pool.free(second);
    assert_eq!(pool.in_use(), 3);

    let again = pool.allocate().unwrap();
    assert_eq!(pool.payload_ptr(&again), second_addr);
    assert_eq!(pool.in_use(), 4);
    pool.verify().unwrap();
}

#[test]
fn test_2() {
    fn check<P: Provider>(provider: P) {
        let mut pool = FixedPool::new(provider, 8, 24).unwrap();
        let mut handles: Vec<SliceHandle> = (0..8).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());
        pool.verify().unwrap();

        pool.free(handles.swap_remove(5));
        assert!(!pool.is_exhausted());
        handles.push(pool.allocate().unwrap());
        assert!(pool.allocate().is_none());
        pool.verify().unwrap();
    }
    check(LocalProvider);
    check(MmapProvider::new());
    check(SysvProvider::private());
}

#[test]
fn test_3() {
    let mut pool = FixedPool::new(LocalProvider, 3, 8).unwrap();
    let a = pool.allocate().unwrap();
    let b = pool.allocate().unwrap();
    let c = pool.allocate().unwrap();
    let addrs: HashSet<usize> = [&a, &b, &c]
        .iter()
        .map(|h| pool.payload_ptr(h).as_ptr() as usize)
        .collect();

    pool.free(b);
    pool.verify().unwrap();
    pool.free(a);
    pool.verify().unwrap();
    pool.free(c);
    pool.verify().unwrap();
    assert_eq!(pool.in_use(), 0);
    assert_eq!(split(&pool), (3, 0));

    let again: Vec<SliceHandle> = (0..3).map(|_| pool.allocate().unwrap()).collect();
    let again_addrs: HashSet<usize> = again
        .iter()
        .map(|h| pool.payload_ptr(h).as_ptr() as usize)
        .collect();
    assert_eq!(addrs, again_addrs);
}

#[test]
fn test_4() {
    let mut pool = FixedPool::new(MmapProvider::new(), 16, 40).unwrap();
    let mut handles: Vec<SliceHandle> = (0..16).map(|_| pool.allocate().unwrap()).collect();
    for (i, h) in handles.iter_mut().enumerate() {
        let payload = pool.payload_mut(h);
        assert_eq!(payload.len(), 40);
        payload.fill(i as u8);
    }

    // Free every other slot and reuse it with different contents.
    let odd: Vec<SliceHandle> = (0..8).map(|i| handles.remove(i + 1)).collect();
    for h in odd {
        pool.free(h);
    }
    for _ in 0..8 {
        let mut h = pool.allocate().unwrap();
        pool.payload_mut(&mut h).fill(0xFF);
    }

    for (h, i) in handles.iter().zip((0..16).step_by(2)) {
        assert!(
            pool.payload(h).iter().all(|&b| b == i as u8),
            "Payload of slot {} was overwritten.",
            h.index()
        );
    }
}

#[test]
fn test_5() {
    const N: usize = 32;
    let mut pool = FixedPool::new(LocalProvider, N, 8).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut live: Vec<SliceHandle> = vec![];

    for _ in 0..5_000 {
        if rng.gen_bool(0.55) {
            match pool.allocate() {
                Some(h) => live.push(h),
                None => assert_eq!(live.len(), N),
            }
        } else if !live.is_empty() {
            let i = rng.gen_range(0..live.len());
            pool.free(live.swap_remove(i));
        }

        pool.verify().unwrap();
        let (free, busy) = split(&pool);
        assert_eq!(free + busy, N);
        assert_eq!(free, N - pool.in_use());
        assert_eq!(live.len(), pool.in_use());
    }
}

#[test]
fn test_6() {
    let mut pool = FixedPool::new(LocalProvider, 1, 64).unwrap();
    let h = pool.allocate().unwrap();
    assert_eq!(h.index(), 0);
    assert!(pool.allocate().is_none());
    pool.free(h);
    assert_eq!(pool.in_use(), 0);
    pool.verify().unwrap();

    let h = pool.allocate().unwrap();
    assert_eq!(h.index(), 0);
    pool.verify().unwrap();
}

#[test]
fn test_7() {
    let _guard = init();
    let block = create_local(1024).unwrap();
    let pool = FixedPool::with_block(LocalProvider, block, 16).unwrap();
    // 32-byte slots after a 24-byte pool header.
    assert_eq!(pool.capacity(), (1024 - POOL_HEADER_SIZE) / 32);
    pool.verify().unwrap();
}

#[test]
fn test_8() {
    let provider = CountingProvider::default();
    let block = provider.create(POOL_HEADER_SIZE + 8).unwrap();
    let err = FixedPool::with_block(provider.clone(), block, 16).unwrap_err();
    assert!(matches!(err, PoolError::ZeroCapacity { .. }));
    assert_eq!(provider.releases(), 1, "The block should go back to the provider.");
}

#[test]
fn test_9() {
    let provider = CountingProvider::default();
    let mut pool = FixedPool::new(provider.clone(), 4, 8).unwrap();
    let _h = pool.allocate().unwrap();
    pool.destroy().unwrap();
    assert_eq!(provider.releases(), 1);

    {
        let _pool = FixedPool::new(provider.clone(), 4, 8).unwrap();
    }
    assert_eq!(provider.releases(), 2);
}

#[test]
fn test_10() {
    let _guard = init();
    let mut owner = FixedPool::new(SysvProvider::private(), 8, 32).unwrap();
    let Backing::SysV { key, shmid } = *owner.block().backing() else {
        panic!("Expected a System-V block.");
    };

    // A second attachment of the same segment, as another process would have.
    let mem = unsafe { libc::shmat(shmid, core::ptr::null(), 0) };
    assert_ne!(mem as isize, -1);
    let block = unsafe {
        Block::from_raw_parts(
            NonNull::new(mem.cast()).unwrap(),
            owner.block().size(),
            Backing::SysV { key, shmid },
        )
    };
    let provider = SysvProvider::new(key).remove_on_release(false);

    let mut first = owner.allocate().unwrap();
    let _second = owner.allocate().unwrap();
    owner.payload_mut(&mut first).copy_from_slice(&[7; 32]);

    let mut attached = FixedPool::attach(provider, block).unwrap();
    assert_eq!(attached.capacity(), 8);
    assert_eq!(attached.slice_size(), 32);
    assert_eq!(attached.in_use(), 2);

    let third = attached.allocate().unwrap();
    assert_eq!(third.index(), 2);
    assert_eq!(owner.in_use(), 3);

    // Free `first` through the attached mapping's address for it.
    let offset = owner.payload_ptr(&first).as_ptr() as usize
        - owner.block().base().as_ptr() as usize;
    let attached_ptr = unsafe { attached.block().base().as_ptr().add(offset) };
    assert_eq!(unsafe { attached_ptr.read() }, 7);
    unsafe { attached.free_payload(attached_ptr).unwrap() };
    assert_eq!(owner.in_use(), 2);
    owner.verify().unwrap();
    attached.verify().unwrap();

    drop(attached);
    owner.verify().unwrap();
}

#[test]
fn test_11() {
    let provider = CountingProvider::default();
    let block = provider.create(256).unwrap();
    let err = FixedPool::attach(provider.clone(), block).unwrap_err();
    assert!(matches!(err, PoolError::NotAPool));
    assert_eq!(provider.releases(), 1);
}

#[test]
fn test_12() {
    let block = create_local(256).unwrap();
    unsafe {
        block
            .base()
            .as_ptr()
            .cast::<PoolHeader>()
            .write(PoolHeader::new(16, 1000));
    }
    let err = FixedPool::attach(LocalProvider, block).unwrap_err();
    assert!(matches!(
        err,
        PoolError::GeometryMismatch {
            available: 256,
            ..
        }
    ));
}

#[test]
fn test_13() {
    let mut pool = FixedPool::new(LocalProvider, 4, 16).unwrap();
    let h = pool.allocate().unwrap();
    let ptr = pool.payload_ptr(&h).as_ptr();
    let base = pool.block().base().as_ptr();

    unsafe {
        assert!(matches!(
            pool.free_payload(base),
            Err(PoolError::InvalidFree { .. })
        ));
        assert!(matches!(
            pool.free_payload(ptr.add(1)),
            Err(PoolError::InvalidFree { .. })
        ));
        assert!(matches!(
            pool.free_payload(base.add(pool.block().size())),
            Err(PoolError::InvalidFree { .. })
        ));
        assert_eq!(pool.in_use(), 1);

        pool.free_payload(ptr).unwrap();
    }
    assert_eq!(pool.in_use(), 0);
    pool.verify().unwrap();
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn test_14() {
    // Should panic because of the double free debug assertion.
    let mut pool = FixedPool::new(LocalProvider, 4, 16).unwrap();
    let h = pool.allocate().unwrap();
    let ptr = pool.payload_ptr(&h).as_ptr();
    unsafe {
        pool.free_payload(ptr).unwrap();
        let _ = pool.free_payload(ptr);
    }
}

#[cfg(not(debug_assertions))]
#[test]
fn test_15() {
    let mut pool = FixedPool::new(LocalProvider, 4, 16).unwrap();
    let _a = pool.allocate().unwrap();
    let b = pool.allocate().unwrap();
    let ptr = pool.payload_ptr(&b).as_ptr();
    unsafe {
        pool.free_payload(ptr).unwrap();
        pool.free_payload(ptr).unwrap();
    }
    assert_eq!(pool.in_use(), 1);
    pool.verify().unwrap();
}

#[test]
#[should_panic]
fn test_16() {
    let mut pool_1 = FixedPool::new(LocalProvider, 4, 16).unwrap();
    let mut pool_2 = FixedPool::new(LocalProvider, 4, 16).unwrap();
    let h = pool_1.allocate().unwrap();
    let _ = pool_2.allocate().unwrap();
    pool_2.free(h);
}

#[test]
fn test_17() {
    let _guard = init();
    let mut pool = FixedPool::new(LocalProvider, 200, 4).unwrap();
    let _h = pool.allocate().unwrap();

    let walk = pool.debug_walk();
    assert_eq!(walk.len(), DEBUG_WALK_LIMIT);
    assert_eq!(walk[0].index, 1);
    assert_eq!(walk[0].prev, None);
    assert!(walk.iter().all(|s| !s.busy));

    let walk = pool.debug_walk_with_limit(5);
    assert_eq!(
        walk.iter().map(|s| s.index).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(format!("{}", walk[0]), "Slice[1]\tprev=None\tnext=Some(2)\tbusy=0");

    let full = pool.debug_walk_with_limit(usize::MAX);
    assert_eq!(full.len(), 200);
    assert_eq!(full.last().map(|s| (s.index, s.busy)), Some((0, true)));
}

#[test]
fn test_18() {
    let _guard = init();
    let pool = FixedPool::new(LocalProvider, 8, 4).unwrap();
    unsafe {
        let slot: *mut SliceHeader = pool.chain.slot(1);
        (*slot).next = 1;
    }
    assert!(matches!(
        pool.verify(),
        Err(PoolError::Corrupted { index: 1, .. })
    ));

    // The walk is bounded even though the chain now loops forever.
    let walk = pool.debug_walk();
    assert_eq!(walk.len(), DEBUG_WALK_LIMIT);
    assert!(walk[1].is_self_loop());
}

#[test]
fn test_19() {
    let pool = FixedPool::new(LocalProvider, 4, 8).unwrap();
    unsafe {
        // Busy flag without a matching in-use count.
        (*pool.chain.slot(3)).busy = 1;
    }
    assert!(matches!(pool.verify(), Err(PoolError::Corrupted { .. })));

    let pool = FixedPool::new(LocalProvider, 4, 8).unwrap();
    unsafe {
        (*pool.chain.slot(3)).busy = 1;
        (*pool.chain.slot(0)).busy = 1;
        (*pool.header()).used = 2;
    }
    // The count agrees, but a busy slot sits in front of free ones.
    assert!(matches!(
        pool.verify(),
        Err(PoolError::Corrupted { index: 1, .. })
    ));
}

#[test]
fn test_20() {
    assert!(matches!(
        FixedPool::new(LocalProvider, 0, 16),
        Err(PoolError::ZeroCapacity { .. })
    ));
    assert!(matches!(
        FixedPool::new(LocalProvider, 4, u32::MAX as usize + 1),
        Err(PoolError::SliceTooLarge { .. })
    ));
    assert!(matches!(
        FixedPool::new(LocalProvider, usize::MAX, 16),
        Err(PoolError::TooManySlices { .. })
    ));
    assert!(matches!(
        FixedPool::new(MmapProvider::with_map_file("/nonexistent-dir/map"), 4, 16),
        Err(PoolError::Arena(ArenaError::MapFailed(_)))
    ));
}

#[test]
fn test_21() {
    // Slots and payloads stay 8-byte aligned whatever the payload size.
    let mut pool = FixedPool::new(LocalProvider, 5, 13).unwrap();
    let handles: Vec<SliceHandle> = (0..5).map(|_| pool.allocate().unwrap()).collect();
    for h in &handles {
        assert_eq!(pool.payload_ptr(h).as_ptr() as usize % 8, 0);
        assert_eq!(pool.payload(h).len(), 13);
    }
    assert_eq!(
        pool.payload_ptr(&handles[1]).as_ptr() as usize
            - pool.payload_ptr(&handles[0]).as_ptr() as usize,
        32
    );
}

#[test]
fn test_22() {
    let _guard = init();
    let pool = FixedPool::attach(LocalProvider, foreign_pool(4, 16)).unwrap();
    assert_eq!(pool.capacity(), 4);
    assert_eq!(pool.in_use(), 0);
    drop(pool);

    // Header fields pointing outside the pool must not be adopted.
    let corruptions: [fn(&mut PoolHeader); 3] = [
        |h| h.head = 100_000,
        |h| h.tail = 4,
        |h| h.used = u32::MAX,
    ];
    for corrupt in corruptions {
        let provider = CountingProvider::default();
        let block = foreign_pool(4, 16);
        unsafe { corrupt(&mut *block.base().as_ptr().cast::<PoolHeader>()) };
        let err = FixedPool::attach(provider.clone(), block).unwrap_err();
        assert!(matches!(err, PoolError::Corrupted { .. }), "{err:?}");
        assert_eq!(provider.releases(), 1);
    }
}

#[test]
fn test_23() {
    // With empty payloads the last payload starts where the slot region ends.
    let mut pool = FixedPool::new(LocalProvider, 3, 0).unwrap();
    let handles: Vec<SliceHandle> = (0..3).map(|_| pool.allocate().unwrap()).collect();
    let ptrs: Vec<*const u8> = handles
        .iter()
        .map(|h| pool.payload_ptr(h).as_ptr() as *const u8)
        .collect();
    assert!(pool.payload(&handles[2]).is_empty());
    for ptr in &ptrs {
        unsafe { pool.free_payload(*ptr).unwrap() };
    }
    assert_eq!(pool.in_use(), 0);
    pool.verify().unwrap();

    let past_end = ptrs[2].wrapping_add(SLICE_HEADER_SIZE);
    assert!(matches!(
        unsafe { pool.free_payload(past_end) },
        Err(PoolError::InvalidFree { .. })
    ));
}

#[test]
fn test_24() {
    let _guard = init();
    let path = std::env::temp_dir().join(format!(
        "rusty_fixedpool-{}-persisted-pool",
        std::process::id()
    ));
    let provider = MmapProvider::with_map_file(&path);

    let mut pool = FixedPool::new(provider.clone(), 4, 16).unwrap();
    let size = pool.block().size();
    let mut kept = pool.allocate().unwrap();
    pool.payload_mut(&mut kept)[..4].copy_from_slice(b"kept");
    let index = kept.index();
    std::mem::forget(kept);
    pool.destroy().unwrap();

    // The map file still holds the pool; attaching picks it up unchanged.
    let block = provider.create(size).unwrap();
    let mut pool = FixedPool::attach(provider, block).unwrap();
    assert_eq!(pool.in_use(), 1);
    pool.verify().unwrap();
    let walk = pool.debug_walk();
    assert_eq!(walk.last().map(|s| (s.index, s.busy)), Some((index, true)));
    let next = pool.allocate().unwrap();
    assert_ne!(next.index(), index);
    pool.free(next);
    pool.destroy().unwrap();

    std::fs::remove_file(&path).unwrap();
}
