//! A singlethreaded fixed-size slice allocator.
//!
// For a general view of the pool's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## State lives in the arena
// The `FixedPool` struct itself only caches addresses. Head, tail and the in-use count
// sit in the `PoolHeader` at the front of the block so that every process mapping the
// block (forked or attached) operates on one pool. The same is true of the slot chain.
//
// ## Single-slot pools
// The chain never becomes empty: with one slot, head and tail coincide and allocate/free
// only flip the busy flag.

use self::util::{carve, checked_slice_size, required_size, Region, MAX_SLICES};
use crate::arena::{Block, Provider};
use crate::chain::{stride_for, Chain};
use crate::error::{ArenaError, PoolError};
use crate::header::{unlink, PoolHeader, SLICE_HEADER_SIZE};

use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, instrument, trace, warn, Level};

mod util;

/// Default cap on the number of slots [`FixedPool::debug_walk`] visits.
pub const DEBUG_WALK_LIMIT: usize = 100;

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Ownership of one allocated slot.
///
/// Handles can't be copied or forged, so a slot has at most one handle and a handle is
/// only accepted by the pool that produced it. [`FixedPool::free`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct SliceHandle {
    pool_id: u64,
    index: u32,
}

impl SliceHandle {
    /// Position of the slot in address order. Stable for the pool's lifetime, and the same
    /// in every process sharing the arena.
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Immutable slot placement, enough to resolve a handle to its payload without touching
/// the chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pool_id: u64,
    slots: NonNull<u8>,
    stride: usize,
    slice_size: usize,
    slice_num: u32,
}

// Geometry is a set of addresses that never change; payload access through it is gated by handles.
unsafe impl Send for Geometry {}
unsafe impl Sync for Geometry {}

impl Geometry {
    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slice_num as usize
    }

    #[inline(always)]
    pub(crate) fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// # Panics
    /// Panics if `handle` belongs to another pool.
    #[inline]
    pub(crate) fn payload_ptr(&self, handle: &SliceHandle) -> NonNull<u8> {
        assert_eq!(
            handle.pool_id, self.pool_id,
            "Handle belongs to another pool."
        );
        debug_assert!(handle.index < self.slice_num);
        unsafe {
            let offset = handle.index as usize * self.stride + SLICE_HEADER_SIZE;
            NonNull::new_unchecked(self.slots.as_ptr().add(offset))
        }
    }

    #[inline]
    pub(crate) fn payload<'a>(&'a self, handle: &'a SliceHandle) -> &'a [u8] {
        let ptr = self.payload_ptr(handle);
        unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.slice_size) }
    }

    #[inline]
    pub(crate) fn payload_mut<'a>(&'a self, handle: &'a mut SliceHandle) -> &'a mut [u8] {
        let ptr = self.payload_ptr(handle);
        unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), self.slice_size) }
    }

    /// Maps a payload address back to its slot index.
    fn index_of(&self, addr: usize) -> Option<u32> {
        let first = self.slots.as_ptr() as usize + SLICE_HEADER_SIZE;
        // Bounded by the last payload start: with empty payloads it sits at the region end.
        let last = first + (self.slice_num as usize - 1) * self.stride;
        if addr < first || addr > last || (addr - first) % self.stride != 0 {
            return None;
        }
        Some(((addr - first) / self.stride) as u32)
    }
}

/// One step of a [`FixedPool::debug_walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub index: u32,
    pub prev: Option<u32>,
    pub next: Option<u32>,
    pub busy: bool,
}

impl SliceInfo {
    /// A slot linked to itself means the chain is corrupted.
    #[inline]
    pub fn is_self_loop(&self) -> bool {
        self.next == Some(self.index)
    }
}

impl Display for SliceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slice[{}]\tprev={:?}\tnext={:?}\tbusy={}",
            self.index, self.prev, self.next, self.busy as u8
        )
    }
}

/// A single threaded fixed-size slice allocator.
///
/// The pool carves one arena block into `capacity()` slots of `slice_size()` payload bytes
/// each and hands them out in *O*(1). Running out of slots is an ordinary condition:
/// [`allocate`](FixedPool::allocate) just returns `None`.
///
/// The arena goes back to the provider on [`destroy`](FixedPool::destroy) or drop.
pub struct FixedPool<P: Provider> {
    chain: Chain,
    geometry: Geometry,
    block: ManuallyDrop<Block>,
    provider: P,
}

// The pool exclusively owns its block; the raw pointers only point into it.
unsafe impl<P: Provider + Send> Send for FixedPool<P> {}

impl<P: Provider> Debug for FixedPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedPool")
            .field("block", &*self.block)
            .field("slice_size", &self.geometry.slice_size)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl<P: Provider> FixedPool<P> {
    /// Creates a pool of `slice_num` slots of `slice_size` bytes in a fresh block from `provider`.
    #[instrument(level = "info", skip(provider), err(Debug, level = Level::ERROR))]
    pub fn new(provider: P, slice_num: usize, slice_size: usize) -> Result<Self, PoolError> {
        let (_, stride) = checked_slice_size(slice_size)?;
        if slice_num == 0 {
            return Err(PoolError::ZeroCapacity { usable: 0, stride });
        }
        if slice_num > MAX_SLICES {
            return Err(PoolError::TooManySlices { slice_num });
        }
        let size =
            required_size(slice_num, stride).ok_or(PoolError::TooManySlices { slice_num })?;
        debug!(stride, size, "Computed pool geometry.");

        let block = provider.create(size)?;
        Self::build(provider, block, slice_size, Some(slice_num))
    }

    /// Creates a pool in a block the caller already owns, fitting as many slots of
    /// `slice_size` bytes as the block holds. On error the block goes back to `provider`.
    #[instrument(level = "info", skip(provider), fields(block_size = block.size()), err(Debug, level = Level::ERROR))]
    pub fn with_block(provider: P, block: Block, slice_size: usize) -> Result<Self, PoolError> {
        Self::build(provider, block, slice_size, None)
    }

    /// Adopts a block that already holds an initialised pool, e.g. a System-V segment set up by
    /// another process or a map file kept from an earlier run. Nothing in the arena is modified.
    /// The whole chain is checked with [`verify`](FixedPool::verify) first, so this takes
    /// *O*(N). On error the block goes back to `provider`.
    #[instrument(level = "info", skip(provider), fields(block_size = block.size()), err(Debug, level = Level::ERROR))]
    pub fn attach(provider: P, block: Block) -> Result<Self, PoolError> {
        let checked = Self::check_attached(&block);
        match checked {
            Ok((region, header, stride)) => {
                let pool = Self::assemble(provider, block, region, stride, header);
                // Head, tail and count were written by someone else. Dropping the pool
                // hands the block back.
                if let Err(e) = pool.verify() {
                    error!(error = %e, ?header, "Refusing to attach corrupted pool.");
                    return Err(e);
                }
                debug!(?header, "Attached to existing pool.");
                Ok(pool)
            }
            Err(e) => Err(Self::give_back(provider, block, e)),
        }
    }

    fn check_attached(block: &Block) -> Result<(Region, PoolHeader, usize), PoolError> {
        let region = carve(block).ok_or(PoolError::NotAPool)?;
        let header = unsafe { region.pool.read() };
        if !header.is_initialised() || header.slice_num == 0 {
            return Err(PoolError::NotAPool);
        }
        let slice_size = header.slice_size as usize;
        let stride = stride_for(slice_size).ok_or(PoolError::SliceTooLarge { slice_size })?;
        let slots_size = (header.slice_num as usize)
            .checked_mul(stride)
            .ok_or(PoolError::NotAPool)?;
        if slots_size > region.usable {
            return Err(PoolError::GeometryMismatch {
                required: block.size() - region.usable + slots_size,
                available: block.size(),
            });
        }
        Ok((region, header, stride))
    }

    fn build(
        provider: P,
        block: Block,
        slice_size: usize,
        slice_num: Option<usize>,
    ) -> Result<Self, PoolError> {
        let (stored_size, stride) = match checked_slice_size(slice_size) {
            Ok(v) => v,
            Err(e) => return Err(Self::give_back(provider, block, e)),
        };
        let Some(region) = carve(&block) else {
            let e = PoolError::ZeroCapacity { usable: 0, stride };
            return Err(Self::give_back(provider, block, e));
        };
        let fits = (region.usable / stride).min(MAX_SLICES);
        let slice_num = slice_num.unwrap_or(fits);
        if slice_num == 0 || slice_num > fits {
            let e = PoolError::ZeroCapacity {
                usable: region.usable,
                stride,
            };
            return Err(Self::give_back(provider, block, e));
        }

        let mut chain = Chain::new(region.pool, region.slots, stride);
        unsafe { chain.init(stored_size, slice_num as u32) };
        let header = unsafe { region.pool.read() };
        debug!(slice_num, slice_size, stride, "Initialised slot chain.");
        Ok(Self::assemble(provider, block, region, stride, header))
    }

    fn assemble(
        provider: P,
        block: Block,
        region: Region,
        stride: usize,
        header: PoolHeader,
    ) -> Self {
        let geometry = Geometry {
            pool_id: next_pool_id(),
            slots: unsafe { NonNull::new_unchecked(region.slots) },
            stride,
            slice_size: header.slice_size as usize,
            slice_num: header.slice_num,
        };
        FixedPool {
            chain: Chain::new(region.pool, region.slots, stride),
            geometry,
            block: ManuallyDrop::new(block),
            provider,
        }
    }

    fn give_back(provider: P, block: Block, e: PoolError) -> PoolError {
        if let Err(release) = unsafe { provider.release(block) } {
            error!(error = %release, "Couldn't release block of failed pool.");
        }
        e
    }
}

impl<P: Provider> FixedPool<P> {
    #[inline(always)]
    fn header(&self) -> *mut PoolHeader {
        self.chain.pool()
    }

    /// Takes the slot at the head of the chain and moves it to the tail.
    /// Returns `None` without searching if the head slot is busy, i.e. the free prefix is empty.
    /// This operation has a time complexity of *O*(1).
    #[inline]
    pub fn allocate(&mut self) -> Option<SliceHandle> {
        unsafe {
            let pool = self.header();
            let index = (*pool).head;
            let slot = self.chain.slot(index);
            if (*slot).is_busy() {
                trace!(used = (*pool).used, "Pool exhausted.");
                return None;
            }
            (*slot).busy = 1;
            (*pool).used += 1;
            if (*pool).head != (*pool).tail {
                self.chain.remove(index);
                self.chain.push_back(index);
            }
            trace!(index, used = (*pool).used, "Allocated slice.");
            Some(SliceHandle {
                pool_id: self.geometry.pool_id,
                index,
            })
        }
    }

    /// Returns the slot owned by `handle` to the front of the free prefix.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Panics
    /// Panics if `handle` was produced by another pool.
    #[inline]
    pub fn free(&mut self, handle: SliceHandle) {
        assert_eq!(
            handle.pool_id, self.geometry.pool_id,
            "Handle belongs to another pool."
        );
        unsafe { self.release_slot(handle.index) }
    }

    /// Frees a slot by its payload address, as handed to code that only sees raw pointers
    /// (for instance another process mapping the same arena).
    ///
    /// Addresses outside the slot region, or inside it but not at a payload start, are
    /// rejected with [`PoolError::InvalidFree`]. Freeing an already free slot is tolerated
    /// but trips a debug assertion.
    ///
    /// # Safety
    /// No [`SliceHandle`] for the slot may be used afterwards.
    pub unsafe fn free_payload(&mut self, ptr: *const u8) -> Result<(), PoolError> {
        let addr = ptr as usize;
        let Some(index) = self.geometry.index_of(addr) else {
            error!(addr, "Invalid free.");
            return Err(PoolError::InvalidFree { addr });
        };
        self.release_slot(index);
        Ok(())
    }

    /// # Safety
    /// `index` must be below the slot count.
    unsafe fn release_slot(&mut self, index: u32) {
        let pool = self.header();
        let slot = self.chain.slot(index);

        let busy = (*slot).is_busy();
        debug_assert!(busy, "Slice {index} freed twice.");
        if !busy {
            warn!(index, "Double free ignored.");
            return;
        }
        (*slot).busy = 0;
        (*pool).used -= 1;
        trace!(index, used = (*pool).used, "Freed slice.");

        // Already at the front of the free prefix.
        if (*slot).prev().is_none() {
            return;
        }
        self.chain.remove(index);
        self.chain.push_front(index);
    }

    /// Number of slots currently allocated.
    #[inline]
    pub fn in_use(&self) -> usize {
        unsafe { (*self.header()).used as usize }
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.geometry.capacity()
    }

    /// Payload bytes per slot.
    #[inline]
    pub fn slice_size(&self) -> usize {
        self.geometry.slice_size()
    }

    /// Whether the next [`allocate`](FixedPool::allocate) would return `None`.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        unsafe { (*self.chain.slot((*self.header()).head)).is_busy() }
    }

    /// The arena block backing this pool.
    #[inline]
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Address of the slot's payload, for callers passing it on as a raw pointer.
    ///
    /// # Panics
    /// Panics if `handle` was produced by another pool.
    #[inline]
    pub fn payload_ptr(&self, handle: &SliceHandle) -> NonNull<u8> {
        self.geometry.payload_ptr(handle)
    }

    /// # Panics
    /// Panics if `handle` was produced by another pool.
    #[inline]
    pub fn payload<'a>(&'a self, handle: &'a SliceHandle) -> &'a [u8] {
        self.geometry.payload(handle)
    }

    /// # Panics
    /// Panics if `handle` was produced by another pool.
    #[inline]
    pub fn payload_mut<'a>(&'a self, handle: &'a mut SliceHandle) -> &'a mut [u8] {
        self.geometry.payload_mut(handle)
    }

    pub(crate) fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Walks the chain from its head, visiting at most [`DEBUG_WALK_LIMIT`] slots.
    pub fn debug_walk(&self) -> Vec<SliceInfo> {
        self.debug_walk_with_limit(DEBUG_WALK_LIMIT)
    }

    /// Walks the chain from its head, visiting at most `limit` slots. Every step is also
    /// emitted as a `debug` event. The walk stops early at a link pointing outside the pool.
    #[instrument(level = "debug", skip(self))]
    pub fn debug_walk_with_limit(&self, limit: usize) -> Vec<SliceInfo> {
        let slice_num = self.geometry.slice_num;
        let mut out = Vec::with_capacity(limit.min(slice_num as usize));
        let mut cur = unsafe { unlink((*self.header()).head) };

        while let Some(index) = cur {
            if out.len() >= limit {
                break;
            }
            if index >= slice_num {
                warn!(index, "Link points outside the pool, stopping walk.");
                break;
            }
            let header = unsafe { *self.chain.slot(index) };
            let info = SliceInfo {
                index,
                prev: header.prev(),
                next: header.next(),
                busy: header.is_busy(),
            };
            if info.is_self_loop() {
                warn!(index, "Slice links to itself.");
            }
            debug!(line = out.len(), "{info}");
            out.push(info);
            cur = info.next;
        }
        out
    }

    /// Checks that the chain holds every slot exactly once, in a free prefix followed by a
    /// busy suffix, and that the in-use count agrees. Visits at most `capacity()` slots.
    pub fn verify(&self) -> Result<(), PoolError> {
        let pool = unsafe { self.header().read() };
        let slice_num = pool.slice_num;
        let corrupted = |index, reason| Err(PoolError::Corrupted { index, reason });

        let mut cur = unlink(pool.head);
        let mut prev = None;
        let mut seen = 0_u32;
        let mut free = 0_u32;
        let mut in_busy_suffix = false;

        while let Some(index) = cur {
            if index >= slice_num {
                return corrupted(index, "link points outside the pool");
            }
            if seen == slice_num {
                return corrupted(index, "chain is longer than the slot count");
            }
            let header = unsafe { *self.chain.slot(index) };
            if header.prev() != prev {
                return corrupted(index, "back link does not match chain order");
            }
            if header.is_busy() {
                in_busy_suffix = true;
            } else if in_busy_suffix {
                return corrupted(index, "free slot inside the busy suffix");
            } else {
                free += 1;
            }
            seen += 1;
            prev = Some(index);
            cur = header.next();
        }

        if seen != slice_num {
            return corrupted(prev.unwrap_or(pool.head), "chain is shorter than the slot count");
        }
        if unlink(pool.tail) != prev {
            return corrupted(pool.tail, "tail does not end the chain");
        }
        if slice_num - free != pool.used {
            return corrupted(pool.head, "in-use count disagrees with busy flags");
        }
        Ok(())
    }

    /// Returns the arena to the provider. All payloads become invalid.
    pub fn destroy(self) -> Result<(), ArenaError> {
        let mut this = ManuallyDrop::new(self);
        unsafe {
            let block = ManuallyDrop::take(&mut this.block);
            debug!(?block, "Destroying pool.");
            let result = this.provider.release(block);
            ptr::drop_in_place(&mut this.provider);
            result
        }
    }
}

impl<P: Provider> Drop for FixedPool<P> {
    fn drop(&mut self) {
        let block = unsafe { ManuallyDrop::take(&mut self.block) };
        debug!(?block, "Dropping pool.");
        if let Err(e) = unsafe { self.provider.release(block) } {
            error!(error = %e, "Couldn't release pool arena.");
        }
    }
}

#[cfg(test)]
mod tests;
