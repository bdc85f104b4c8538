//! Defines the in-band [`SliceHeader`] and [`PoolHeader`] structs and associated constants.
//!
//! Both headers live inside the arena itself, so their layout is a contract between
//! every process that maps the same block: it is `#[repr(C)]` and pinned by `const_assert!`.

use std::mem::{align_of, size_of};

use static_assertions::const_assert_eq;

pub const SLICE_HEADER_SIZE: usize = size_of::<SliceHeader>();
pub const SLICE_HEADER_ALIGN: usize = align_of::<SliceHeader>();

pub const POOL_HEADER_SIZE: usize = size_of::<PoolHeader>();

/// Marks an absent link in a [`SliceHeader`] or [`PoolHeader`].
pub const NIL: u32 = u32::MAX;

/// Written at the front of every initialised pool ("FXP1").
pub const POOL_MAGIC: u32 = 0x4658_5031;

const_assert_eq!(SLICE_HEADER_SIZE, 16);
const_assert_eq!(SLICE_HEADER_ALIGN, 8);
const_assert_eq!(POOL_HEADER_SIZE, 24);

#[inline(always)]
pub fn link(index: Option<u32>) -> u32 {
    index.unwrap_or(NIL)
}

#[inline(always)]
pub fn unlink(raw: u32) -> Option<u32> {
    (raw != NIL).then_some(raw)
}

/// The header preceding every slot payload.
///
/// `prev` and `next` are slot indices in chain order, not addresses, so the chain stays
/// valid no matter where each process maps the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct SliceHeader {
    pub prev: u32,
    pub next: u32,
    /// 0 = free, anything else = busy. Not a lock.
    pub busy: u32,
}

impl SliceHeader {
    /// Creates the header of a free slot with the given neighbors.
    #[inline(always)]
    pub fn new(prev: Option<u32>, next: Option<u32>) -> SliceHeader {
        SliceHeader {
            prev: link(prev),
            next: link(next),
            busy: 0,
        }
    }

    #[inline(always)]
    pub fn prev(&self) -> Option<u32> {
        unlink(self.prev)
    }

    #[inline(always)]
    pub fn next(&self) -> Option<u32> {
        unlink(self.next)
    }

    #[inline(always)]
    pub fn is_busy(&self) -> bool {
        self.busy != 0
    }
}

/// Pool-wide state, stored at the very start of the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct PoolHeader {
    pub magic: u32,
    pub slice_size: u32,
    pub slice_num: u32,
    pub used: u32,
    /// First slot in chain order, the front of the free prefix.
    pub head: u32,
    /// Last slot in chain order, the back of the busy suffix.
    pub tail: u32,
}

impl PoolHeader {
    /// Creates the header of a pool whose slots are all free and chained in address order.
    ///
    /// # Panics
    /// Panics in debug builds if `slice_num` is 0 or collides with [`NIL`].
    #[inline]
    pub fn new(slice_size: u32, slice_num: u32) -> PoolHeader {
        debug_assert!(slice_num > 0 && slice_num != NIL);
        PoolHeader {
            magic: POOL_MAGIC,
            slice_size,
            slice_num,
            used: 0,
            head: 0,
            tail: slice_num - 1,
        }
    }

    #[inline(always)]
    pub fn is_initialised(&self) -> bool {
        self.magic == POOL_MAGIC
    }
}
