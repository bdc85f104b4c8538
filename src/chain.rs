//! Defines the [`Chain`] struct, the doubly-linked list threaded through every slot header.
//!
//! The chain always holds all `N` slots of a pool. Its front is the free prefix and its
//! back is the busy suffix; the pool keeps that split intact by only ever moving slots
//! between the two ends.

use crate::header::{link, PoolHeader, SliceHeader, NIL, SLICE_HEADER_ALIGN, SLICE_HEADER_SIZE};
use crate::util::find_divisible;

/// Returns the distance between two consecutive slot headers for payloads of `slice_size`
/// bytes, or `None` if it overflows.
#[inline]
pub fn stride_for(slice_size: usize) -> Option<usize> {
    find_divisible(SLICE_HEADER_SIZE.checked_add(slice_size)?, SLICE_HEADER_ALIGN)
}

/// A view over the pool header and slot headers of an arena.
#[derive(Debug, Clone, Copy)]
pub struct Chain {
    pool: *mut PoolHeader,
    slots: *mut u8,
    stride: usize,
}

impl Chain {
    #[inline]
    pub const fn new(pool: *mut PoolHeader, slots: *mut u8, stride: usize) -> Self {
        Chain {
            pool,
            slots,
            stride,
        }
    }

    /// Writes a fresh pool header and links all `slice_num` slots in address order.
    /// This operation has a time complexity of *O*(N).
    ///
    /// # Safety
    /// This function is unsafe since it assumes that the pool header and `slice_num` slots
    /// of `self.stride` bytes are writable and not in use.
    pub unsafe fn init(&mut self, slice_size: u32, slice_num: u32) {
        debug_assert!(slice_num > 0 && slice_num != NIL);
        debug_assert_eq!(self.pool as usize % SLICE_HEADER_ALIGN, 0);
        debug_assert_eq!(self.slots as usize % SLICE_HEADER_ALIGN, 0);

        self.pool.write(PoolHeader::new(slice_size, slice_num));
        for i in 0..slice_num {
            let prev = i.checked_sub(1);
            let next = (i + 1 < slice_num).then_some(i + 1);
            self.slot(i).write(SliceHeader::new(prev, next));
        }
    }

    #[inline(always)]
    pub fn pool(&self) -> *mut PoolHeader {
        self.pool
    }

    /// Returns a pointer to the header of slot `index`.
    ///
    /// # Safety
    /// `index` must be below the pool's slot count.
    #[inline(always)]
    pub unsafe fn slot(&self, index: u32) -> *mut SliceHeader {
        self.slots.add(index as usize * self.stride).cast()
    }

    /// Unlinks slot `index` from wherever it sits in the chain.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// The chain must hold at least two slots and `index` must be one of them.
    pub unsafe fn remove(&mut self, index: u32) {
        let slot = self.slot(index);
        let prev = (*slot).prev();
        let next = (*slot).next();
        debug_assert!(prev.is_some() || next.is_some(), "Chain should not become empty.");

        match prev {
            None => (*self.pool).head = link(next),
            Some(p) => (*self.slot(p)).next = link(next),
        }
        match next {
            None => (*self.pool).tail = link(prev),
            Some(n) => (*self.slot(n)).prev = link(prev),
        }
    }

    /// Links the detached slot `index` in front of the current head.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `index` must have been unlinked with [`remove`](Chain::remove) and the chain must not be empty.
    pub unsafe fn push_front(&mut self, index: u32) {
        let head = (*self.pool).head;
        let slot = self.slot(index);
        (*slot).prev = NIL;
        (*slot).next = head;
        (*self.slot(head)).prev = index;
        (*self.pool).head = index;
    }

    /// Links the detached slot `index` behind the current tail.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `index` must have been unlinked with [`remove`](Chain::remove) and the chain must not be empty.
    pub unsafe fn push_back(&mut self, index: u32) {
        let tail = (*self.pool).tail;
        let slot = self.slot(index);
        (*slot).next = NIL;
        (*slot).prev = tail;
        (*self.slot(tail)).next = index;
        (*self.pool).tail = index;
    }
}
