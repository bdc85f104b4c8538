//! Geometry helpers specific to the [`FixedPool`](super::FixedPool).

use crate::arena::Block;
use crate::chain::stride_for;
use crate::error::PoolError;
use crate::header::{PoolHeader, NIL, POOL_HEADER_SIZE, SLICE_HEADER_ALIGN};
use crate::util::find_aligned;

/// Slot indices must stay clear of [`NIL`].
pub const MAX_SLICES: usize = (NIL - 1) as usize;

/// Where the pool header and slots go inside a block.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub pool: *mut PoolHeader,
    pub slots: *mut u8,
    /// Bytes available for slots.
    pub usable: usize,
}

/// Validates `slice_size` and returns it as stored in the pool header, with the slot stride.
#[inline]
pub fn checked_slice_size(slice_size: usize) -> Result<(u32, usize), PoolError> {
    let too_large = PoolError::SliceTooLarge { slice_size };
    let stored = u32::try_from(slice_size).map_err(|_| too_large)?;
    let stride = stride_for(slice_size).ok_or(PoolError::SliceTooLarge { slice_size })?;
    Ok((stored, stride))
}

/// Bytes a block needs to hold a pool of `slice_num` slots spaced `stride` apart.
#[inline]
pub fn required_size(slice_num: usize, stride: usize) -> Option<usize> {
    slice_num.checked_mul(stride)?.checked_add(POOL_HEADER_SIZE)
}

/// Splits `block` into the pool header followed by the slot region,
/// or returns `None` if the header does not fit.
pub fn carve(block: &Block) -> Option<Region> {
    let base = block.base().as_ptr();
    let pool = find_aligned(base, SLICE_HEADER_ALIGN)? as *mut u8;
    let offset = (pool as usize - base as usize).checked_add(POOL_HEADER_SIZE)?;
    let usable = block.size().checked_sub(offset)?;
    Some(Region {
        pool: pool.cast(),
        slots: base.wrapping_add(offset),
        usable,
    })
}
