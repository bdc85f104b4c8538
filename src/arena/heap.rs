//! Process-private blocks on the global heap.

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use tracing::{debug, error, instrument};

use super::{Backing, Block, Provider, BLOCK_ALIGN};
use crate::error::ArenaError;

/// A provider that allocates ordinary process-private memory.
/// Pools built on it are invisible to other processes, even forked ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

#[inline]
fn layout_for(size: usize) -> Result<Layout, ArenaError> {
    if size == 0 {
        return Err(ArenaError::InvalidSize { size });
    }
    Layout::from_size_align(size, BLOCK_ALIGN).map_err(|_| ArenaError::InvalidSize { size })
}

/// Allocates a zero-filled, [`BLOCK_ALIGN`]-aligned block of `size` bytes on the heap.
#[instrument(level = "debug", err(Debug))]
pub fn create_local(size: usize) -> Result<Block, ArenaError> {
    let layout = layout_for(size)?;
    let Some(base) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
        error!(size, "Heap allocation failed.");
        return Err(ArenaError::OutOfMemory { size });
    };
    debug!(base = ?base.as_ptr(), size, "Allocated local block.");
    Ok(unsafe { Block::from_raw_parts(base, size, Backing::Local) })
}

/// Frees a block made by [`create_local`].
///
/// # Safety
/// `block` must not be used afterwards.
///
/// # Panics
/// Panics if `block` is not a local block.
#[instrument(level = "debug")]
pub unsafe fn release_local(block: Block) {
    assert_eq!(
        *block.backing(),
        Backing::Local,
        "Block was not allocated on the local heap."
    );
    let layout = Layout::from_size_align_unchecked(block.size(), BLOCK_ALIGN);
    dealloc(block.base().as_ptr(), layout);
}

unsafe impl Provider for LocalProvider {
    fn create(&self, size: usize) -> Result<Block, ArenaError> {
        create_local(size)
    }

    unsafe fn release(&self, block: Block) -> Result<(), ArenaError> {
        release_local(block);
        Ok(())
    }
}
