//! The [`Provider`] trait, the [`Block`] it hands out and the structures that implement it.
//!
//! A provider is the pool's only link to the operating system: it is asked for one
//! contiguous, zero-filled block when a pool is built and asked to take it back when the
//! pool is destroyed. Nothing in between touches the OS.

use core::ptr::NonNull;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::error::ArenaError;

pub use heap::{create_local, release_local, LocalProvider};
pub use mmap::{create_mapped, release_mapped, MmapProvider, HUGE_PAGE_SIZE, HUGE_PAGE_THRESHOLD};
pub use prefixed::{
    alloc_prefixed, calloc_prefixed, free_prefixed, prefixed_size, realloc_prefixed,
    BLOCK_HEADER_SIZE, MAP_FILE_LEN,
};
pub use sysv::{create_sysv, release_sysv, SysvProvider, SYSV_DEFAULT_MODE};

mod heap;
mod mmap;
mod prefixed;
mod sysv;

/// Every block base is aligned to at least this many bytes.
pub const BLOCK_ALIGN: usize = 16;

/// The mechanism that produced a [`Block`], with whatever it needs to be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Process-private heap memory.
    Local,
    /// An `mmap()` region. `fd` and `map_file` are set for file-backed mappings only.
    Mapped {
        fd: Option<RawFd>,
        map_file: Option<PathBuf>,
    },
    /// An attached System-V shared segment.
    SysV { key: libc::key_t, shmid: libc::c_int },
}

impl Backing {
    /// Whether other processes can see this memory.
    #[inline]
    pub fn is_shared(&self) -> bool {
        !matches!(self, Backing::Local)
    }
}

/// One contiguous arena block `[base, base + size)`.
///
/// A block is never resized. It is released exactly once, by handing it back
/// to a provider of the matching kind.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    base: NonNull<u8>,
    size: usize,
    backing: Backing,
}

// The block is a plain owned address range.
unsafe impl Send for Block {}

impl Block {
    /// # Safety
    /// `[base, base + size)` must be a live allocation made by the mechanism `backing` names,
    /// aligned to [`BLOCK_ALIGN`] and owned by nobody else.
    #[inline]
    pub(crate) unsafe fn from_raw_parts(base: NonNull<u8>, size: usize, backing: Backing) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % BLOCK_ALIGN, 0);
        Block {
            base,
            size,
            backing,
        }
    }

    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn backing(&self) -> &Backing {
        &self.backing
    }
}

/// A trait for types that can hand out and take back arena [`Block`]s.
///
/// # Safety
/// * blocks returned by [`create`](Provider::create) must be readable, writable,
///   aligned to [`BLOCK_ALIGN`] and live until passed to [`release`](Provider::release).
/// * freshly made memory must be zero-filled. Memory that already existed is joined as is:
///   a named System-V segment or an existing map file keeps its contents, which is what
///   lets [`FixedPool::attach`](crate::FixedPool::attach) pick up a pool left there.
///   [`FixedPool::new`](crate::FixedPool::new) reinitialises whatever it is given.
pub unsafe trait Provider {
    /// Obtains a block of at least `size` bytes.
    fn create(&self, size: usize) -> Result<Block, ArenaError>;

    /// Returns `block` to the operating system.
    ///
    /// # Safety
    /// `block` must come from a provider of the same kind and must not be used afterwards.
    ///
    /// # Panics
    /// Panics if `block` was made by a different kind of provider.
    unsafe fn release(&self, block: Block) -> Result<(), ArenaError>;
}

unsafe impl<T: Provider + ?Sized> Provider for &T {
    fn create(&self, size: usize) -> Result<Block, ArenaError> {
        (**self).create(size)
    }

    unsafe fn release(&self, block: Block) -> Result<(), ArenaError> {
        (**self).release(block)
    }
}
