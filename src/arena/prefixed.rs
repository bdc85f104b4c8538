//! `malloc`-style shared allocations that carry their own block metadata.
//!
//! Each allocation is a whole provider block whose first [`BLOCK_HEADER_SIZE`] bytes hold a
//! [`BlockHeader`] describing it. Callers only ever see the pointer past that header, and
//! can later free, reallocate or inspect it without keeping the [`Block`] around.
//!
//! ```text
//! ┌─────────────┬──────────────────────────────┐
//! │ BlockHeader │ payload (size bytes)        │
//! └─────────────┴──────────────────────────────┘
//! ^ block base  ^ returned pointer
//! ```

use core::ptr::{copy_nonoverlapping, NonNull};
use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use static_assertions::const_assert_eq;
use tracing::{debug, error, instrument};

use super::{Backing, Block, Provider, BLOCK_ALIGN};
use crate::error::ArenaError;

/// Map file names longer than this are truncated in the header.
pub const MAP_FILE_LEN: usize = 64;

pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

const BLOCK_MAGIC: u32 = 0x4658_4248;

const KIND_LOCAL: u32 = 1;
const KIND_MAPPED: u32 = 2;
const KIND_SYSV: u32 = 3;

const_assert_eq!(BLOCK_HEADER_SIZE, 96);
const_assert_eq!(BLOCK_HEADER_SIZE % BLOCK_ALIGN, 0);

/// In-band description of a prefixed block. Fixed layout so that any process holding
/// the payload pointer can release the block.
#[derive(Copy, Clone, Debug)]
#[repr(C, align(16))]
struct BlockHeader {
    magic: u32,
    kind: u32,
    /// Total block size, header included.
    size: u64,
    key: i32,
    shmid: i32,
    /// -1 if none.
    fd: i32,
    map_file_len: u32,
    map_file: [u8; MAP_FILE_LEN],
}

impl BlockHeader {
    fn describe(block: &Block) -> BlockHeader {
        let mut header = BlockHeader {
            magic: BLOCK_MAGIC,
            kind: KIND_LOCAL,
            size: block.size() as u64,
            key: 0,
            shmid: -1,
            fd: -1,
            map_file_len: 0,
            map_file: [0; MAP_FILE_LEN],
        };
        match block.backing() {
            Backing::Local => {}
            Backing::Mapped { fd, map_file } => {
                header.kind = KIND_MAPPED;
                header.fd = fd.unwrap_or(-1);
                if let Some(path) = map_file {
                    let bytes = path.as_os_str().as_bytes();
                    let len = bytes.len().min(MAP_FILE_LEN);
                    header.map_file[..len].copy_from_slice(&bytes[..len]);
                    header.map_file_len = len as u32;
                }
            }
            Backing::SysV { key, shmid } => {
                header.kind = KIND_SYSV;
                header.key = *key;
                header.shmid = *shmid;
            }
        }
        header
    }

    fn backing(&self) -> Backing {
        match self.kind {
            KIND_MAPPED => Backing::Mapped {
                fd: (self.fd >= 0).then_some(self.fd),
                map_file: (self.map_file_len > 0).then(|| {
                    let name = &self.map_file[..self.map_file_len as usize];
                    PathBuf::from(OsStr::from_bytes(name))
                }),
            },
            KIND_SYSV => Backing::SysV {
                key: self.key,
                shmid: self.shmid,
            },
            _ => Backing::Local,
        }
    }

    /// Rebuilds the block this header sits at the front of.
    ///
    /// # Safety
    /// `header` must point to a valid `BlockHeader` written by [`alloc_prefixed`].
    unsafe fn block_of(header: *const BlockHeader) -> Block {
        let h = header.read();
        debug_assert_eq!(h.magic, BLOCK_MAGIC, "Pointer was not returned by alloc_prefixed().");
        Block::from_raw_parts(
            NonNull::new_unchecked(header as *mut u8),
            h.size as usize,
            h.backing(),
        )
    }
}

#[inline(always)]
unsafe fn header_of(ptr: NonNull<u8>) -> *const BlockHeader {
    ptr.as_ptr().sub(BLOCK_HEADER_SIZE).cast()
}

/// Allocates `size` usable bytes from `provider`, returning a pointer past the block header.
#[instrument(level = "debug", skip(provider), err(Debug))]
pub fn alloc_prefixed<P: Provider + ?Sized>(
    provider: &P,
    size: usize,
) -> Result<NonNull<u8>, ArenaError> {
    let total = size
        .checked_add(BLOCK_HEADER_SIZE)
        .ok_or(ArenaError::InvalidSize { size })?;
    let block = provider.create(total)?;
    let header = BlockHeader::describe(&block);
    let base = block.base();
    unsafe {
        base.as_ptr().cast::<BlockHeader>().write(header);
        debug!(base = ?base.as_ptr(), total, "Wrote block header.");
        Ok(NonNull::new_unchecked(base.as_ptr().add(BLOCK_HEADER_SIZE)))
    }
}

/// Allocates a zero-filled array of `num` elements of `size` bytes each.
pub fn calloc_prefixed<P: Provider + ?Sized>(
    provider: &P,
    num: usize,
    size: usize,
) -> Result<NonNull<u8>, ArenaError> {
    let bytes = num
        .checked_mul(size)
        .ok_or(ArenaError::InvalidSize { size: usize::MAX })?;
    let ptr = alloc_prefixed(provider, bytes)?;
    // Joined System-V segments may hold old contents.
    unsafe { ptr.as_ptr().write_bytes(0, bytes) };
    Ok(ptr)
}

/// Returns how many usable bytes the allocation at `ptr` has.
///
/// # Safety
/// `ptr` must have been returned by one of the `*_prefixed` allocation functions
/// and not freed yet.
#[inline]
pub unsafe fn prefixed_size(ptr: NonNull<u8>) -> usize {
    (*header_of(ptr)).size as usize - BLOCK_HEADER_SIZE
}

/// Releases the allocation at `ptr` through `provider`.
///
/// # Safety
/// `ptr` must have been returned by one of the `*_prefixed` allocation functions of a
/// provider of the same kind as `provider`, and must not be used afterwards.
#[instrument(level = "debug", skip(provider))]
pub unsafe fn free_prefixed<P: Provider + ?Sized>(
    provider: &P,
    ptr: NonNull<u8>,
) -> Result<(), ArenaError> {
    let block = BlockHeader::block_of(header_of(ptr));
    provider.release(block)
}

/// Moves the allocation at `ptr` into a fresh block of `new_size` usable bytes.
/// The first `min(old, new_size)` bytes are copied; growth is never done in place.
///
/// If the new block can't be created, the old one is left untouched. If the old block
/// can't be released, the new block is released again and the error is returned, so the
/// caller keeps `ptr` exactly as the failed release left it.
///
/// # Safety
/// Same requirements as [`free_prefixed`].
pub unsafe fn realloc_prefixed<P: Provider + ?Sized>(
    provider: &P,
    ptr: NonNull<u8>,
    new_size: usize,
) -> Result<NonNull<u8>, ArenaError> {
    let old_size = prefixed_size(ptr);
    let new_ptr = alloc_prefixed(provider, new_size)?;
    copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
    if let Err(e) = free_prefixed(provider, ptr) {
        if let Err(release) = free_prefixed(provider, new_ptr) {
            error!(error = %release, "Couldn't release replacement block.");
        }
        return Err(e);
    }
    Ok(new_ptr)
}
