//! Shared blocks backed by `mmap()`.
//!
//! Anonymous `MAP_SHARED` mappings are inherited by forked children, which then see
//! every write made through the same pages. File-backed mappings (classically `/dev/zero`)
//! are available for systems or use cases where anonymous mappings don't fit.

use core::ptr::{null_mut, NonNull};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use libc::{c_int, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use tracing::{debug, error, instrument, warn};

use super::{Backing, Block, Provider};
use crate::error::ArenaError;
use crate::util::find_divisible;

/// Mappings at least this large are worth backing with huge pages.
pub const HUGE_PAGE_THRESHOLD: usize = 2 * 1024 * 1024;

/// Huge-page mappings are rounded up to a multiple of this size.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A provider that maps shared memory with `mmap()`.
#[derive(Debug, Clone, Default)]
pub struct MmapProvider {
    map_file: Option<PathBuf>,
    huge_page_threshold: Option<usize>,
}

impl MmapProvider {
    /// Anonymous shared mappings, no huge pages.
    #[inline]
    pub const fn new() -> Self {
        MmapProvider {
            map_file: None,
            huge_page_threshold: None,
        }
    }

    /// Maps `path` instead of anonymous memory. Regular files are grown to the requested size
    /// and never truncated, so an existing file is mapped with its old contents.
    pub fn with_map_file(path: impl Into<PathBuf>) -> Self {
        MmapProvider {
            map_file: Some(path.into()),
            huge_page_threshold: None,
        }
    }

    /// Requests `MAP_HUGETLB` for anonymous mappings of at least `threshold` bytes.
    /// Getting regular pages instead is not an error.
    pub fn huge_pages(mut self, threshold: Option<usize>) -> Self {
        self.huge_page_threshold = threshold;
        self
    }

    pub fn map_file(&self) -> Option<&Path> {
        self.map_file.as_deref()
    }
}

/// Maps `size` bytes of anonymous shared memory.
pub fn create_mapped(size: usize) -> Result<Block, ArenaError> {
    MmapProvider::new().create(size)
}

#[inline]
unsafe fn raw_mmap(size: usize, flags: c_int, fd: RawFd) -> Result<NonNull<u8>, io::Error> {
    let mem = libc::mmap(null_mut(), size, PROT_READ | PROT_WRITE, flags, fd, 0);
    if mem == MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(mem.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
}

#[instrument(level = "debug", err(Debug))]
fn open_map_file(path: &Path, size: usize) -> Result<RawFd, ArenaError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(ArenaError::MapFailed)?;
    let meta = file.metadata().map_err(ArenaError::MapFailed)?;
    if meta.is_file() && meta.len() < size as u64 {
        debug!(old_len = meta.len(), size, "Growing map file.");
        file.set_len(size as u64).map_err(ArenaError::MapFailed)?;
    }
    Ok(file.into_raw_fd())
}

impl MmapProvider {
    #[cfg(target_os = "linux")]
    fn try_huge_pages(&self, size: usize, flags: c_int) -> Option<Block> {
        let threshold = self.huge_page_threshold?;
        if size < threshold {
            return None;
        }
        let rounded = find_divisible(size, HUGE_PAGE_SIZE)?;
        match unsafe { raw_mmap(rounded, flags | libc::MAP_HUGETLB, -1) } {
            Ok(base) => {
                debug!(base = ?base.as_ptr(), size = rounded, "Mapped huge pages.");
                let backing = Backing::Mapped {
                    fd: None,
                    map_file: None,
                };
                Some(unsafe { Block::from_raw_parts(base, rounded, backing) })
            }
            Err(e) => {
                warn!(error = %e, size, "Huge pages unavailable, falling back to regular pages.");
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn try_huge_pages(&self, _size: usize, _flags: c_int) -> Option<Block> {
        None
    }
}

unsafe impl Provider for MmapProvider {
    #[instrument(level = "debug", skip(self), fields(map_file = ?self.map_file), err(Debug))]
    fn create(&self, size: usize) -> Result<Block, ArenaError> {
        if size == 0 {
            return Err(ArenaError::InvalidSize { size });
        }

        let Some(path) = self.map_file.as_deref() else {
            let flags = MAP_SHARED | libc::MAP_ANONYMOUS;
            if let Some(block) = self.try_huge_pages(size, flags) {
                return Ok(block);
            }
            let base = unsafe { raw_mmap(size, flags, -1) }.map_err(|e| {
                error!(error = %e, size, "mmap() failed.");
                ArenaError::MapFailed(e)
            })?;
            debug!(base = ?base.as_ptr(), size, "Mapped anonymous block.");
            let backing = Backing::Mapped {
                fd: None,
                map_file: None,
            };
            return Ok(unsafe { Block::from_raw_parts(base, size, backing) });
        };

        let fd = open_map_file(path, size)?;
        match unsafe { raw_mmap(size, MAP_SHARED, fd) } {
            Ok(base) => {
                debug!(base = ?base.as_ptr(), size, fd, "Mapped file-backed block.");
                let backing = Backing::Mapped {
                    fd: Some(fd),
                    map_file: Some(path.to_path_buf()),
                };
                Ok(unsafe { Block::from_raw_parts(base, size, backing) })
            }
            Err(e) => {
                error!(error = %e, size, "mmap() failed.");
                unsafe { libc::close(fd) };
                Err(ArenaError::MapFailed(e))
            }
        }
    }

    unsafe fn release(&self, block: Block) -> Result<(), ArenaError> {
        release_mapped(block);
        Ok(())
    }
}

/// Unmaps a block made by an [`MmapProvider`] and closes its map file, if any.
///
/// # Safety
/// `block` must not be used afterwards.
///
/// # Panics
/// Panics if `block` is not a mapped block or if `munmap()` rejects it. A failed unmap
/// means the address space no longer matches what the block describes.
#[instrument(level = "debug")]
pub unsafe fn release_mapped(block: Block) {
    let Backing::Mapped { fd, .. } = *block.backing() else {
        panic!("Block was not created by mmap().");
    };
    if libc::munmap(block.base().as_ptr().cast(), block.size()) != 0 {
        let e = io::Error::last_os_error();
        error!(error = %e, ?block, "munmap() failed.");
        panic!("munmap() failed: {e}");
    }
    if let Some(fd) = fd {
        libc::close(fd);
    }
}
