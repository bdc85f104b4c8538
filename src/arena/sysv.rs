//! Shared blocks backed by System-V shared memory segments.

use core::ptr::{null, NonNull};
use std::io;

use libc::{c_int, key_t, IPC_CREAT, IPC_PRIVATE, IPC_RMID};
use tracing::{debug, error, instrument};

use super::{Backing, Block, Provider, BLOCK_ALIGN};
use crate::error::ArenaError;

/// Permission bits for newly created segments: owner read/write.
pub const SYSV_DEFAULT_MODE: u32 = 0o600;

/// A provider that creates (or joins) a System-V segment and attaches it.
///
/// Key `0` means `IPC_PRIVATE`: a fresh segment only the creating process and its
/// children can reach. Any other key names a segment unrelated processes can join.
#[derive(Debug, Clone, Copy)]
pub struct SysvProvider {
    key: key_t,
    mode: u32,
    remove_on_release: bool,
}

impl SysvProvider {
    /// A provider for the segment named `key`.
    /// Releasing detaches only; the segment outlives the block.
    #[inline]
    pub const fn new(key: key_t) -> Self {
        SysvProvider {
            key,
            mode: SYSV_DEFAULT_MODE,
            remove_on_release: false,
        }
    }

    /// A provider for private segments. Releasing also marks the segment for removal,
    /// since nothing else could ever find it.
    #[inline]
    pub const fn private() -> Self {
        SysvProvider {
            key: IPC_PRIVATE,
            mode: SYSV_DEFAULT_MODE,
            remove_on_release: true,
        }
    }

    pub const fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub const fn remove_on_release(mut self, remove: bool) -> Self {
        self.remove_on_release = remove;
        self
    }

    #[inline(always)]
    pub fn key(&self) -> key_t {
        self.key
    }
}

/// Creates or joins the segment named `key` (`0` for a private one) and attaches it.
pub fn create_sysv(size: usize, key: key_t) -> Result<Block, ArenaError> {
    SysvProvider::new(key).create(size)
}

unsafe impl Provider for SysvProvider {
    #[instrument(level = "debug", skip(self), fields(key = self.key), err(Debug))]
    fn create(&self, size: usize) -> Result<Block, ArenaError> {
        if size == 0 {
            return Err(ArenaError::InvalidSize { size });
        }
        let key = if self.key == 0 { IPC_PRIVATE } else { self.key };

        let shmid = unsafe { libc::shmget(key, size, IPC_CREAT | self.mode as c_int) };
        if shmid < 0 {
            let source = io::Error::last_os_error();
            error!(error = %source, size, "shmget() failed.");
            return Err(ArenaError::SegmentFailed { op: "shmget", source });
        }

        let mem = unsafe { libc::shmat(shmid, null(), 0) };
        if mem as isize == -1 {
            let source = io::Error::last_os_error();
            error!(error = %source, shmid, "shmat() failed.");
            if key == IPC_PRIVATE {
                // Nobody else can reach it.
                unsafe { libc::shmctl(shmid, IPC_RMID, core::ptr::null_mut()) };
            }
            return Err(ArenaError::SegmentFailed { op: "shmat", source });
        }
        let Some(base) = NonNull::new(mem.cast::<u8>()) else {
            return Err(ArenaError::SegmentFailed {
                op: "shmat",
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            });
        };
        debug_assert_eq!(base.as_ptr() as usize % BLOCK_ALIGN, 0);

        debug!(base = ?base.as_ptr(), size, shmid, "Attached segment.");
        Ok(unsafe { Block::from_raw_parts(base, size, Backing::SysV { key, shmid }) })
    }

    unsafe fn release(&self, block: Block) -> Result<(), ArenaError> {
        release_sysv(block, self.remove_on_release)
    }
}

/// Detaches a segment block. With `remove` set the segment is also marked for destruction
/// once every process has detached.
///
/// # Safety
/// `block` must not be used afterwards.
///
/// # Panics
/// Panics if `block` is not a System-V block.
#[instrument(level = "debug")]
pub unsafe fn release_sysv(block: Block, remove: bool) -> Result<(), ArenaError> {
    let Backing::SysV { shmid, .. } = *block.backing() else {
        panic!("Block is not a System-V segment.");
    };
    if libc::shmdt(block.base().as_ptr().cast()) != 0 {
        let e = io::Error::last_os_error();
        error!(error = %e, shmid, "shmdt() failed.");
        return Err(ArenaError::ReleaseFailed(e));
    }
    if remove && libc::shmctl(shmid, IPC_RMID, core::ptr::null_mut()) != 0 {
        let e = io::Error::last_os_error();
        error!(error = %e, shmid, "shmctl(IPC_RMID) failed.");
        return Err(ArenaError::ReleaseFailed(e));
    }
    Ok(())
}
