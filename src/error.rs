//! Error types for arena providers and pools.

use std::error::Error;
use std::fmt;
use std::io;

/// Errors raised while creating or releasing an arena block.
#[derive(Debug)]
pub enum ArenaError {
    /// A block of zero bytes (or one whose size overflows once a header is added) was requested.
    InvalidSize {
        /// Number of bytes requested.
        size: usize,
    },
    /// `mmap()` (or opening the map file) failed.
    MapFailed(io::Error),
    /// A System-V call failed.
    SegmentFailed {
        /// The failing call, e.g. `"shmget"`.
        op: &'static str,
        source: io::Error,
    },
    /// The process heap refused the allocation.
    OutOfMemory {
        /// Number of bytes requested.
        size: usize,
    },
    /// Releasing a block failed.
    ReleaseFailed(io::Error),
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize { size } => write!(f, "invalid arena size: {size} bytes"),
            Self::MapFailed(e) => write!(f, "mmap() failed: {e}"),
            Self::SegmentFailed { op, source } => write!(f, "{op}() failed: {source}"),
            Self::OutOfMemory { size } => write!(f, "out of memory: requested {size} bytes"),
            Self::ReleaseFailed(e) => write!(f, "failed to release arena: {e}"),
        }
    }
}

impl Error for ArenaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MapFailed(e) | Self::ReleaseFailed(e) => Some(e),
            Self::SegmentFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors raised by [`FixedPool`](crate::pools::FixedPool) construction and the raw free path.
#[derive(Debug)]
pub enum PoolError {
    /// The backing arena could not be created.
    Arena(ArenaError),
    /// The geometry leaves room for no slot at all.
    ZeroCapacity {
        /// Usable bytes after the pool header.
        usable: usize,
        /// Bytes taken by one slot (header + payload, aligned).
        stride: usize,
    },
    /// The payload size does not fit the in-band header fields.
    SliceTooLarge {
        /// Requested payload size.
        slice_size: usize,
    },
    /// More slots than an index link can address.
    TooManySlices {
        /// Requested slot count.
        slice_num: usize,
    },
    /// `attach()` found no initialised pool at the front of the block.
    NotAPool,
    /// `attach()` found a pool header that does not fit the block.
    GeometryMismatch {
        /// Bytes the header's geometry needs.
        required: usize,
        /// Bytes the block actually has.
        available: usize,
    },
    /// A payload pointer outside the slot region, or not on a slot boundary, was freed.
    InvalidFree {
        /// Address passed to the free call.
        addr: usize,
    },
    /// The slot chain violates the free-prefix/busy-suffix invariant.
    Corrupted {
        /// Slot at which the violation was detected.
        index: u32,
        reason: &'static str,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arena(e) => write!(f, "arena error: {e}"),
            Self::ZeroCapacity { usable, stride } => write!(
                f,
                "no slot fits: {usable} usable bytes, {stride} bytes per slot"
            ),
            Self::SliceTooLarge { slice_size } => {
                write!(f, "slice size {slice_size} is too large")
            }
            Self::TooManySlices { slice_num } => {
                write!(f, "slice count {slice_num} is too large")
            }
            Self::NotAPool => write!(f, "block does not contain an initialised pool"),
            Self::GeometryMismatch {
                required,
                available,
            } => write!(
                f,
                "pool geometry needs {required} bytes, block has {available} bytes"
            ),
            Self::InvalidFree { addr } => write!(f, "invalid free of address {addr:#x}"),
            Self::Corrupted { index, reason } => {
                write!(f, "slot chain corrupted at slot {index}: {reason}")
            }
        }
    }
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Arena(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArenaError> for PoolError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}
