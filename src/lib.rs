//! A fixed-size slice allocator over process-local or shared memory arenas.
//!
//! This crate serves workloads that allocate and free many records of one size at a high rate
//! (connection slots, buffers, session objects) and want every operation to be *O*(1), to never
//! search, and to keep working when the memory is shared with forked or cooperating processes.
//!
//! # Usage
//! ```toml
//! [dependencies]
//! rusty_fixedpool = "0.1"
//! ```
//!
//! ```
//! use rusty_fixedpool::FixedPool;
//! use rusty_fixedpool::arena::MmapProvider;
//!
//! // 4 slots of 16 bytes in an anonymous shared mapping.
//! let mut pool = FixedPool::new(MmapProvider::new(), 4, 16).unwrap();
//!
//! let mut slot = pool.allocate().unwrap();
//! pool.payload_mut(&mut slot)[..5].copy_from_slice(b"hello");
//! assert_eq!(&pool.payload(&slot)[..5], b"hello");
//!
//! pool.free(slot);
//! pool.destroy().unwrap();
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`FixedPool`] and [`SyncFixedPool`].
//! Use [`FixedPool`] from a single thread (or one per worker),
//! [`SyncFixedPool`] is just a `Mutex` wrapper over it to allow for multithreading.
//!
//! Neither one synchronises *processes*. Processes sharing an arena should each own
//! disjoint pools, or bring their own cross-process lock around allocate/free.
//!
//! # Mode of operation
//! The pool uses one doubly-linked list, the [chain](#chain), holding every slot:
//! - On allocation the slot at the head of the chain is inspected. If it is free it is
//!   marked busy and moved to the tail. If it is busy, no free slot exists anywhere and
//!   the allocation fails immediately.
//! - On deallocation the slot is marked free and moved to the head.
//!
//! Below is a list of the abstractions used by the pool for operating on the arena:
//!
//! ## Arena
//! The arena is one contiguous block handed out by a [provider](#providers).
//! It starts with a pool header (slot size, slot count, in-use count, head and tail)
//! followed by the slots:
//!
//! ```text
//! ┌─────────────┬────────────────────┬────────────────────┬─────┐
//! │ PoolHeader  │ Slot 0             │ Slot 1             │ ... │
//! │             │ header │ payload   │ header │ payload   │     │
//! └─────────────┴────────────────────┴────────────────────┴─────┘
//! ```
//!
//! Everything the pool mutates lives in the arena, so a forked child or a process that
//! [`attach`](FixedPool::attach)es the same segment sees the same pool.
//!
//! ## Slots
//! A slot is a small header (previous link, next link, busy flag) followed by the payload.
//! Links are slot indices rather than addresses, so they stay valid wherever each process
//! maps the arena. Callers never see slot headers: they hold a [`SliceHandle`] and reach
//! the payload through it.
//!
//! ## Chain
//! The chain is split into a *free prefix* starting at the head and a *busy suffix* ending
//! at the tail. Allocation moves the head slot to the tail and deallocation moves a slot to
//! the head, so the split is never broken and finding a free slot never takes a search.
//!
//! ## Providers
//! A provider is the pool's source of memory. The pool is generic over it, and anything that
//! implements [`Provider`] can back a pool:
//! - [`LocalProvider`] - process-private heap memory.
//! - [`MmapProvider`] - `mmap()` shared memory, anonymous or file-backed, optionally on huge pages.
//! - [`SysvProvider`] - System-V shared memory segments.
//!
//! The [`arena`] module also offers `malloc`-style shared allocations
//! ([`alloc_prefixed`](arena::alloc_prefixed) and friends) whose block metadata travels in a
//! header in front of the returned pointer.
//!
//! [`Provider`]: arena::Provider
//! [`LocalProvider`]: arena::LocalProvider
//! [`MmapProvider`]: arena::MmapProvider
//! [`SysvProvider`]: arena::SysvProvider

pub use crate::error::{ArenaError, PoolError};
pub use crate::pools::{FixedPool, SliceHandle, SliceInfo, SyncFixedPool};

pub mod arena;
mod chain;
pub mod error;
mod header;
pub mod pools;
mod util;
