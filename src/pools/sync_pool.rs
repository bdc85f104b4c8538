//! A multithreaded fixed-size slice allocator.

use crate::arena::Provider;
use crate::error::{ArenaError, PoolError};
use crate::pools::fixed_pool::{FixedPool, Geometry, SliceHandle, SliceInfo};

use core::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A multithreaded fixed-size slice allocator.
///
/// This allocator is just a `Mutex` wrapper over [`FixedPool`] to allow for multithreading.
/// Only chain updates take the lock; payload access goes straight to the arena, since a
/// slot's payload bytes are never touched by the allocator and each slot has one handle.
///
/// The lock only serialises threads of this process. Processes sharing the arena must
/// still keep to disjoint pools or bring their own cross-process lock.
pub struct SyncFixedPool<P: Provider> {
    inner: Mutex<FixedPool<P>>,
    geometry: Geometry,
}

impl<P: Provider> SyncFixedPool<P> {
    pub fn new(pool: FixedPool<P>) -> Self {
        SyncFixedPool {
            geometry: pool.geometry(),
            inner: Mutex::new(pool),
        }
    }

    /// Allocation and free never leave the chain half updated, so a poisoned lock
    /// still guards a consistent pool.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, FixedPool<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn allocate(&self) -> Option<SliceHandle> {
        self.lock().allocate()
    }

    /// # Panics
    /// Panics if `handle` was produced by another pool.
    #[inline]
    pub fn free(&self, handle: SliceHandle) {
        self.lock().free(handle)
    }

    /// See [`FixedPool::free_payload`].
    ///
    /// # Safety
    /// No [`SliceHandle`] for the slot may be used afterwards.
    pub unsafe fn free_payload(&self, ptr: *const u8) -> Result<(), PoolError> {
        self.lock().free_payload(ptr)
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use()
    }

    pub fn capacity(&self) -> usize {
        self.geometry.capacity()
    }

    pub fn slice_size(&self) -> usize {
        self.geometry.slice_size()
    }

    pub fn payload_ptr(&self, handle: &SliceHandle) -> NonNull<u8> {
        self.geometry.payload_ptr(handle)
    }

    pub fn payload<'a>(&'a self, handle: &'a SliceHandle) -> &'a [u8] {
        self.geometry.payload(handle)
    }

    pub fn payload_mut<'a>(&'a self, handle: &'a mut SliceHandle) -> &'a mut [u8] {
        self.geometry.payload_mut(handle)
    }

    pub fn debug_walk(&self) -> Vec<SliceInfo> {
        self.lock().debug_walk()
    }

    pub fn verify(&self) -> Result<(), PoolError> {
        self.lock().verify()
    }

    pub fn into_inner(self) -> FixedPool<P> {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the arena to the provider. All payloads become invalid.
    pub fn destroy(self) -> Result<(), ArenaError> {
        self.into_inner().destroy()
    }
}
