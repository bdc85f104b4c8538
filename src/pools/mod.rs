//! The [`FixedPool`] and [`SyncFixedPool`] allocators.

pub mod fixed_pool;
pub mod sync_pool;

pub use fixed_pool::{FixedPool, SliceHandle, SliceInfo, DEBUG_WALK_LIMIT};
pub use sync_pool::SyncFixedPool;
