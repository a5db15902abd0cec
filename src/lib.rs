// SgvPool - Caching, clustering scatter-gather vector pool allocator
// Core library module

mod cluster;
pub mod error;
pub mod manager;
pub mod mem_limit;
pub mod obj;
pub mod page_source;
pub mod pool;
pub mod purge;
pub mod types;

pub use error::{Result, SgvError};
pub use manager::{GlobalStatsSnapshot, SgvConfig, SgvManager};
pub use mem_limit::{MemoryLimit, PageQuota};
pub use obj::SgvObj;
pub use page_source::{AllocatorPriv, PageSource, SystemPageSource};
pub use pool::{BucketStatsSnapshot, PoolStatsSnapshot, SgvAlloc, SgvPool};
pub use purge::{
    Clock, DelayedExecutor, ManualExecutor, SystemClock, Task, TaskHandle, TimerExecutor,
    VirtualClock,
};
pub use types::{
    order_for_pages, pages_for_order, pages_for_size, AllocFlags, ClusteringMode, PageRef,
    SgEntry, TransTblEntry, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
};
