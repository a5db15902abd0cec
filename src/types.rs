// # SGV Core Types
//
// Fundamental types shared across the allocator: scatter-gather entries,
// page references, the per-page translation table, clustering modes and
// allocation flags, plus the page/order arithmetic used by every layer.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Base-2 logarithm of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes. All SG entries start page-aligned; only the tail of
/// the last reported entry may be trimmed below a page multiple.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask covering the sub-page part of a byte size.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Subsystem-wide tunables.
pub mod constants {
    use std::time::Duration;

    /// Default high watermark in pages (256MB with 4KB pages). Admission
    /// above this triggers a synchronous shrink sweep.
    pub const DEFAULT_HI_WATERMARK: usize = 65536;

    /// Default low watermark in pages. Shrink sweeps stop once the global
    /// page total drops to this level.
    pub const DEFAULT_LO_WATERMARK: usize = 49152;

    /// Default largest cached order: allocations up to 2^10 pages (4MB)
    /// are served from the per-pool caches.
    pub const DEFAULT_MAX_ORDER: usize = 10;

    /// Hard cap on the configurable bucket count.
    pub const MAX_ORDER_LIMIT: usize = 16;

    /// Default age after which a cached entry becomes purgeable, and the
    /// delay of the per-pool purge worker.
    pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

    /// Per-pool page cap for one round of the cross-pool shrinker, so a
    /// single pool does not absorb the whole sweep.
    pub const MAX_PAGES_PER_POOL_SHRINK: usize = 32;

    /// Age filter used when the external shrinker hook asks for reclaim.
    pub const SHRINK_AGE: Duration = Duration::from_secs(10);

    /// Byte budget for the embedded-storage layout of a cached object;
    /// determines `max_local_order` and `max_trans_order`.
    pub const EMBED_BUDGET: usize = 4096;
}

/// Reference to one backing page: the page-aligned base address of the
/// page in the address space of the page source that produced it.
///
/// Physical adjacency, the property clustering exploits, is expressed as
/// consecutive frame numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef(usize);

impl PageRef {
    /// Wraps a page-aligned base address.
    pub fn from_addr(addr: usize) -> Self {
        debug_assert_eq!(addr & PAGE_MASK, 0, "page address must be aligned");
        Self(addr)
    }

    /// Builds a reference from a frame number.
    pub fn from_frame(frame: usize) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    pub fn addr(&self) -> usize {
        self.0
    }

    pub fn frame_number(&self) -> usize {
        self.0 >> PAGE_SHIFT
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{}", self.frame_number())
    }
}

/// One scatter-gather entry: a run of physically contiguous memory
/// starting `offset` bytes into `page` and covering `length` bytes.
///
/// A cleared entry (`page == None`, `length == 0`) is a hole left behind
/// by a clustering merge and is never reported to callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgEntry {
    pub page: Option<PageRef>,
    pub offset: usize,
    pub length: usize,
}

impl SgEntry {
    /// Assigns a page run to this entry.
    pub fn set_page(&mut self, page: PageRef, length: usize, offset: usize) {
        self.page = Some(page);
        self.length = length;
        self.offset = offset;
    }

    /// Clears the entry after its page run was merged into another entry.
    pub fn clear(&mut self) {
        self.page = None;
        self.offset = 0;
        self.length = 0;
    }

    /// Number of pages this entry covers, counting a trimmed tail page as
    /// a whole page.
    pub fn page_run(&self) -> usize {
        self.length.div_ceil(PAGE_SIZE)
    }
}

/// Translation-table entry for one page position of an SG vector.
///
/// `sg_num` is the 1-based index of the SG entry containing the page;
/// `pg_count` is the page index at which that entry begins. Together they
/// let a caller map a byte offset into the vector without walking
/// variable-length entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransTblEntry {
    pub sg_num: u32,
    pub pg_count: u32,
}

/// Page clustering policy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusteringMode {
    /// Every page becomes its own SG entry.
    None,
    /// Merge only with the immediately preceding entry.
    Tail,
    /// Merge with any prior entry, head or tail, using the most recent
    /// merge index as a hint before a backwards scan.
    Full,
}

impl ClusteringMode {
    pub fn is_clustered(&self) -> bool {
        !matches!(self, ClusteringMode::None)
    }
}

impl fmt::Display for ClusteringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusteringMode::None => write!(f, "none"),
            ClusteringMode::Tail => write!(f, "tail"),
            ClusteringMode::Full => write!(f, "full"),
        }
    }
}

bitflags! {
    /// Behaviour modifiers for [`SgvPool::alloc`](crate::SgvPool::alloc).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Force the un-cacheable regime; the object is never admitted to
        /// a cache.
        const NO_CACHED = 1 << 0;
        /// Return without calling the page source when the cache misses.
        const NO_ALLOC_ON_CACHE_MISS = 1 << 1;
        /// On page-source failure (or a miss under
        /// `NO_ALLOC_ON_CACHE_MISS`), hand the empty object back to the
        /// caller for a later retry instead of destroying it.
        const RETURN_OBJ_ON_ALLOC_FAIL = 1 << 2;
    }
}

/// Number of whole pages needed to back `size` bytes.
pub fn pages_for_size(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Allocation order for a page count: the smallest `k` with
/// `2^k >= pages`. Bucket `k` holds allocations of exactly `2^k` pages.
pub fn order_for_pages(pages: usize) -> usize {
    debug_assert!(pages > 0);
    pages.next_power_of_two().trailing_zeros() as usize
}

/// Page count of a bucket order.
pub fn pages_for_order(order: usize) -> usize {
    1 << order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_math() {
        assert_eq!(pages_for_size(1), 1);
        assert_eq!(pages_for_size(PAGE_SIZE), 1);
        assert_eq!(pages_for_size(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for_size(10000), 3);

        assert_eq!(order_for_pages(1), 0);
        assert_eq!(order_for_pages(2), 1);
        assert_eq!(order_for_pages(3), 2);
        assert_eq!(order_for_pages(4), 2);
        assert_eq!(order_for_pages(5), 3);

        assert_eq!(pages_for_order(0), 1);
        assert_eq!(pages_for_order(4), 16);
    }

    #[test]
    fn test_page_ref_frames() {
        let page = PageRef::from_frame(100);
        assert_eq!(page.frame_number(), 100);
        assert_eq!(page.addr(), 100 << PAGE_SHIFT);
        assert_eq!(PageRef::from_addr(page.addr()), page);
    }

    #[test]
    fn test_sg_entry_page_run() {
        let mut entry = SgEntry::default();
        entry.set_page(PageRef::from_frame(7), PAGE_SIZE, 0);
        assert_eq!(entry.page_run(), 1);

        entry.length = 3 * PAGE_SIZE;
        assert_eq!(entry.page_run(), 3);

        // Trimmed tails still count as a whole page.
        entry.length = 3 * PAGE_SIZE - 100;
        assert_eq!(entry.page_run(), 3);

        entry.clear();
        assert_eq!(entry.page_run(), 0);
        assert!(entry.page.is_none());
    }

    #[test]
    fn test_clustering_mode() {
        assert!(!ClusteringMode::None.is_clustered());
        assert!(ClusteringMode::Tail.is_clustered());
        assert!(ClusteringMode::Full.is_clustered());
        assert_eq!(ClusteringMode::Full.to_string(), "full");
    }
}
