// # Cached SG Vector Object
//
// `SgvObj` is one allocation as the pools see it: the SG list handed to
// callers, the optional per-page translation table, the order (or, for
// un-cacheable allocations, the negated page count), the timestamp of the
// most recent return to the cache, and the tail-trim bookkeeping needed
// to restore the last reported entry when the object comes back.

use std::mem;
use std::sync::Weak;
use std::time::Instant;

use crate::page_source::AllocatorPriv;
use crate::pool::SgvPool;
use crate::types::{constants, SgEntry, TransTblEntry, PAGE_MASK, PAGE_SIZE};

/// Storage-layout thresholds of a pool, derived from the embedded-block
/// budget.
///
/// For `order <= max_local_order` both the SG array and (for clustered
/// pools) the translation table are sized up front at object construction,
/// so the populate path never reallocates; for
/// `order <= max_trans_order` only the translation table is; above both,
/// the arrays are sized lazily when the object is first populated.
#[derive(Debug, Clone, Copy)]
pub struct ObjLayout {
    pub max_local_order: usize,
    pub max_trans_order: usize,
}

impl ObjLayout {
    /// Computes the thresholds for a pool with the given clustering
    /// setting against [`constants::EMBED_BUDGET`].
    pub fn compute(clustered: bool) -> Self {
        let base = mem::size_of::<SgvObj>();
        let per_sg = mem::size_of::<SgEntry>()
            + if clustered {
                mem::size_of::<TransTblEntry>()
            } else {
                0
            };
        let per_trans = mem::size_of::<TransTblEntry>();

        let mut layout = ObjLayout {
            max_local_order: 0,
            max_trans_order: 0,
        };
        for order in 0..=constants::MAX_ORDER_LIMIT {
            let entries = 1usize << order;
            if base + entries * per_sg <= constants::EMBED_BUDGET {
                layout.max_local_order = order;
            }
            if base + entries * per_trans <= constants::EMBED_BUDGET {
                layout.max_trans_order = order;
            }
        }
        layout
    }
}

/// One cached (or stand-alone) scatter-gather vector.
pub struct SgvObj {
    /// Positive: the bucket order of a cached object. Negative: the
    /// negated page count of an un-cacheable allocation.
    pub(crate) order_or_pages: i32,
    /// Number of live SG entries after clustering.
    pub(crate) sg_count: usize,
    pub(crate) sg_entries: Vec<SgEntry>,
    /// Per-page translation table; empty for unclustered pools and for
    /// objects that were never populated.
    pub(crate) trans_tbl: Vec<TransTblEntry>,
    /// Most recent return to the cache.
    pub(crate) timestamp: Instant,
    /// Index and original length of the last reported SG entry, so the
    /// per-call tail trim can be reverted.
    pub(crate) orig_sg: usize,
    pub(crate) orig_length: usize,
    /// Opaque page-source cookie.
    pub(crate) allocator_priv: AllocatorPriv,
    /// Owning pool; non-owning back-reference. The pool outlives all its
    /// cached objects.
    pub(crate) owner: Weak<SgvPool>,
}

impl SgvObj {
    pub(crate) fn new_cached(
        order: usize,
        clustered: bool,
        layout: ObjLayout,
        owner: Weak<SgvPool>,
        now: Instant,
    ) -> Box<Self> {
        let entries = 1usize << order;
        let sg_entries = if order <= layout.max_local_order {
            Vec::with_capacity(entries)
        } else {
            Vec::new()
        };
        let trans_tbl = if clustered && order <= layout.max_trans_order {
            Vec::with_capacity(entries)
        } else {
            Vec::new()
        };
        Box::new(Self {
            order_or_pages: order as i32,
            sg_count: 0,
            sg_entries,
            trans_tbl,
            timestamp: now,
            orig_sg: 0,
            orig_length: 0,
            allocator_priv: None,
            owner,
        })
    }

    pub(crate) fn new_uncached(pages: usize, owner: Weak<SgvPool>, now: Instant) -> Box<Self> {
        Box::new(Self {
            order_or_pages: -(pages as i32),
            sg_count: 0,
            sg_entries: Vec::new(),
            trans_tbl: Vec::new(),
            timestamp: now,
            orig_sg: 0,
            orig_length: 0,
            allocator_priv: None,
            owner,
        })
    }

    /// The raw order-or-pages encoding: a bucket order when non-negative,
    /// the negated page count of an un-cacheable allocation otherwise.
    pub fn order_or_pages(&self) -> i32 {
        self.order_or_pages
    }

    /// Bucket order, for cacheable objects.
    pub fn order(&self) -> Option<usize> {
        (self.order_or_pages >= 0).then_some(self.order_or_pages as usize)
    }

    pub fn is_cacheable(&self) -> bool {
        self.order_or_pages >= 0
    }

    /// Page capacity of the object: the bucket size for cached objects,
    /// the exact page count for un-cacheable ones.
    pub fn pages(&self) -> usize {
        if self.order_or_pages >= 0 {
            1 << self.order_or_pages
        } else {
            (-self.order_or_pages) as usize
        }
    }

    /// Pages actually backed by memory right now: zero for an object that
    /// was handed back empty after an allocation failure.
    pub fn backing_pages(&self) -> usize {
        if self.sg_count == 0 {
            0
        } else {
            self.pages()
        }
    }

    /// Number of live SG entries after clustering.
    pub fn sg_count(&self) -> usize {
        self.sg_count
    }

    /// The full SG list of the object. Callers of `alloc` should use the
    /// reported entry count, which may be smaller than `sg_count` when
    /// fewer pages than the bucket holds were requested.
    pub fn sg(&self) -> &[SgEntry] {
        &self.sg_entries[..self.sg_count]
    }

    /// The translation table, if the pool clusters.
    pub fn trans_tbl(&self) -> &[TransTblEntry] {
        &self.trans_tbl
    }

    /// Page-source cookie attached to this object.
    pub fn allocator_priv_mut(&mut self) -> &mut AllocatorPriv {
        &mut self.allocator_priv
    }

    /// Entry count to report for a request of `pages` pages. Clustered
    /// objects may cover those pages with fewer entries than `sg_count`.
    pub(crate) fn reported_count(&self, pages: usize) -> usize {
        if self.trans_tbl.is_empty() {
            pages
        } else {
            self.trans_tbl[pages - 1].sg_num as usize
        }
    }

    /// Records the last reported entry and trims its length so the
    /// reported list ends exactly at `size` within its final page.
    pub(crate) fn trim_tail(&mut self, count: usize, size: usize) {
        let last = count - 1;
        self.orig_sg = last;
        self.orig_length = self.sg_entries[last].length;
        let residue = size & PAGE_MASK;
        if residue != 0 {
            self.sg_entries[last].length -= PAGE_SIZE - residue;
        }
    }

    /// Reverts the most recent tail trim.
    pub(crate) fn restore_tail(&mut self) {
        if self.sg_count != 0 && self.orig_length != 0 {
            self.sg_entries[self.orig_sg].length = self.orig_length;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageRef;

    fn test_obj(order: usize, clustered: bool) -> Box<SgvObj> {
        let layout = ObjLayout::compute(clustered);
        SgvObj::new_cached(order, clustered, layout, Weak::new(), Instant::now())
    }

    #[test]
    fn test_layout_thresholds() {
        let clustered = ObjLayout::compute(true);
        let plain = ObjLayout::compute(false);

        // The translation table competes with the SG array for the
        // embedded budget, so clustering can only lower the local order.
        assert!(clustered.max_local_order <= plain.max_local_order);
        // The table alone is denser than table + SG array.
        assert!(clustered.max_trans_order >= clustered.max_local_order);
        assert!(plain.max_local_order >= 1);
        assert!(clustered.max_local_order <= constants::MAX_ORDER_LIMIT);
    }

    #[test]
    fn test_small_order_preallocates() {
        let obj = test_obj(2, true);
        assert!(obj.sg_entries.capacity() >= 4);
        assert!(obj.trans_tbl.capacity() >= 4);
        assert_eq!(obj.sg_count(), 0);
        assert_eq!(obj.backing_pages(), 0);
        assert_eq!(obj.pages(), 4);
    }

    #[test]
    fn test_order_encoding() {
        let cached = test_obj(3, false);
        assert_eq!(cached.order_or_pages(), 3);
        assert_eq!(cached.order(), Some(3));
        assert!(cached.is_cacheable());
        assert_eq!(cached.pages(), 8);

        let large = SgvObj::new_uncached(64, Weak::new(), Instant::now());
        assert_eq!(large.order_or_pages(), -64);
        assert_eq!(large.order(), None);
        assert!(!large.is_cacheable());
        assert_eq!(large.pages(), 64);
    }

    #[test]
    fn test_trim_and_restore() {
        let mut obj = test_obj(2, false);
        for pg in 0..4 {
            let mut entry = SgEntry::default();
            entry.set_page(PageRef::from_frame(10 + pg), PAGE_SIZE, 0);
            obj.sg_entries.push(entry);
        }
        obj.sg_count = 4;

        // 10000 bytes over 3 pages: the third entry is trimmed to 1808.
        obj.trim_tail(3, 10000);
        assert_eq!(obj.sg_entries[2].length, 10000 - 2 * PAGE_SIZE);
        assert_eq!(obj.orig_sg, 2);
        assert_eq!(obj.orig_length, PAGE_SIZE);

        obj.restore_tail();
        assert_eq!(obj.sg_entries[2].length, PAGE_SIZE);

        // Page-multiple sizes record the tail but do not trim it.
        obj.trim_tail(4, 4 * PAGE_SIZE);
        assert_eq!(obj.sg_entries[3].length, PAGE_SIZE);
        obj.restore_tail();
        assert_eq!(obj.sg_entries[3].length, PAGE_SIZE);
    }
}
