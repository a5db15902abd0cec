// # Per-Pool SGV Cache
//
// A pool hands out scatter-gather vectors by bucket order and caches them
// on return. Cached objects live in two lists at once: their bucket's
// free-list (keyed by order, sorted by ascending SG count for clustered
// pools) and the pool-wide LRU ordered by return timestamp. Both lists
// are intrusive over an arena of slots so an object can be unlinked from
// either in O(1).
//
// Locking: the pool mutex guards the arena, both lists and the cache
// counters. It is never held across a call into the page source or
// across destroying an object; eviction walks re-acquire it per step.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::cluster;
use crate::error::{Result, SgvError};
use crate::manager::SgvShared;
use crate::mem_limit::MemoryLimit;
use crate::obj::{ObjLayout, SgvObj};
use crate::page_source::PageSource;
use crate::purge::TaskHandle;
use crate::types::{
    constants, order_for_pages, pages_for_order, pages_for_size, AllocFlags, ClusteringMode,
};

/// Outcome of [`SgvPool::alloc`].
pub enum SgvAlloc {
    /// Fully populated allocation: the reported SG list is
    /// `obj.sg()[..count]`, with the tail entry trimmed to the request.
    Ready { obj: Box<SgvObj>, count: usize },
    /// The object could not be populated but is handed back empty for a
    /// later retry (see [`AllocFlags::RETURN_OBJ_ON_ALLOC_FAIL`]); it can
    /// be supplied back to `alloc` or released with `free`.
    Deferred { obj: Box<SgvObj> },
    /// Cache miss under [`AllocFlags::NO_ALLOC_ON_CACHE_MISS`]; nothing
    /// was allocated.
    Miss,
}

/// Per-bucket allocation counters.
#[derive(Debug, Default)]
pub(crate) struct BucketStats {
    pub(crate) hit_alloc: AtomicU64,
    pub(crate) total_alloc: AtomicU64,
    pub(crate) merged: AtomicU64,
}

/// Read-only view of one bucket's counters.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatsSnapshot {
    pub order: usize,
    pub hit_alloc: u64,
    pub total_alloc: u64,
    pub merged: u64,
}

/// Read-only view of a pool's cache state.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub name: String,
    pub clustering: ClusteringMode,
    pub cached_entries: usize,
    pub cached_pages: usize,
    pub inactive_cached_pages: usize,
    pub buckets: Vec<BucketStatsSnapshot>,
}

/// Arena slot: the cached object plus its intrusive links into the bucket
/// free-list and the pool LRU.
struct Slot {
    obj: Option<Box<SgvObj>>,
    order: usize,
    bucket_prev: Option<usize>,
    bucket_next: Option<usize>,
    lru_prev: Option<usize>,
    lru_next: Option<usize>,
}

#[derive(Default, Clone, Copy)]
struct BucketList {
    head: Option<usize>,
    tail: Option<usize>,
}

struct PoolInner {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    buckets: Vec<BucketList>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    cached_entries: usize,
    cached_pages: usize,
    inactive_cached_pages: usize,
    purge_scheduled: bool,
    purge_handle: Option<TaskHandle>,
    in_active_ring: bool,
    destroying: bool,
}

impl PoolInner {
    fn slot_obj(&self, idx: usize) -> &SgvObj {
        self.slots[idx]
            .obj
            .as_ref()
            .expect("linked slot must hold an object")
    }

    fn insert_slot(&mut self, obj: Box<SgvObj>, order: usize) -> usize {
        let slot = Slot {
            obj: Some(obj),
            order,
            bucket_prev: None,
            bucket_next: None,
            lru_prev: None,
            lru_next: None,
        };
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Box<SgvObj> {
        let obj = self.slots[idx]
            .obj
            .take()
            .expect("linked slot must hold an object");
        self.free_slots.push(idx);
        obj
    }

    /// First bucket position whose object has at least `sg_count` SG
    /// entries; inserting before it keeps the list ascending with LIFO
    /// order among equals.
    fn sorted_bucket_position(&self, order: usize, sg_count: usize) -> Option<usize> {
        let mut cur = self.buckets[order].head;
        while let Some(idx) = cur {
            if self.slot_obj(idx).sg_count >= sg_count {
                return Some(idx);
            }
            cur = self.slots[idx].bucket_next;
        }
        None
    }

    fn bucket_link_before(&mut self, idx: usize, before: Option<usize>, order: usize) {
        match before {
            None => {
                let old_tail = self.buckets[order].tail;
                self.slots[idx].bucket_prev = old_tail;
                self.slots[idx].bucket_next = None;
                match old_tail {
                    Some(tail) => self.slots[tail].bucket_next = Some(idx),
                    None => self.buckets[order].head = Some(idx),
                }
                self.buckets[order].tail = Some(idx);
            }
            Some(next) => {
                let prev = self.slots[next].bucket_prev;
                self.slots[idx].bucket_prev = prev;
                self.slots[idx].bucket_next = Some(next);
                self.slots[next].bucket_prev = Some(idx);
                match prev {
                    Some(prev) => self.slots[prev].bucket_next = Some(idx),
                    None => self.buckets[order].head = Some(idx),
                }
            }
        }
    }

    fn bucket_link_front(&mut self, idx: usize, order: usize) {
        let old_head = self.buckets[order].head;
        self.bucket_link_before(idx, old_head, order);
    }

    fn bucket_unlink(&mut self, idx: usize) {
        let order = self.slots[idx].order;
        let prev = self.slots[idx].bucket_prev.take();
        let next = self.slots[idx].bucket_next.take();
        match prev {
            Some(prev) => self.slots[prev].bucket_next = next,
            None => self.buckets[order].head = next,
        }
        match next {
            Some(next) => self.slots[next].bucket_prev = prev,
            None => self.buckets[order].tail = prev,
        }
    }

    fn lru_link_tail(&mut self, idx: usize) {
        let old_tail = self.lru_tail;
        self.slots[idx].lru_prev = old_tail;
        self.slots[idx].lru_next = None;
        match old_tail {
            Some(tail) => self.slots[tail].lru_next = Some(idx),
            None => self.lru_head = Some(idx),
        }
        self.lru_tail = Some(idx);
    }

    fn lru_unlink(&mut self, idx: usize) {
        let prev = self.slots[idx].lru_prev.take();
        let next = self.slots[idx].lru_next.take();
        match prev {
            Some(prev) => self.slots[prev].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(next) => self.slots[next].lru_prev = prev,
            None => self.lru_tail = prev,
        }
    }
}

/// A named SGV pool: cached allocations up to `2^max_order` pages, plus
/// pass-through service for larger, un-cacheable requests.
pub struct SgvPool {
    name: String,
    clustering: ClusteringMode,
    layout: ObjLayout,
    max_order: usize,
    purge_interval: Duration,
    shared_pool: bool,
    refcount: AtomicUsize,
    page_source: RwLock<Arc<dyn PageSource>>,
    bucket_stats: Vec<BucketStats>,
    inner: Mutex<PoolInner>,
    shared: Arc<SgvShared>,
    weak_self: Weak<SgvPool>,
}

enum CacheGet {
    /// Object unlinked from the free-list. It may be empty if it was
    /// handed back after a failed population; the caller repopulates it.
    Cached(Box<SgvObj>),
    /// Free-list empty; the cache counters were charged for a fresh
    /// object the caller is expected to create (or forget on failure).
    Miss,
}

impl SgvPool {
    pub(crate) fn new(
        name: &str,
        clustering: ClusteringMode,
        shared_pool: bool,
        shared: Arc<SgvShared>,
    ) -> Arc<Self> {
        let max_order = shared.config().max_order;
        Arc::new_cyclic(|weak_self| Self {
            name: name.to_string(),
            clustering,
            layout: ObjLayout::compute(clustering.is_clustered()),
            max_order,
            purge_interval: shared.config().purge_interval,
            shared_pool,
            refcount: AtomicUsize::new(1),
            page_source: RwLock::new(shared.default_source()),
            bucket_stats: (0..=max_order).map(|_| BucketStats::default()).collect(),
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free_slots: Vec::new(),
                buckets: vec![BucketList::default(); max_order + 1],
                lru_head: None,
                lru_tail: None,
                cached_entries: 0,
                cached_pages: 0,
                inactive_cached_pages: 0,
                purge_scheduled: false,
                purge_handle: None,
                in_active_ring: false,
                destroying: false,
            }),
            shared,
            weak_self: weak_self.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clustering(&self) -> ClusteringMode {
        self.clustering
    }

    pub fn is_shared(&self) -> bool {
        self.shared_pool
    }

    /// Largest cached order; requests above it take the un-cacheable path.
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn cached_entries(&self) -> usize {
        self.inner.lock().cached_entries
    }

    pub fn cached_pages(&self) -> usize {
        self.inner.lock().cached_pages
    }

    pub fn inactive_cached_pages(&self) -> usize {
        self.inner.lock().inactive_cached_pages
    }

    /// Whether the pool currently sits in the active ring (has at least
    /// one cached entry).
    pub fn is_active(&self) -> bool {
        self.inner.lock().in_active_ring
    }

    /// Replaces the page source. Cached objects built by the previous
    /// source are flushed first so every page is released by the backend
    /// that produced it; callers must not hold outstanding allocations.
    pub fn set_page_source(&self, source: Arc<dyn PageSource>) {
        self.flush();
        *self.page_source.write() = source;
    }

    pub(crate) fn page_source(&self) -> Arc<dyn PageSource> {
        Arc::clone(&self.page_source.read())
    }

    pub(crate) fn bump_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let inner = self.inner.lock();
        PoolStatsSnapshot {
            name: self.name.clone(),
            clustering: self.clustering,
            cached_entries: inner.cached_entries,
            cached_pages: inner.cached_pages,
            inactive_cached_pages: inner.inactive_cached_pages,
            buckets: self
                .bucket_stats
                .iter()
                .enumerate()
                .map(|(order, stats)| BucketStatsSnapshot {
                    order,
                    hit_alloc: stats.hit_alloc.load(Ordering::Relaxed),
                    total_alloc: stats.total_alloc.load(Ordering::Relaxed),
                    merged: stats.merged.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Allocation API
    // ------------------------------------------------------------------

    /// Allocates an SG vector backing at least `size` bytes.
    ///
    /// `supplied` re-fills an empty object previously returned by a
    /// `Deferred` outcome; it must belong to this pool and to the same
    /// bucket the request maps to.
    pub fn alloc(
        &self,
        size: usize,
        flags: AllocFlags,
        supplied: Option<Box<SgvObj>>,
        mem_limit: Option<&dyn MemoryLimit>,
    ) -> Result<SgvAlloc> {
        if size == 0 {
            return Err(SgvError::invalid("zero-size allocation"));
        }
        let pages = pages_for_size(size);
        if pages > i32::MAX as usize {
            return Err(SgvError::invalid("allocation size out of range"));
        }
        let order = order_for_pages(pages);
        let cacheable = order <= self.max_order && !flags.contains(AllocFlags::NO_CACHED);
        if flags.contains(AllocFlags::NO_ALLOC_ON_CACHE_MISS) && !cacheable {
            return Err(SgvError::invalid(
                "NO_ALLOC_ON_CACHE_MISS requires a cacheable request",
            ));
        }
        if let Some(obj) = &supplied {
            if !cacheable || !obj.owner.ptr_eq(&self.weak_self) {
                return Err(SgvError::invalid(
                    "supplied object does not match pool or regime",
                ));
            }
            if obj.order() != Some(order) {
                return Err(SgvError::invalid("supplied object order mismatch"));
            }
            if obj.sg_count != 0 {
                return Err(SgvError::invalid("supplied object is not empty"));
            }
        }

        let pages_to_alloc = if cacheable { pages_for_order(order) } else { pages };
        if let Some(limit) = mem_limit {
            if !limit.add(pages_to_alloc) {
                return Err(SgvError::OutOfMemory {
                    requested_pages: pages_to_alloc,
                });
            }
        }

        let result = if cacheable {
            self.alloc_cached(size, pages, order, pages_to_alloc, flags, supplied)
        } else {
            self.alloc_uncached(size, pages, flags)
        };

        // Quota follows the pages: anything that comes back without a
        // populated object releases the reservation.
        if let Some(limit) = mem_limit {
            match &result {
                Ok(SgvAlloc::Ready { .. }) => {}
                _ => limit.sub(pages_to_alloc),
            }
        }
        result
    }

    fn alloc_cached(
        &self,
        size: usize,
        pages: usize,
        order: usize,
        pages_to_alloc: usize,
        flags: AllocFlags,
        supplied: Option<Box<SgvObj>>,
    ) -> Result<SgvAlloc> {
        let mut fresh_miss = false;
        let mut obj = match supplied {
            Some(obj) => obj,
            None => match self.cache_get(order) {
                CacheGet::Cached(obj) => obj,
                CacheGet::Miss => {
                    fresh_miss = true;
                    if flags.contains(AllocFlags::NO_ALLOC_ON_CACHE_MISS)
                        && !flags.contains(AllocFlags::RETURN_OBJ_ON_ALLOC_FAIL)
                    {
                        self.forget_miss(order);
                        return Ok(SgvAlloc::Miss);
                    }
                    SgvObj::new_cached(
                        order,
                        self.clustering.is_clustered(),
                        self.layout,
                        self.weak_self.clone(),
                        self.shared.clock().now(),
                    )
                }
            },
        };

        let hit = obj.sg_count != 0;
        if !hit {
            if flags.contains(AllocFlags::NO_ALLOC_ON_CACHE_MISS) {
                // Either a fresh empty object (counters already charged)
                // or one recycled empty from the free-list: hand it back
                // rather than touching the page source.
                if flags.contains(AllocFlags::RETURN_OBJ_ON_ALLOC_FAIL) {
                    return Ok(SgvAlloc::Deferred { obj });
                }
                self.cache_put(obj);
                return Ok(SgvAlloc::Miss);
            }
            if let Err(err) = self.populate(&mut obj, pages_to_alloc, order, flags) {
                if flags.contains(AllocFlags::RETURN_OBJ_ON_ALLOC_FAIL) {
                    return Ok(SgvAlloc::Deferred { obj });
                }
                if fresh_miss {
                    self.forget_miss(order);
                } else {
                    // Recycled or supplied object: it stays a (now empty)
                    // cache resident.
                    self.cache_put(obj);
                }
                return Err(err);
            }
        }

        let stats = &self.bucket_stats[order];
        stats.total_alloc.fetch_add(1, Ordering::Relaxed);
        if hit {
            stats.hit_alloc.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .merged
            .fetch_add((pages_to_alloc - obj.sg_count) as u64, Ordering::Relaxed);

        let count = obj.reported_count(pages);
        obj.trim_tail(count, size);
        Ok(SgvAlloc::Ready { obj, count })
    }

    fn alloc_uncached(&self, size: usize, pages: usize, flags: AllocFlags) -> Result<SgvAlloc> {
        let mut obj = SgvObj::new_uncached(pages, self.weak_self.clone(), self.shared.clock().now());
        self.shared.admit(pages)?;

        let source = self.page_source();
        let populate = cluster::alloc_sg_entries(
            &*source,
            &mut obj.sg_entries,
            pages,
            flags,
            self.clustering,
            &mut obj.allocator_priv,
        );
        match populate {
            Ok(sg_count) => {
                obj.sg_count = sg_count;
                if self.clustering.is_clustered() {
                    cluster::build_trans_tbl(&obj.sg_entries, sg_count, pages, &mut obj.trans_tbl);
                }
            }
            Err(err) => {
                self.shared.sub_pages(pages);
                return Err(err);
            }
        }

        let count = obj.reported_count(pages);
        obj.trim_tail(count, size);
        trace!(pool = %self.name, pages, "served un-cacheable allocation");
        Ok(SgvAlloc::Ready { obj, count })
    }

    /// Admits pages against the watermark and fills an empty object via
    /// the page source and the clustering engine. On failure the object
    /// is left empty and all accounting is reverted.
    fn populate(
        &self,
        obj: &mut SgvObj,
        pages_to_alloc: usize,
        order: usize,
        flags: AllocFlags,
    ) -> Result<()> {
        self.shared.admit(pages_to_alloc)?;

        let source = self.page_source();
        let populate = cluster::alloc_sg_entries(
            &*source,
            &mut obj.sg_entries,
            pages_to_alloc,
            flags,
            self.clustering,
            &mut obj.allocator_priv,
        );
        match populate {
            Ok(sg_count) => {
                obj.sg_count = sg_count;
                if self.clustering.is_clustered() {
                    cluster::build_trans_tbl(
                        &obj.sg_entries,
                        sg_count,
                        pages_to_alloc,
                        &mut obj.trans_tbl,
                    );
                }
                Ok(())
            }
            Err(err) => {
                self.shared.sub_pages(pages_to_alloc);
                warn!(pool = %self.name, order, "page source failed to fill object");
                Err(err)
            }
        }
    }

    /// Returns an SG vector to the pool. Cacheable objects go back to
    /// their bucket with the tail trim reverted; un-cacheable ones are
    /// released through the page source immediately.
    pub fn free(&self, mut obj: Box<SgvObj>, mem_limit: Option<&dyn MemoryLimit>) {
        assert!(
            obj.owner.ptr_eq(&self.weak_self),
            "object freed into a foreign pool"
        );
        let backing = obj.backing_pages();
        obj.restore_tail();

        if obj.is_cacheable() {
            self.cache_put(obj);
        } else {
            let source = self.page_source();
            source.free_pages(&obj.sg_entries[..obj.sg_count], &mut obj.allocator_priv);
            self.shared.sub_pages(backing);
        }

        if let Some(limit) = mem_limit {
            limit.sub(backing);
        }
    }

    // ------------------------------------------------------------------
    // Cache internals
    // ------------------------------------------------------------------

    fn cache_get(&self, order: usize) -> CacheGet {
        let became_active;
        {
            let mut inner = self.inner.lock();
            if let Some(head) = inner.buckets[order].head {
                inner.bucket_unlink(head);
                inner.lru_unlink(head);
                let obj = inner.remove_slot(head);
                inner.inactive_cached_pages -= pages_for_order(order);
                return CacheGet::Cached(obj);
            }
            inner.cached_entries += 1;
            inner.cached_pages += pages_for_order(order);
            became_active = inner.cached_entries == 1 && !inner.in_active_ring;
        }
        if became_active {
            self.activate_self();
        }
        CacheGet::Miss
    }

    /// Reverts the counter charge of a miss whose object never came to
    /// life.
    fn forget_miss(&self, order: usize) {
        let became_empty;
        {
            let mut inner = self.inner.lock();
            inner.cached_entries -= 1;
            inner.cached_pages -= pages_for_order(order);
            became_empty = inner.cached_entries == 0;
        }
        if became_empty {
            self.deactivate_self();
        }
    }

    fn cache_put(&self, mut obj: Box<SgvObj>) {
        let order = obj
            .order()
            .expect("only cacheable objects enter the cache");
        obj.timestamp = self.shared.clock().now();
        let sg_count = obj.sg_count;

        let need_schedule;
        {
            let mut inner = self.inner.lock();
            let idx = inner.insert_slot(obj, order);
            if self.clustering.is_clustered() {
                let before = inner.sorted_bucket_position(order, sg_count);
                inner.bucket_link_before(idx, before, order);
            } else {
                inner.bucket_link_front(idx, order);
            }
            inner.lru_link_tail(idx);
            inner.inactive_cached_pages += pages_for_order(order);
            need_schedule = !inner.purge_scheduled && !inner.destroying;
            if need_schedule {
                inner.purge_scheduled = true;
            }
        }
        if need_schedule {
            self.arm_purge();
        }
    }

    fn arm_purge(&self) {
        let weak = self.weak_self.clone();
        let handle = self.shared.executor().schedule(
            self.purge_interval,
            Box::new(move || {
                if let Some(pool) = weak.upgrade() {
                    pool.purge_worker();
                }
            }),
        );
        self.inner.lock().purge_handle = Some(handle);
    }

    /// Unlinks and returns the LRU head if it has been idle at least
    /// `min_age`; the second element reports whether the cache became
    /// empty. The caller destroys the object without holding the lock.
    fn take_aged_lru_head(&self, min_age: Duration) -> Option<(Box<SgvObj>, bool)> {
        let now = self.shared.clock().now();
        let mut inner = self.inner.lock();
        let head = inner.lru_head?;
        let age = now
            .checked_duration_since(inner.slot_obj(head).timestamp)
            .unwrap_or(Duration::ZERO);
        if age < min_age {
            return None;
        }
        let order = inner.slots[head].order;
        inner.bucket_unlink(head);
        inner.lru_unlink(head);
        let obj = inner.remove_slot(head);
        inner.inactive_cached_pages -= pages_for_order(order);
        inner.cached_entries -= 1;
        inner.cached_pages -= pages_for_order(order);
        Some((obj, inner.cached_entries == 0))
    }

    /// Releases an evicted object's pages and global accounting.
    fn destroy_cached_obj(&self, mut obj: Box<SgvObj>) -> usize {
        let backing = obj.backing_pages();
        if obj.sg_count > 0 {
            let source = self.page_source();
            source.free_pages(&obj.sg_entries[..obj.sg_count], &mut obj.allocator_priv);
            self.shared.sub_pages(backing);
        }
        backing
    }

    /// Evicts aged objects from the LRU head, up to `want` pages (capped
    /// per sweep), returning the pages actually freed.
    pub(crate) fn shrink_lru(&self, want: usize, min_age: Duration) -> usize {
        let cap = want.min(constants::MAX_PAGES_PER_POOL_SHRINK);
        let mut freed = 0;
        while freed < cap {
            match self.take_aged_lru_head(min_age) {
                Some((obj, became_empty)) => {
                    freed += self.destroy_cached_obj(obj);
                    if became_empty {
                        self.deactivate_self();
                        break;
                    }
                }
                None => break,
            }
        }
        freed
    }

    /// Evicts every cached object without destroying the pool.
    pub fn flush(&self) {
        let mut flushed = 0usize;
        loop {
            match self.take_aged_lru_head(Duration::ZERO) {
                Some((obj, became_empty)) => {
                    flushed += 1;
                    self.destroy_cached_obj(obj);
                    if became_empty {
                        self.deactivate_self();
                        break;
                    }
                }
                None => break,
            }
        }
        if flushed > 0 {
            debug!(pool = %self.name, flushed, "flushed cached objects");
        }
    }

    /// Purge worker body: destroys every LRU-head object that aged past
    /// the purge interval, then rearms itself only if a too-young head
    /// stopped the walk.
    pub(crate) fn purge_worker(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.destroying {
                return;
            }
            inner.purge_scheduled = false;
        }

        let mut purged = 0usize;
        loop {
            match self.take_aged_lru_head(self.purge_interval) {
                Some((obj, became_empty)) => {
                    purged += 1;
                    self.destroy_cached_obj(obj);
                    if became_empty {
                        self.deactivate_self();
                        break;
                    }
                }
                None => break,
            }
        }
        if purged > 0 {
            trace!(pool = %self.name, purged, "purge worker reclaimed entries");
        }

        let rearm = {
            let mut inner = self.inner.lock();
            if inner.destroying || inner.purge_scheduled || inner.lru_head.is_none() {
                false
            } else {
                inner.purge_scheduled = true;
                true
            }
        };
        if rearm {
            self.arm_purge();
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drops one pool reference. The last reference cancels the purge
    /// worker (waiting out an in-flight run), flushes the cache and
    /// unlinks the pool from the registry.
    pub fn destroy(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "pool destroyed more times than referenced");
        if prev != 1 {
            return;
        }

        loop {
            let handle = {
                let mut inner = self.inner.lock();
                inner.destroying = true;
                inner.purge_handle.take()
            };
            match handle {
                Some(handle) => self.shared.executor().cancel_sync(handle),
                None => break,
            }
        }

        self.flush();
        self.shared.unregister(self);
        debug!(pool = %self.name, "pool destroyed");
    }

    fn activate_self(&self) {
        if let Some(pool) = self.weak_self.upgrade() {
            self.shared.activate(&pool);
        }
    }

    fn deactivate_self(&self) {
        if let Some(pool) = self.weak_self.upgrade() {
            self.shared.deactivate(&pool);
        }
    }
}

impl SgvShared {
    /// Enrols `pool` into the active ring unless a racing eviction
    /// already emptied it again. Ring lock outer, pool lock inner.
    pub(crate) fn activate(&self, pool: &Arc<SgvPool>) {
        let mut ring = self.ring_lock();
        let mut inner = pool.inner.lock();
        if inner.cached_entries > 0 && !inner.in_active_ring {
            inner.in_active_ring = true;
            ring.pools.push(Arc::clone(pool));
        }
    }

    /// Removes `pool` from the active ring, re-pointing the purge cursor
    /// at the next pool (or clearing it).
    pub(crate) fn deactivate(&self, pool: &Arc<SgvPool>) {
        let mut ring = self.ring_lock();
        let mut inner = pool.inner.lock();
        if inner.cached_entries != 0 || !inner.in_active_ring {
            return;
        }
        inner.in_active_ring = false;
        if let Some(pos) = ring.pools.iter().position(|p| Arc::ptr_eq(p, pool)) {
            ring.pools.remove(pos);
            if ring.pools.is_empty() {
                ring.cursor = 0;
            } else {
                if pos < ring.cursor {
                    ring.cursor -= 1;
                }
                if ring.cursor >= ring.pools.len() {
                    ring.cursor = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObjLayout;
    use std::time::Instant;

    fn empty_inner(orders: usize) -> PoolInner {
        PoolInner {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![BucketList::default(); orders],
            lru_head: None,
            lru_tail: None,
            cached_entries: 0,
            cached_pages: 0,
            inactive_cached_pages: 0,
            purge_scheduled: false,
            purge_handle: None,
            in_active_ring: false,
            destroying: false,
        }
    }

    fn obj_with_sg_count(sg_count: usize) -> Box<SgvObj> {
        let mut obj = SgvObj::new_cached(
            3,
            true,
            ObjLayout::compute(true),
            Weak::new(),
            Instant::now(),
        );
        obj.sg_count = sg_count;
        obj
    }

    fn bucket_order_of_sg_counts(inner: &PoolInner, order: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = inner.buckets[order].head;
        while let Some(idx) = cur {
            out.push(inner.slot_obj(idx).sg_count);
            cur = inner.slots[idx].bucket_next;
        }
        out
    }

    #[test]
    fn test_sorted_bucket_insertion_ascending() {
        let mut inner = empty_inner(4);
        for sg_count in [5, 2, 8, 2, 1] {
            let obj = obj_with_sg_count(sg_count);
            let idx = inner.insert_slot(obj, 3);
            let before = inner.sorted_bucket_position(3, sg_count);
            inner.bucket_link_before(idx, before, 3);
        }
        assert_eq!(bucket_order_of_sg_counts(&inner, 3), vec![1, 2, 2, 5, 8]);
    }

    #[test]
    fn test_sorted_bucket_ties_are_lifo() {
        let mut inner = empty_inner(4);
        let mut tie_indices = Vec::new();
        for sg_count in [4, 4, 4] {
            let obj = obj_with_sg_count(sg_count);
            let idx = inner.insert_slot(obj, 3);
            let before = inner.sorted_bucket_position(3, sg_count);
            inner.bucket_link_before(idx, before, 3);
            tie_indices.push(idx);
        }
        // Most recently inserted equal object sits at the head.
        assert_eq!(inner.buckets[3].head, Some(*tie_indices.last().unwrap()));
        assert_eq!(inner.buckets[3].tail, Some(tie_indices[0]));
    }

    #[test]
    fn test_unlink_from_both_lists_and_slot_reuse() {
        let mut inner = empty_inner(4);
        let mut indices = Vec::new();
        for sg_count in [1, 2, 3] {
            let obj = obj_with_sg_count(sg_count);
            let idx = inner.insert_slot(obj, 3);
            inner.bucket_link_front(idx, 3);
            inner.lru_link_tail(idx);
            indices.push(idx);
        }

        // Remove the middle element from both lists.
        let middle = indices[1];
        inner.bucket_unlink(middle);
        inner.lru_unlink(middle);
        let removed = inner.remove_slot(middle);
        assert_eq!(removed.sg_count, 2);

        assert_eq!(bucket_order_of_sg_counts(&inner, 3), vec![3, 1]);
        assert_eq!(inner.lru_head, Some(indices[0]));
        assert_eq!(inner.lru_tail, Some(indices[2]));
        assert_eq!(inner.slots[indices[0]].lru_next, Some(indices[2]));
        assert_eq!(inner.slots[indices[2]].lru_prev, Some(indices[0]));

        // The freed slot is recycled before the arena grows.
        let idx = inner.insert_slot(obj_with_sg_count(9), 3);
        assert_eq!(idx, middle);
    }

    #[test]
    fn test_lru_unlink_head_and_tail() {
        let mut inner = empty_inner(1);
        let a = inner.insert_slot(obj_with_sg_count(1), 0);
        inner.lru_link_tail(a);
        let b = inner.insert_slot(obj_with_sg_count(2), 0);
        inner.lru_link_tail(b);

        inner.lru_unlink(a);
        assert_eq!(inner.lru_head, Some(b));
        assert_eq!(inner.lru_tail, Some(b));

        inner.lru_unlink(b);
        assert_eq!(inner.lru_head, None);
        assert_eq!(inner.lru_tail, None);
    }
}
