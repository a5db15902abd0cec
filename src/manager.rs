// # SGV Subsystem Manager
//
// Process-wide coordinator for every pool: the watermark accountant over
// the global page total, the registry of pools by name, the ring of
// active pools with the persistent purge cursor, and the cross-pool
// shrinker that round-robins reclaim over that ring.
//
// Lock ordering: the registry mutex serialises create/destroy and name
// lookup and nests outside everything; the ring lock may be taken before
// a pool lock, never after; no lock is held across page-source calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, SgvError};
use crate::page_source::{PageSource, SystemPageSource};
use crate::pool::SgvPool;
use crate::purge::{Clock, DelayedExecutor, SystemClock, TimerExecutor};
use crate::types::{constants, ClusteringMode};

/// Subsystem configuration, fixed at initialisation.
#[derive(Debug, Clone)]
pub struct SgvConfig {
    /// High watermark in pages; admission above it triggers a synchronous
    /// shrink and fails if the shrink cannot make room.
    pub hi_watermark: usize,
    /// Low watermark in pages; shrink sweeps stop at this level.
    pub lo_watermark: usize,
    /// Largest cached order; bucket `k` caches allocations of exactly
    /// `2^k` pages.
    pub max_order: usize,
    /// Purge-worker delay and the age at which cached entries expire.
    pub purge_interval: Duration,
}

impl Default for SgvConfig {
    fn default() -> Self {
        Self {
            hi_watermark: constants::DEFAULT_HI_WATERMARK,
            lo_watermark: constants::DEFAULT_LO_WATERMARK,
            max_order: constants::DEFAULT_MAX_ORDER,
            purge_interval: constants::DEFAULT_PURGE_INTERVAL,
        }
    }
}

impl SgvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hi_watermark == 0 || self.lo_watermark >= self.hi_watermark {
            return Err(SgvError::invalid(
                "low watermark must be below the high watermark",
            ));
        }
        if self.max_order > constants::MAX_ORDER_LIMIT {
            return Err(SgvError::invalid(format!(
                "max_order {} exceeds limit {}",
                self.max_order,
                constants::MAX_ORDER_LIMIT
            )));
        }
        if self.purge_interval.is_zero() {
            return Err(SgvError::invalid("purge interval must be non-zero"));
        }
        Ok(())
    }
}

/// Global counters, read-only view.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatsSnapshot {
    pub pages_total: usize,
    pub releases_on_hi_wmk: u64,
    pub releases_on_hi_wmk_failed: u64,
    pub active_pools: usize,
}

pub(crate) struct ActiveRing {
    pub(crate) pools: Vec<Arc<SgvPool>>,
    pub(crate) cursor: usize,
}

/// State shared between the manager handle and every pool it created.
pub(crate) struct SgvShared {
    config: SgvConfig,
    pages_total: AtomicUsize,
    releases_on_hi_wmk: AtomicU64,
    releases_on_hi_wmk_failed: AtomicU64,
    ring: Mutex<ActiveRing>,
    registry: Mutex<HashMap<String, Arc<SgvPool>>>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn DelayedExecutor>,
    default_source: Arc<dyn PageSource>,
}

impl SgvShared {
    pub(crate) fn config(&self) -> &SgvConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub(crate) fn executor(&self) -> &dyn DelayedExecutor {
        &*self.executor
    }

    pub(crate) fn default_source(&self) -> Arc<dyn PageSource> {
        Arc::clone(&self.default_source)
    }

    pub(crate) fn ring_lock(&self) -> MutexGuard<'_, ActiveRing> {
        self.ring.lock()
    }

    pub(crate) fn pages_total(&self) -> usize {
        self.pages_total.load(Ordering::Acquire)
    }

    /// Watermark admission for `pages` new pages. Over the high
    /// watermark, a synchronous zero-age shrink attempts to make room;
    /// only then is the request rejected.
    pub(crate) fn admit(&self, pages: usize) -> Result<()> {
        let hi = self.config.hi_watermark;
        let mut total = self.pages_total.load(Ordering::Acquire);
        if total + pages > hi {
            self.releases_on_hi_wmk.fetch_add(1, Ordering::Relaxed);
            let overshoot = total + pages - hi;
            let freed = self.shrink_pools(overshoot, Duration::ZERO);
            debug!(pages, overshoot, freed, "high watermark hit, shrank pools");
            total = self.pages_total.load(Ordering::Acquire);
            if total + pages > hi {
                self.releases_on_hi_wmk_failed.fetch_add(1, Ordering::Relaxed);
                warn!(pages, total, hi, "admission rejected at high watermark");
                return Err(SgvError::OutOfMemory {
                    requested_pages: pages,
                });
            }
        }
        self.pages_total.fetch_add(pages, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn sub_pages(&self, pages: usize) {
        if pages > 0 {
            let prev = self.pages_total.fetch_sub(pages, Ordering::AcqRel);
            debug_assert!(prev >= pages, "page accounting underflow");
        }
    }

    /// Round-robin reclaim across active pools, starting at the
    /// persistent purge cursor. Evicts objects idle at least `min_age`,
    /// stopping once `nr` pages are freed, the total falls to the low
    /// watermark, or a full cycle makes no progress.
    pub(crate) fn shrink_pools(&self, nr: usize, min_age: Duration) -> usize {
        let mut freed = 0usize;
        let mut barren = 0usize;
        while freed < nr {
            if self.pages_total() <= self.config.lo_watermark {
                break;
            }
            let (pool, ring_len) = {
                let mut ring = self.ring.lock();
                if ring.pools.is_empty() {
                    break;
                }
                if ring.cursor >= ring.pools.len() {
                    ring.cursor = 0;
                }
                (Arc::clone(&ring.pools[ring.cursor]), ring.pools.len())
            };

            let pool_freed = pool.shrink_lru(nr - freed, min_age);
            freed += pool_freed;
            if pool_freed == 0 {
                barren += 1;
                if barren >= ring_len {
                    break;
                }
            } else {
                barren = 0;
            }

            // Advance the cursor past the pool just visited; eviction may
            // already have dropped it from the ring and repaired the
            // cursor for us.
            let mut ring = self.ring.lock();
            if let Some(pos) = ring.pools.iter().position(|p| Arc::ptr_eq(p, &pool)) {
                if pos == ring.cursor {
                    ring.cursor = (ring.cursor + 1) % ring.pools.len();
                }
            } else if !ring.pools.is_empty() && ring.cursor >= ring.pools.len() {
                ring.cursor = 0;
            }
        }
        freed
    }

    /// Sum of free-listed pages across active pools; only active pools
    /// can hold inactive cached pages.
    fn inactive_pages_total(&self) -> usize {
        let ring = self.ring.lock();
        ring.pools
            .iter()
            .map(|pool| pool.inactive_cached_pages())
            .sum()
    }

    pub(crate) fn unregister(&self, pool: &SgvPool) {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.get(pool.name()) {
            if std::ptr::eq(Arc::as_ptr(existing), pool) {
                registry.remove(pool.name());
            }
        }
    }
}

/// Handle to one allocator subsystem instance: watermarks, registry,
/// clock and purge executor. Pools are created from (and registered with)
/// a manager; dropping the manager handle leaves already-created pools
/// functional until each is destroyed.
pub struct SgvManager {
    shared: Arc<SgvShared>,
}

impl SgvManager {
    /// Creates a subsystem with the system clock and a threaded purge
    /// timer.
    pub fn new(config: SgvConfig) -> Result<Self> {
        Self::with_runtime(
            config,
            Arc::new(SystemClock),
            Arc::new(TimerExecutor::new()),
        )
    }

    /// Creates a subsystem over explicit clock and executor
    /// implementations (virtual time in tests, an embedder's own timer
    /// wheel in production).
    pub fn with_runtime(
        config: SgvConfig,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn DelayedExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(SgvShared {
                config,
                pages_total: AtomicUsize::new(0),
                releases_on_hi_wmk: AtomicU64::new(0),
                releases_on_hi_wmk_failed: AtomicU64::new(0),
                ring: Mutex::new(ActiveRing {
                    pools: Vec::new(),
                    cursor: 0,
                }),
                registry: Mutex::new(HashMap::new()),
                clock,
                executor,
                default_source: Arc::new(SystemPageSource),
            }),
        })
    }

    /// Creates a pool, or re-obtains a shared pool of the same name.
    ///
    /// A name claimed by a pool that was not created `shared` (or a
    /// non-shared request against any existing name) is rejected with
    /// [`SgvError::Busy`].
    pub fn create_pool(
        &self,
        name: &str,
        clustering: ClusteringMode,
        shared: bool,
    ) -> Result<Arc<SgvPool>> {
        if name.is_empty() {
            return Err(SgvError::invalid("pool name must not be empty"));
        }
        let mut registry = self.shared.registry.lock();
        if let Some(existing) = registry.get(name) {
            if shared && existing.is_shared() {
                existing.bump_ref();
                debug!(pool = name, "re-obtained shared pool");
                return Ok(Arc::clone(existing));
            }
            return Err(SgvError::Busy { name: name.into() });
        }
        let pool = SgvPool::new(name, clustering, shared, Arc::clone(&self.shared));
        registry.insert(name.to_string(), Arc::clone(&pool));
        debug!(pool = name, %clustering, "created pool");
        Ok(pool)
    }

    /// Pages currently accounted across all pools and outstanding
    /// un-cacheable allocations.
    pub fn pages_total(&self) -> usize {
        self.shared.pages_total()
    }

    pub fn stats(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            pages_total: self.shared.pages_total(),
            releases_on_hi_wmk: self.shared.releases_on_hi_wmk.load(Ordering::Relaxed),
            releases_on_hi_wmk_failed: self
                .shared
                .releases_on_hi_wmk_failed
                .load(Ordering::Relaxed),
            active_pools: self.shared.ring.lock().pools.len(),
        }
    }

    /// Memory-pressure estimate branch of the shrinker hook: pages that
    /// a reclaim pass could plausibly return.
    pub fn shrinker_count(&self) -> usize {
        self.shared
            .inactive_pages_total()
            .saturating_sub(self.shared.config.lo_watermark)
    }

    /// Reclaim branch of the shrinker hook: frees up to `nr` pages of
    /// sufficiently idle cache across all pools, returning the amount
    /// actually freed.
    pub fn shrinker_scan(&self, nr: usize) -> usize {
        if nr == 0 {
            return 0;
        }
        self.shared.shrink_pools(nr, constants::SHRINK_AGE)
    }
}
