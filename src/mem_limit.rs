// Per-caller memory quota cookie.
//
// The allocator calls `add` before committing pages to a caller and `sub`
// when the pages come back. The cookie owns its counter and policy; the
// core never interprets it beyond the boolean admission answer.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Quota interface charged in pages.
pub trait MemoryLimit: Send + Sync {
    /// Reserves `pages` against the quota. Returns `false` when the
    /// reservation would exceed the limit; the allocation is then aborted
    /// before any pool state is touched.
    fn add(&self, pages: usize) -> bool;

    /// Releases `pages` previously reserved with [`MemoryLimit::add`].
    fn sub(&self, pages: usize);
}

/// Simple page quota: an atomic counter with a fixed maximum.
#[derive(Debug)]
pub struct PageQuota {
    max_pages: usize,
    used_pages: AtomicUsize,
}

impl PageQuota {
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages,
            used_pages: AtomicUsize::new(0),
        }
    }

    /// Pages currently reserved.
    pub fn used(&self) -> usize {
        self.used_pages.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max_pages
    }
}

impl MemoryLimit for PageQuota {
    fn add(&self, pages: usize) -> bool {
        self.used_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used + pages;
                (next <= self.max_pages).then_some(next)
            })
            .is_ok()
    }

    fn sub(&self, pages: usize) {
        let prev = self.used_pages.fetch_sub(pages, Ordering::AcqRel);
        debug_assert!(prev >= pages, "quota release exceeds reservation");
    }
}
