// # Page Source Adapter
//
// The pluggable backend the allocator obtains pages from. The interface
// is deliberately small: place one page at a given SG entry, and release
// a slice of SG entries. An opaque per-object cookie travels with both
// calls so stateful backends can stash bookkeeping alongside the object.
//
// `SystemPageSource` is the default backend: each page is one page-sized,
// page-aligned block from the global allocator, and merged entries are
// released page by page, mirroring exactly how they were obtained.

use std::alloc::{alloc, dealloc, Layout};
use std::any::Any;

use crate::error::{Result, SgvError};
use crate::types::{AllocFlags, PageRef, SgEntry, PAGE_SHIFT, PAGE_SIZE};

/// Opaque cookie a page source may attach to an object it populates.
pub type AllocatorPriv = Option<Box<dyn Any + Send + Sync>>;

/// Pluggable page backend.
///
/// Implementations must be prepared for `free_pages` to see entries whose
/// lengths grew through clustering: each entry is a run of pages that were
/// allocated one at a time, and must be released as that run of single
/// pages (per-entry allocation orders are not preserved across merges).
pub trait PageSource: Send + Sync {
    /// Places one page at `entry`, setting its page, offset and length.
    /// On failure the entry must be left untouched.
    fn alloc_page(&self, entry: &mut SgEntry, flags: AllocFlags, priv_: &mut AllocatorPriv)
        -> Result<()>;

    /// Releases every page run covered by `entries`. Cleared entries
    /// (merge holes) must be skipped.
    fn free_pages(&self, entries: &[SgEntry], priv_: &mut AllocatorPriv);
}

fn page_layout() -> Layout {
    // Size and alignment are the same power of two, so this cannot fail.
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("valid page layout")
}

/// Default backend over the global allocator.
#[derive(Debug, Default)]
pub struct SystemPageSource;

impl PageSource for SystemPageSource {
    fn alloc_page(
        &self,
        entry: &mut SgEntry,
        _flags: AllocFlags,
        _priv: &mut AllocatorPriv,
    ) -> Result<()> {
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc(page_layout()) };
        if ptr.is_null() {
            return Err(SgvError::OutOfMemory { requested_pages: 1 });
        }
        entry.set_page(PageRef::from_addr(ptr as usize), PAGE_SIZE, 0);
        Ok(())
    }

    fn free_pages(&self, entries: &[SgEntry], _priv: &mut AllocatorPriv) {
        for entry in entries {
            let Some(page) = entry.page else { continue };
            for pg in 0..entry.page_run() {
                let addr = page.addr() + (pg << PAGE_SHIFT);
                // SAFETY: every page of the run was obtained from
                // `alloc_page` with the same layout; clustering only
                // merges runs page-granular, so `addr` is always a block
                // base we handed out.
                unsafe { dealloc(addr as *mut u8, page_layout()) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_source_single_page() {
        let source = SystemPageSource;
        let mut priv_ = None;
        let mut entry = SgEntry::default();

        source
            .alloc_page(&mut entry, AllocFlags::empty(), &mut priv_)
            .unwrap();
        let page = entry.page.expect("page placed");
        assert_eq!(page.addr() & (PAGE_SIZE - 1), 0);
        assert_eq!(entry.length, PAGE_SIZE);
        assert_eq!(entry.offset, 0);

        // The page is writable memory.
        unsafe { std::ptr::write_bytes(page.addr() as *mut u8, 0x5a, PAGE_SIZE) };

        source.free_pages(std::slice::from_ref(&entry), &mut priv_);
    }

    #[test]
    fn test_free_skips_merge_holes() {
        let source = SystemPageSource;
        let mut priv_ = None;
        let mut entries = [SgEntry::default(), SgEntry::default()];

        source
            .alloc_page(&mut entries[0], AllocFlags::empty(), &mut priv_)
            .unwrap();
        // entries[1] stays cleared, as after a clustering merge.
        source.free_pages(&entries, &mut priv_);
    }
}
