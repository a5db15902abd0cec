// # Clustering Engine
//
// Builds SG lists by driving the page source one page at a time and
// merging physically adjacent pages into fewer, longer entries.
//
// Three policies:
// - `None`: every page is its own entry.
// - `Tail`: a new page may only extend the immediately preceding entry.
// - `Full`: a new page may extend any prior entry (tail merge) or be
//   prepended to one (head merge: the new page becomes the entry's page
//   and the length grows). The most recent merge index is checked first
//   as a hint, then the scan walks backwards over all prior entries.
//
// A merge clears the staging entry, which is then reused for the next
// page; the SG count only advances on a failed merge.

use tracing::trace;

use crate::error::Result;
use crate::page_source::{AllocatorPriv, PageSource};
use crate::types::{AllocFlags, ClusteringMode, SgEntry, TransTblEntry, PAGE_MASK, PAGE_SHIFT};

/// Attempts to merge the page run staged at `sg[cur]` into the entry just
/// before it. Returns the merge index, or `None` when the run stays a
/// separate entry.
fn check_tail_clustering(sg: &mut [SgEntry], cur: usize) -> Option<usize> {
    if cur == 0 {
        return None;
    }
    let prev = cur - 1;
    let (Some(prev_page), Some(cur_page)) = (sg[prev].page, sg[cur].page) else {
        return None;
    };
    let pfn_prev_next = prev_page.frame_number() + (sg[prev].length >> PAGE_SHIFT);
    let full_page = sg[prev].length & PAGE_MASK == 0;
    if pfn_prev_next == cur_page.frame_number() && full_page {
        sg[prev].length += sg[cur].length;
        sg[cur].clear();
        return Some(prev);
    }
    None
}

/// Attempts to merge the page run staged at `sg[cur]` with any prior
/// entry, trying `hint` before the backwards scan.
fn check_full_clustering(sg: &mut [SgEntry], cur: usize, hint: Option<usize>) -> Option<usize> {
    let cur_page = sg[cur].page?;
    let pfn_cur = cur_page.frame_number();
    let len_cur = sg[cur].length;
    let pfn_cur_next = pfn_cur + (len_cur >> PAGE_SHIFT);
    let full_page_cur = len_cur & PAGE_MASK == 0;

    let try_merge = |sg: &mut [SgEntry], i: usize| -> bool {
        let Some(page) = sg[i].page else { return false };
        let pfn = page.frame_number();
        let pfn_next = pfn + (sg[i].length >> PAGE_SHIFT);
        let full_page = sg[i].length & PAGE_MASK == 0;

        // Head merge: the staged run ends where entry i begins.
        if pfn == pfn_cur_next && full_page_cur {
            sg[i].page = Some(cur_page);
            sg[i].length += len_cur;
            sg[cur].clear();
            return true;
        }
        // Tail merge: entry i ends where the staged run begins.
        if pfn_next == pfn_cur && full_page {
            sg[i].length += len_cur;
            sg[cur].clear();
            return true;
        }
        false
    };

    if let Some(i) = hint {
        if i < cur && try_merge(sg, i) {
            return Some(i);
        }
    }
    for i in (0..cur).rev() {
        if try_merge(sg, i) {
            return Some(i);
        }
    }
    None
}

/// Populates `sg` with `pages` pages from `source`, clustering per `mode`.
/// Returns the resulting SG count.
///
/// If any page allocation fails, every page placed so far is released
/// through the adapter, the list is emptied and the error propagated.
pub(crate) fn alloc_sg_entries(
    source: &dyn PageSource,
    sg: &mut Vec<SgEntry>,
    pages: usize,
    flags: AllocFlags,
    mode: ClusteringMode,
    priv_: &mut AllocatorPriv,
) -> Result<usize> {
    sg.clear();
    sg.resize(pages, SgEntry::default());

    let mut cur = 0usize;
    let mut hint: Option<usize> = None;
    for pg in 0..pages {
        if let Err(err) = source.alloc_page(&mut sg[cur], flags, priv_) {
            trace!(page = pg, total = pages, "page source failed, rolling back");
            source.free_pages(&sg[..cur], priv_);
            sg.clear();
            return Err(err);
        }
        let merged = match mode {
            ClusteringMode::None => None,
            ClusteringMode::Tail => check_tail_clustering(sg, cur),
            ClusteringMode::Full => check_full_clustering(sg, cur, hint),
        };
        match merged {
            Some(idx) => hint = Some(idx),
            None => cur += 1,
        }
    }
    Ok(cur)
}

/// Builds the per-page translation table for a freshly populated SG list:
/// page `i` maps to the 1-based index of the entry containing it and to
/// the page index at which that entry starts.
pub(crate) fn build_trans_tbl(
    sg: &[SgEntry],
    sg_count: usize,
    pages: usize,
    tbl: &mut Vec<TransTblEntry>,
) {
    tbl.clear();
    tbl.resize(pages, TransTblEntry::default());

    let mut first_page = 0usize;
    for (n, entry) in sg[..sg_count].iter().enumerate() {
        let run = entry.length >> PAGE_SHIFT;
        for pg in 0..run {
            tbl[first_page + pg] = TransTblEntry {
                sg_num: (n + 1) as u32,
                pg_count: first_page as u32,
            };
        }
        first_page += run;
    }
    debug_assert_eq!(first_page, pages);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SgvError;
    use crate::types::{PageRef, PAGE_SIZE};
    use parking_lot::Mutex;

    /// Hands out a scripted sequence of frame numbers; optionally fails
    /// after a fixed number of pages. Frees are counted but the frames
    /// are fabricated, so nothing is released for real.
    struct ScriptedSource {
        frames: Mutex<Vec<usize>>,
        freed_pages: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(frames: &[usize]) -> Self {
            let mut frames: Vec<usize> = frames.to_vec();
            frames.reverse();
            Self {
                frames: Mutex::new(frames),
                freed_pages: Mutex::new(0),
            }
        }
    }

    impl PageSource for ScriptedSource {
        fn alloc_page(
            &self,
            entry: &mut SgEntry,
            _flags: AllocFlags,
            _priv: &mut AllocatorPriv,
        ) -> Result<()> {
            match self.frames.lock().pop() {
                Some(frame) => {
                    entry.set_page(PageRef::from_frame(frame), PAGE_SIZE, 0);
                    Ok(())
                }
                None => Err(SgvError::OutOfMemory { requested_pages: 1 }),
            }
        }

        fn free_pages(&self, entries: &[SgEntry], _priv: &mut AllocatorPriv) {
            let pages: usize = entries.iter().map(SgEntry::page_run).sum();
            *self.freed_pages.lock() += pages;
        }
    }

    fn populate(frames: &[usize], pages: usize, mode: ClusteringMode) -> (Vec<SgEntry>, usize) {
        let source = ScriptedSource::new(frames);
        let mut sg = Vec::new();
        let mut priv_ = None;
        let count = alloc_sg_entries(&source, &mut sg, pages, AllocFlags::empty(), mode, &mut priv_)
            .unwrap();
        (sg, count)
    }

    #[test]
    fn test_no_clustering_one_entry_per_page() {
        let (sg, count) = populate(&[100, 101, 102], 3, ClusteringMode::None);
        assert_eq!(count, 3);
        for (i, entry) in sg[..count].iter().enumerate() {
            assert_eq!(entry.page.unwrap().frame_number(), 100 + i);
            assert_eq!(entry.length, PAGE_SIZE);
        }
    }

    #[test]
    fn test_tail_clustering_extends_previous_entry() {
        let (sg, count) = populate(&[100, 101, 200, 201], 4, ClusteringMode::Tail);
        assert_eq!(count, 2);
        assert_eq!(sg[0].page.unwrap().frame_number(), 100);
        assert_eq!(sg[0].length, 2 * PAGE_SIZE);
        assert_eq!(sg[1].page.unwrap().frame_number(), 200);
        assert_eq!(sg[1].length, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_tail_clustering_ignores_head_adjacency() {
        // 100 precedes 101 physically, but arrives second; only full
        // clustering may prepend.
        let (_, count) = populate(&[101, 100], 2, ClusteringMode::Tail);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_full_clustering_merges_across_gap() {
        // An interleaved stranger page keeps its own entry while 102
        // still joins the 100..101 run behind it.
        let (sg, count) = populate(&[100, 101, 200, 102], 4, ClusteringMode::Full);
        assert_eq!(count, 2);
        assert_eq!(sg[0].page.unwrap().frame_number(), 100);
        assert_eq!(sg[0].length, 3 * PAGE_SIZE);
        assert_eq!(sg[1].page.unwrap().frame_number(), 200);
        assert_eq!(sg[1].length, PAGE_SIZE);
    }

    #[test]
    fn test_full_clustering_head_merge() {
        let (sg, count) = populate(&[101, 100], 2, ClusteringMode::Full);
        assert_eq!(count, 1);
        assert_eq!(sg[0].page.unwrap().frame_number(), 100);
        assert_eq!(sg[0].length, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_full_clustering_counts_maximal_runs() {
        // sg_count must equal the number of maximal contiguous runs,
        // whatever the arrival order within each run.
        let cases: [(&[usize], usize); 4] = [
            (&[1, 2, 3, 4], 1),
            (&[4, 3, 2, 1], 1),
            (&[20, 21, 60, 61, 22], 2),
            (&[7, 90, 8, 91, 9, 92], 2),
        ];
        for (frames, runs) in cases {
            let (_, count) = populate(frames, frames.len(), ClusteringMode::Full);
            assert_eq!(count, runs, "frames {frames:?}");
        }
    }

    #[test]
    fn test_trans_tbl_mapping() {
        let (sg, count) = populate(&[100, 101, 200, 102], 4, ClusteringMode::Full);
        let mut tbl = Vec::new();
        build_trans_tbl(&sg, count, 4, &mut tbl);

        // sg_num is 1-based and non-decreasing; pg_count is the first
        // page of the containing entry.
        assert_eq!(tbl.len(), 4);
        assert_eq!(tbl[0], TransTblEntry { sg_num: 1, pg_count: 0 });
        assert_eq!(tbl[1], TransTblEntry { sg_num: 1, pg_count: 0 });
        assert_eq!(tbl[2], TransTblEntry { sg_num: 1, pg_count: 0 });
        assert_eq!(tbl[3], TransTblEntry { sg_num: 2, pg_count: 3 });

        let mut prev = 0;
        for entry in &tbl {
            assert!(entry.sg_num >= prev && entry.sg_num as usize <= count);
            prev = entry.sg_num;
            assert_eq!(tbl[entry.pg_count as usize].pg_count, entry.pg_count);
        }
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        // Only two frames scripted for a four page request: the two pages
        // placed must be released and the list emptied.
        let source = ScriptedSource::new(&[100, 101]);
        let mut sg = Vec::new();
        let mut priv_ = None;
        let res = alloc_sg_entries(
            &source,
            &mut sg,
            4,
            AllocFlags::empty(),
            ClusteringMode::Full,
            &mut priv_,
        );
        assert!(matches!(res, Err(SgvError::OutOfMemory { .. })));
        assert!(sg.is_empty());
        assert_eq!(*source.freed_pages.lock(), 2);
    }
}
