//! Virtual page to page-store slot index
//!
//! Slots are numbered across every present run of the process in pagemap
//! order, not per VMA: `pages-<id>.img` is one flat file shared by all of
//! the process's mappings.

use super::{page_addr, PagemapRun, PAGE_SHIFT};
use crate::error::{CritError, Result};

/// Number of pages in a 64-bit address space.
const MAX_PAGES: u64 = 1 << (64 - PAGE_SHIFT);

/// Where the contents of a resident page live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    /// Slot in this snapshot's page store.
    Slot(u64),
    /// Same virtual page in the parent snapshot.
    Parent,
}

#[derive(Debug, Clone, Copy)]
struct IndexedRun {
    start_page: u64,
    nr_pages: u64,
    // None for runs that live in the parent snapshot
    first_slot: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PageIndex {
    runs: Vec<IndexedRun>,
    resident_pages: u64,
}

impl PageIndex {
    /// Build the index from pagemap runs in image order.
    ///
    /// `store_pages` is the number of whole pages in the page store; runs
    /// claiming more slots than that are rejected.
    pub fn build(runs: &[PagemapRun], store_pages: u64) -> Result<Self> {
        let mut indexed = Vec::with_capacity(runs.len());
        let mut next_slot = 0u64;
        let mut prev_end = 0u64;

        for (i, run) in runs.iter().enumerate() {
            if run.nr_pages == 0 {
                log::debug!("Skipping empty pagemap run[{}] at 0x{:x}", i, run.vaddr);
                continue;
            }
            if run.vaddr & (super::PAGE_SIZE as u64 - 1) != 0 {
                return Err(CritError::MalformedPagemap {
                    reason: format!("run[{}] vaddr 0x{:x} is not page aligned", i, run.vaddr),
                });
            }

            let start_page = super::page_of(run.vaddr);
            let end_page = match start_page.checked_add(run.nr_pages) {
                Some(end) if end <= MAX_PAGES => end,
                _ => {
                    return Err(CritError::MalformedPagemap {
                        reason: format!(
                            "run[{}] at 0x{:x} with {} pages overflows the address space",
                            i, run.vaddr, run.nr_pages
                        ),
                    })
                }
            };

            if start_page < prev_end {
                return Err(CritError::MalformedPagemap {
                    reason: format!(
                        "run[{}] at 0x{:x} is unsorted or overlaps previous run ending at 0x{:x}",
                        i,
                        run.vaddr,
                        page_addr(prev_end)
                    ),
                });
            }
            prev_end = end_page;

            let first_slot = if run.is_present() {
                let first = next_slot;
                next_slot += run.nr_pages;
                if next_slot > store_pages {
                    return Err(CritError::MalformedPagemap {
                        reason: format!(
                            "run[{}] at 0x{:x} needs slot {} but page store holds {} pages",
                            i,
                            run.vaddr,
                            next_slot - 1,
                            store_pages
                        ),
                    });
                }
                Some(first)
            } else if run.in_parent() {
                None
            } else {
                // Neither stored here nor in the parent: a hole
                continue;
            };

            indexed.push(IndexedRun {
                start_page,
                nr_pages: run.nr_pages,
                first_slot,
            });
        }

        log::debug!(
            "Page index: {} runs, {} pages in store ({} available)",
            indexed.len(),
            next_slot,
            store_pages
        );

        Ok(PageIndex {
            runs: indexed,
            resident_pages: next_slot,
        })
    }

    /// Slot of `page_no` in the local page store, or `None` for a hole or a
    /// page kept in the parent snapshot.
    pub fn lookup(&self, page_no: u64) -> Option<u64> {
        match self.locate(page_no) {
            Some(PageLocation::Slot(slot)) => Some(slot),
            _ => None,
        }
    }

    pub fn locate(&self, page_no: u64) -> Option<PageLocation> {
        let idx = self.runs.partition_point(|r| r.start_page <= page_no);
        if idx == 0 {
            return None;
        }

        let run = &self.runs[idx - 1];
        let offset = page_no - run.start_page;
        if offset >= run.nr_pages {
            return None;
        }

        Some(match run.first_slot {
            Some(first) => PageLocation::Slot(first + offset),
            None => PageLocation::Parent,
        })
    }

    /// Pages stored in the local page store.
    pub fn resident_pages(&self) -> u64 {
        self.resident_pages
    }

    /// Whether any run refers to the parent snapshot.
    pub fn has_parent_pages(&self) -> bool {
        self.runs.iter().any(|r| r.first_slot.is_none())
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Locally stored pages within `[start, end)`.
    pub fn resident_in(&self, start: u64, end: u64) -> u64 {
        if end <= start {
            return 0;
        }
        let first = super::page_of(start);
        let last = super::page_of(end - 1) + 1;

        self.runs
            .iter()
            .filter(|r| r.first_slot.is_some())
            .map(|r| {
                let lo = r.start_page.max(first);
                let hi = (r.start_page + r.nr_pages).min(last);
                hi.saturating_sub(lo)
            })
            .sum()
    }
}
