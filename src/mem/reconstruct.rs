//! Address range reconstruction
//!
//! Walks the VMAs intersecting a range and copies each covered page from
//! the page store, clipping the first and last page to the range. Holes,
//! addresses outside every VMA and VVAR/VSYSCALL areas read as zeroes.

use std::io::{Read, Seek, Write};

use super::page_index::{PageIndex, PageLocation};
use super::page_store::PageStore;
use super::{page_addr, page_of, Vma, PAGE_SIZE};
use crate::error::{CritError, Result};

/// Pages assembled per buffer when streaming a range to a writer.
pub const MAX_BUNCH_SIZE: usize = 256;

/// Source of whole pages by virtual page number.
pub trait PageFetch {
    /// Fill `buf` with page `page_no`. Returns `false` if the page is not
    /// resident.
    fn fetch_page(&mut self, page_no: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<bool>;
}

pub struct MemoryReconstructor<'a, R> {
    vmas: &'a [Vma],
    index: &'a PageIndex,
    store: &'a mut PageStore<R>,
    parent: Option<&'a mut dyn PageFetch>,
    page: Box<[u8; PAGE_SIZE]>,
    // Virtual page currently held in `page`
    cached: Option<u64>,
    pages_read: u64,
}

impl<'a, R: Read + Seek> MemoryReconstructor<'a, R> {
    /// `vmas` must be sorted by start and non-overlapping.
    pub fn new(
        vmas: &'a [Vma],
        index: &'a PageIndex,
        store: &'a mut PageStore<R>,
        parent: Option<&'a mut dyn PageFetch>,
    ) -> Self {
        MemoryReconstructor {
            vmas,
            index,
            store,
            parent,
            page: Box::new([0u8; PAGE_SIZE]),
            cached: None,
            pages_read: 0,
        }
    }

    /// Page-store reads issued so far.
    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    /// Contents of `[lo, hi)`.
    pub fn read(&mut self, lo: u64, hi: u64) -> Result<Vec<u8>> {
        let len = range_len(lo, hi)?;
        let mut out = zeroed_buf(len).ok_or(CritError::InvalidRange { lo, hi })?;
        if len > 0 {
            self.fill(lo, &mut out)?;
        }
        Ok(out)
    }

    /// Contents of one VMA over its full extent.
    pub fn read_vma(&mut self, vma: &Vma) -> Result<Vec<u8>> {
        self.read(vma.start, vma.end)
    }

    /// Stream `[lo, hi)` to `w` in bunches of at most `MAX_BUNCH_SIZE`
    /// pages. Returns the number of bytes written.
    pub fn write_range<W: Write>(&mut self, lo: u64, hi: u64, w: &mut W) -> Result<u64> {
        if hi < lo {
            return Err(CritError::InvalidRange { lo, hi });
        }

        let mut buf = vec![0u8; MAX_BUNCH_SIZE * PAGE_SIZE];
        let mut pos = lo;
        while pos < hi {
            let bunch_end = page_addr(page_of(pos))
                .checked_add((MAX_BUNCH_SIZE * PAGE_SIZE) as u64)
                .map_or(hi, |end| end.min(hi));
            let chunk = &mut buf[..(bunch_end - pos) as usize];

            chunk.fill(0);
            self.fill(pos, chunk)?;
            w.write_all(chunk)?;
            pos = bunch_end;
        }

        Ok(hi - lo)
    }

    /// Fill `out` (already zeroed) with the contents starting at `lo`.
    fn fill(&mut self, lo: u64, out: &mut [u8]) -> Result<()> {
        let hi = lo + out.len() as u64;
        let vmas = self.vmas;
        let first = vmas.partition_point(|v| v.end <= lo);

        for vma in &vmas[first..] {
            if vma.start >= hi {
                break;
            }

            let start = vma.start.max(lo);
            let end = vma.end.min(hi);
            if start >= end || vma.is_special() {
                continue;
            }

            let dst = &mut out[(start - lo) as usize..(end - lo) as usize];
            self.copy_pages(start, end, dst)?;
        }

        Ok(())
    }

    /// Copy `[start, end)`, which lies inside one VMA, into `dst`.
    fn copy_pages(&mut self, start: u64, end: u64, dst: &mut [u8]) -> Result<()> {
        log::trace!("Copying 0x{:x}-0x{:x}", start, end);

        for page_no in page_of(start)..=page_of(end - 1) {
            let base = page_addr(page_no);
            let from = start.max(base);
            let to = end.min(base.checked_add(PAGE_SIZE as u64).unwrap_or(u64::MAX));

            if !self.load_page(page_no)? {
                continue;
            }

            let skip = (from - base) as usize;
            let n = (to - from) as usize;
            let off = (from - start) as usize;
            dst[off..off + n].copy_from_slice(&self.page[skip..skip + n]);
        }

        Ok(())
    }

    /// Bring `page_no` into `self.page`. Returns `false` for a hole.
    fn load_page(&mut self, page_no: u64) -> Result<bool> {
        if self.cached == Some(page_no) {
            return Ok(true);
        }

        match self.index.locate(page_no) {
            None => Ok(false),
            Some(PageLocation::Slot(slot)) => {
                self.cached = None;
                self.store.read_page(slot, &mut self.page)?;
                self.pages_read += 1;
                self.cached = Some(page_no);
                Ok(true)
            }
            Some(PageLocation::Parent) => {
                self.cached = None;
                let parent = self.parent.as_mut().ok_or_else(|| CritError::MalformedPagemap {
                    reason: format!(
                        "page 0x{:x} is in the parent snapshot but there is no parent",
                        page_addr(page_no)
                    ),
                })?;
                if !parent.fetch_page(page_no, &mut self.page)? {
                    return Err(CritError::MalformedPagemap {
                        reason: format!("missing 0x{:x} in parent pagemap", page_addr(page_no)),
                    });
                }
                self.cached = Some(page_no);
                Ok(true)
            }
        }
    }
}

impl<'a, R: Read + Seek> PageFetch for MemoryReconstructor<'a, R> {
    fn fetch_page(&mut self, page_no: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<bool> {
        if !self.load_page(page_no)? {
            return Ok(false);
        }
        buf.copy_from_slice(&self.page[..]);
        Ok(true)
    }
}

/// Length of `[lo, hi)` as a buffer size. Allocations are capped at
/// `isize::MAX` bytes.
pub fn range_len(lo: u64, hi: u64) -> Result<usize> {
    if hi < lo || hi - lo > isize::MAX as u64 {
        return Err(CritError::InvalidRange { lo, hi });
    }
    usize::try_from(hi - lo).map_err(|_| CritError::InvalidRange { lo, hi })
}

/// Zeroed buffer of `len` bytes, or `None` if it can't be allocated.
pub(crate) fn zeroed_buf(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::super::{vma_status, PagemapRun};
    use super::*;
    use std::io::Cursor;

    struct Fixture {
        vmas: Vec<Vma>,
        index: PageIndex,
        store: PageStore<Cursor<Vec<u8>>>,
    }

    impl Fixture {
        fn new(vmas: Vec<Vma>, runs: &[PagemapRun], fills: &[u8]) -> Self {
            let mut data = Vec::new();
            for &fill in fills {
                data.extend(std::iter::repeat(fill).take(PAGE_SIZE));
            }
            let len = data.len() as u64;
            let store = PageStore::new(Cursor::new(data), "test", len);
            let index = PageIndex::build(runs, store.page_count()).unwrap();
            Fixture { vmas, index, store }
        }

        fn reconstructor(&mut self) -> MemoryReconstructor<'_, Cursor<Vec<u8>>> {
            MemoryReconstructor::new(&self.vmas, &self.index, &mut self.store, None)
        }
    }

    fn two_page_fixture() -> Fixture {
        Fixture::new(
            vec![Vma::new(0x1000, 0x3000, vma_status::VMA_AREA_REGULAR)],
            &[PagemapRun::present(0x1000, 2)],
            &[0xaa, 0xbb],
        )
    }

    #[test]
    fn test_full_vma() {
        let mut fx = two_page_fixture();
        let data = fx.reconstructor().read(0x1000, 0x3000).unwrap();

        assert_eq!(data.len(), 2 * PAGE_SIZE);
        assert!(data[..PAGE_SIZE].iter().all(|&b| b == 0xaa));
        assert!(data[PAGE_SIZE..].iter().all(|&b| b == 0xbb));
    }

    #[test]
    fn test_partial_page() {
        let mut fx = two_page_fixture();
        let data = fx.reconstructor().read(0x1800, 0x1900).unwrap();
        assert_eq!(data, vec![0xaa; 0x100]);
    }

    #[test]
    fn test_straddles_page_boundary() {
        let mut fx = two_page_fixture();
        let data = fx.reconstructor().read(0x1ff0, 0x2010).unwrap();
        assert_eq!(&data[..0x10], &[0xaa; 0x10]);
        assert_eq!(&data[0x10..], &[0xbb; 0x10]);
    }

    #[test]
    fn test_split_reads_match() {
        let mut fx = Fixture::new(
            vec![Vma::new(0x1000, 0x5000, 0)],
            &[PagemapRun::present(0x1000, 1), PagemapRun::present(0x3000, 2)],
            &[0x01, 0x03, 0x04],
        );
        let mut r = fx.reconstructor();
        let whole = r.read(0x1000, 0x5000).unwrap();

        for mid in [0x1000, 0x1001, 0x1fff, 0x2000, 0x2800, 0x3abc, 0x4fff, 0x5000] {
            let mut joined = r.read(0x1000, mid).unwrap();
            joined.extend(r.read(mid, 0x5000).unwrap());
            assert_eq!(joined, whole, "split at 0x{:x}", mid);
        }
    }

    #[test]
    fn test_hole_is_zero() {
        let mut fx = Fixture::new(
            vec![Vma::new(0x1000, 0x4000, 0)],
            &[PagemapRun::present(0x1000, 1), PagemapRun::present(0x3000, 1)],
            &[0x11, 0x33],
        );
        let data = fx.reconstructor().read(0x1000, 0x4000).unwrap();

        assert!(data[..PAGE_SIZE].iter().all(|&b| b == 0x11));
        assert!(data[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == 0));
        assert!(data[2 * PAGE_SIZE..].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_outside_vmas_is_zero() {
        let mut fx = two_page_fixture();
        let data = fx.reconstructor().read(0x0, 0x4000).unwrap();

        assert_eq!(data.len(), 4 * PAGE_SIZE);
        assert!(data[..PAGE_SIZE].iter().all(|&b| b == 0));
        assert!(data[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == 0xaa));
        assert!(data[3 * PAGE_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_special_vmas_ignore_pagemap() {
        for status in [vma_status::VMA_AREA_VVAR, vma_status::VMA_AREA_VSYSCALL] {
            let mut fx = Fixture::new(
                vec![Vma::new(0x1000, 0x2000, status)],
                &[PagemapRun::present(0x1000, 1)],
                &[0xee],
            );
            let mut r = fx.reconstructor();
            let data = r.read(0x1000, 0x2000).unwrap();
            assert_eq!(data, vec![0u8; PAGE_SIZE]);
            assert_eq!(r.pages_read(), 0);
        }
    }

    #[test]
    fn test_empty_range_touches_nothing() {
        let mut fx = two_page_fixture();
        let mut r = fx.reconstructor();
        assert!(r.read(0x1800, 0x1800).unwrap().is_empty());
        assert_eq!(r.pages_read(), 0);
    }

    #[test]
    fn test_inverted_range() {
        let mut fx = two_page_fixture();
        let err = fx.reconstructor().read(0x2000, 0x1000).unwrap_err();
        assert!(matches!(err, CritError::InvalidRange { lo: 0x2000, hi: 0x1000 }));
    }

    #[test]
    fn test_oversized_range() {
        let mut fx = two_page_fixture();
        let err = fx.reconstructor().read(0, u64::MAX).unwrap_err();
        assert!(matches!(err, CritError::InvalidRange { lo: 0, hi: u64::MAX }));

        assert!(range_len(0, isize::MAX as u64 + 1).is_err());
        assert_eq!(range_len(0x1000, 0x3000).unwrap(), 0x2000);
    }

    #[test]
    fn test_each_page_read_once() {
        let mut fx = Fixture::new(
            vec![Vma::new(0x1000, 0x4000, 0)],
            &[PagemapRun::present(0x1000, 3)],
            &[1, 2, 3],
        );
        let mut r = fx.reconstructor();
        r.read(0x1010, 0x3ff0).unwrap();
        assert_eq!(r.pages_read(), 3);
    }

    #[test]
    fn test_page_shared_by_unaligned_vmas_read_once() {
        let mut fx = Fixture::new(
            vec![Vma::new(0x1000, 0x1800, 0), Vma::new(0x1800, 0x2000, 0)],
            &[PagemapRun::present(0x1000, 1)],
            &[0x5a],
        );
        let mut r = fx.reconstructor();
        let data = r.read(0x1000, 0x2000).unwrap();
        assert_eq!(data, vec![0x5a; PAGE_SIZE]);
        assert_eq!(r.pages_read(), 1);
    }

    #[test]
    fn test_write_range_matches_read() {
        let mut fx = Fixture::new(
            vec![Vma::new(0x0, 0x200000, 0)],
            &[PagemapRun::present(0x1000, 1), PagemapRun::present(0x150000, 2)],
            &[0x10, 0x20, 0x30],
        );
        let mut r = fx.reconstructor();
        let expected = r.read(0x123, 0x1fff00).unwrap();

        let mut streamed = Vec::new();
        let written = r.write_range(0x123, 0x1fff00, &mut streamed).unwrap();
        assert_eq!(written, 0x1fff00 - 0x123);
        assert_eq!(streamed, expected);
    }

    struct FixedParent(u8);

    impl PageFetch for FixedParent {
        fn fetch_page(&mut self, page_no: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<bool> {
            if page_no == page_of(0x2000) {
                buf.fill(self.0);
                return Ok(true);
            }
            Ok(false)
        }
    }

    #[test]
    fn test_parent_pages() {
        let runs = [
            PagemapRun::present(0x1000, 1),
            PagemapRun {
                vaddr: 0x2000,
                nr_pages: 1,
                flags: super::super::PE_PARENT,
            },
        ];
        let mut fx = Fixture::new(vec![Vma::new(0x1000, 0x3000, 0)], &runs, &[0x01]);
        let mut parent = FixedParent(0x7e);

        let parent: &mut dyn PageFetch = &mut parent;
        let data = MemoryReconstructor::new(&fx.vmas, &fx.index, &mut fx.store, Some(parent))
            .read(0x1000, 0x3000)
            .unwrap();
        assert!(data[..PAGE_SIZE].iter().all(|&b| b == 0x01));
        assert!(data[PAGE_SIZE..].iter().all(|&b| b == 0x7e));

        let err = fx.reconstructor().read(0x2000, 0x2010).unwrap_err();
        assert!(matches!(err, CritError::MalformedPagemap { .. }));
    }
}
