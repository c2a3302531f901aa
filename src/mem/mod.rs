//! Process memory reconstruction
//!
//! Rebuilds the contents of a checkpointed address space from the VMA list
//! in `mm-<pid>.img`, the run index in `pagemap-<pid>.img` and the raw page
//! data in `pages-<id>.img`.

pub mod hexdump;
pub mod page_index;
pub mod page_store;
pub mod process;
pub mod reconstruct;

pub use hexdump::hexdump;
pub use page_index::{PageIndex, PageLocation};
pub use page_store::PageStore;
pub use process::{
    dump_process, dump_process_to, process_arguments, process_environment, read_range, EnvVar,
    ProcessMemory,
};
pub use reconstruct::{MemoryReconstructor, PageFetch};

use crate::proto::{PagemapEntry, VmaEntry};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Pagemap entry flags (`pmap.flags` in CRIU)
pub const PE_PARENT: u32 = 1 << 0;
pub const PE_LAZY: u32 = 1 << 1;
pub const PE_PRESENT: u32 = 1 << 2;

/// VMA status bits carried in `VmaEntry::status`
pub mod vma_status {
    pub const VMA_AREA_NONE: u32 = 0;
    pub const VMA_AREA_REGULAR: u32 = 1 << 0;
    pub const VMA_AREA_STACK: u32 = 1 << 1;
    pub const VMA_AREA_VSYSCALL: u32 = 1 << 2;
    pub const VMA_AREA_VDSO: u32 = 1 << 3;
    pub const VMA_AREA_HEAP: u32 = 1 << 5;
    pub const VMA_FILE_PRIVATE: u32 = 1 << 6;
    pub const VMA_FILE_SHARED: u32 = 1 << 7;
    pub const VMA_ANON_SHARED: u32 = 1 << 8;
    pub const VMA_ANON_PRIVATE: u32 = 1 << 9;
    pub const VMA_AREA_SYSVIPC: u32 = 1 << 10;
    pub const VMA_AREA_SOCKET: u32 = 1 << 11;
    pub const VMA_AREA_VVAR: u32 = 1 << 12;
    pub const VMA_AREA_AIORING: u32 = 1 << 13;
    pub const VMA_AREA_MEMFD: u32 = 1 << 14;
    pub const VMA_AREA_SHSTK: u32 = 1 << 15;
    pub const VMA_AREA_GUARD: u32 = 1 << 16;
}

#[inline]
pub fn page_of(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

#[inline]
pub fn page_addr(page_no: u64) -> u64 {
    page_no << PAGE_SHIFT
}

/// Half-open virtual address range `[start, end)` with its CRIU status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub status: u32,
}

impl Vma {
    pub fn new(start: u64, end: u64, status: u32) -> Self {
        Vma { start, end, status }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// VVAR and VSYSCALL areas are mapped by the kernel and never dumped.
    pub fn is_special(&self) -> bool {
        self.status & (vma_status::VMA_AREA_VVAR | vma_status::VMA_AREA_VSYSCALL) != 0
    }
}

impl From<&VmaEntry> for Vma {
    fn from(e: &VmaEntry) -> Self {
        Vma::new(e.start, e.end, e.status)
    }
}

/// `nr_pages` consecutive pages starting at `vaddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagemapRun {
    pub vaddr: u64,
    pub nr_pages: u64,
    pub flags: u32,
}

impl PagemapRun {
    /// A run whose pages are stored in this snapshot's page store.
    pub fn present(vaddr: u64, nr_pages: u64) -> Self {
        PagemapRun {
            vaddr,
            nr_pages,
            flags: PE_PRESENT,
        }
    }

    pub fn is_present(&self) -> bool {
        self.flags & PE_PRESENT != 0
    }

    pub fn in_parent(&self) -> bool {
        self.flags & PE_PARENT != 0
    }

    /// Pages left for the lazy-pages daemon rather than dumped eagerly.
    pub fn is_lazy(&self) -> bool {
        self.flags & PE_LAZY != 0
    }
}

impl From<&PagemapEntry> for PagemapRun {
    fn from(pe: &PagemapEntry) -> Self {
        // Images written by older CRIU versions have neither flags nor the
        // 64-bit page count.
        let flags = if pe.in_parent == Some(true) {
            pe.flags.unwrap_or(0) | PE_PARENT
        } else {
            pe.flags.unwrap_or(PE_PRESENT)
        };

        PagemapRun {
            vaddr: pe.vaddr,
            nr_pages: pe.nr_pages.unwrap_or(pe.compat_nr_pages as u64),
            flags,
        }
    }
}

/// Check that VMAs are well formed, sorted by start and non-overlapping.
pub fn validate_vmas(vmas: &[Vma]) -> crate::Result<()> {
    let mut prev_end = 0u64;
    for (i, vma) in vmas.iter().enumerate() {
        if vma.end < vma.start {
            return Err(crate::CritError::InvalidImage {
                reason: format!(
                    "VMA[{}] 0x{:x}-0x{:x} ends before it starts",
                    i, vma.start, vma.end
                ),
            });
        }
        if i > 0 && vma.start < prev_end {
            return Err(crate::CritError::InvalidImage {
                reason: format!(
                    "VMA[{}] 0x{:x}-0x{:x} overlaps or precedes previous VMA ending at 0x{:x}",
                    i, vma.start, vma.end, prev_end
                ),
            });
        }
        prev_end = vma.end;
    }
    Ok(())
}
