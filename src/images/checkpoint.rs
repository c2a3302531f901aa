// Decoded per-process checkpoint records
use super::reader::ImageDir;
use crate::error::{CritError, Result};
use crate::mem::{validate_vmas, PagemapRun, Vma, PAGE_SIZE};
use crate::proto::{MmEntry, PagemapEntry, VmaEntry};

#[derive(Debug, Clone)]
pub struct Pagemap {
    pub pages_id: u32,
    pub entries: Vec<PagemapEntry>,
}

/// Memory-related records of one process
pub struct ProcessImages {
    pub pid: u32,
    pub mm: MmEntry,
    pub vmas: Vec<Vma>,
    pub pages_id: u32,
    pub runs: Vec<PagemapRun>,
}

impl ProcessImages {
    /// Load `mm-<pid>.img` and `pagemap-<pid>.img`.
    pub fn load(img: &ImageDir, pid: u32) -> Result<Self> {
        let mm = match img.read_mm(pid) {
            Ok(Some(mm)) => mm,
            Ok(None) | Err(CritError::ImageNotFound { .. }) => {
                return Err(CritError::ProcessNotFound { pid })
            }
            Err(e) => return Err(e),
        };
        let pagemap = match img.read_pagemap(pid) {
            Ok(Some(pagemap)) => pagemap,
            Ok(None) | Err(CritError::ImageNotFound { .. }) => {
                return Err(CritError::ProcessNotFound { pid })
            }
            Err(e) => return Err(e),
        };

        let vmas: Vec<Vma> = mm.vmas.iter().map(Vma::from).collect();
        validate_vmas(&vmas)?;

        let runs = pagemap.entries.iter().map(PagemapRun::from).collect();

        log::info!(
            "Loaded images for PID {} from {}: {} VMAs, {} pagemap entries",
            pid,
            img.path().display(),
            vmas.len(),
            pagemap.entries.len()
        );

        Ok(ProcessImages {
            pid,
            mm,
            vmas,
            pages_id: pagemap.pages_id,
            runs,
        })
    }

    /// Log the loaded records for debugging
    pub fn display(&self) {
        self.display_memory_map();
        self.display_pagemap();
    }

    fn display_memory_map(&self) {
        log::debug!("Memory Map (mm-{}.img)", self.pid);
        log::debug!("  MM start code: 0x{:x}", self.mm.mm_start_code);
        log::debug!("  MM end code: 0x{:x}", self.mm.mm_end_code);
        log::debug!("  MM start data: 0x{:x}", self.mm.mm_start_data);
        log::debug!("  MM end data: 0x{:x}", self.mm.mm_end_data);
        log::debug!("  MM start stack: 0x{:x}", self.mm.mm_start_stack);
        log::debug!("  MM start brk: 0x{:x}", self.mm.mm_start_brk);
        log::debug!("  MM brk: 0x{:x}", self.mm.mm_brk);
        log::debug!("  MM arg start: 0x{:x}", self.mm.mm_arg_start);
        log::debug!("  MM arg end: 0x{:x}", self.mm.mm_arg_end);
        log::debug!("  MM env start: 0x{:x}", self.mm.mm_env_start);
        log::debug!("  MM env end: 0x{:x}", self.mm.mm_env_end);

        log::debug!("Memory Regions ({} VMAs):", self.mm.vmas.len());
        for (i, vma) in self.mm.vmas.iter().enumerate() {
            log::debug!("  [{:2}] {}", i, describe_vma(vma));
        }
    }

    fn display_pagemap(&self) {
        let total_pages: u64 = self
            .runs
            .iter()
            .filter(|r| r.is_present())
            .map(|r| r.nr_pages)
            .sum();
        let total_bytes = total_pages * PAGE_SIZE as u64;
        let lazy_pages: u64 = self
            .runs
            .iter()
            .filter(|r| r.is_lazy())
            .map(|r| r.nr_pages)
            .sum();

        log::debug!(
            "Pagemap (pagemap-{}.img, pages-{}.img)",
            self.pid,
            self.pages_id
        );
        log::debug!("Pagemap entries: {}", self.runs.len());
        log::debug!(
            "Stored pages: {} ({:.2} MB)",
            total_pages,
            total_bytes as f64 / 1024.0 / 1024.0
        );
        if lazy_pages > 0 {
            log::debug!("Lazy pages: {}", lazy_pages);
        }

        for (i, run) in self.runs.iter().enumerate().take(5) {
            log::debug!(
                "  Entry[{}]: vaddr=0x{:x} pages={} flags=0x{:x}",
                i,
                run.vaddr,
                run.nr_pages,
                run.flags
            );
        }
        if self.runs.len() > 5 {
            log::debug!("  ... ({} more entries)", self.runs.len() - 5);
        }
    }
}

/// One-line `start-end size prot flags` description of a VMA.
pub fn describe_vma(vma: &VmaEntry) -> String {
    let prot_str = format!(
        "{}{}{}",
        if vma.prot & 1 != 0 { "r" } else { "-" },
        if vma.prot & 2 != 0 { "w" } else { "-" },
        if vma.prot & 4 != 0 { "x" } else { "-" }
    );
    let flags_str = format!(
        "{}{}",
        if vma.flags & 0x01 != 0 { "s" } else { "p" },
        if vma.flags & 0x20 != 0 { " anon" } else { "" }
    );
    format!(
        "0x{:016x}-0x{:016x} ({:8} bytes) {}{} status=0x{:x}",
        vma.start,
        vma.end,
        vma.end.saturating_sub(vma.start),
        prot_str,
        flags_str,
        vma.status
    )
}
