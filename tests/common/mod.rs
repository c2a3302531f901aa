//! Synthetic checkpoint directories for integration tests

#![allow(dead_code)]

use critmem::images::reader::{IMG_COMMON_MAGIC, MM_MAGIC, PAGEMAP_MAGIC};
use critmem::mem::{PAGE_SIZE, PE_PARENT, PE_PRESENT};
use critmem::proto::{MmEntry, PagemapEntry, PagemapHead, VmaEntry};
use prost::Message;
use std::path::{Path, PathBuf};

pub struct CheckpointBuilder {
    pid: u32,
    pages_id: u32,
    mm: MmEntry,
    entries: Vec<PagemapEntry>,
    pages: Vec<u8>,
}

impl CheckpointBuilder {
    pub fn new(pid: u32, pages_id: u32) -> Self {
        CheckpointBuilder {
            pid,
            pages_id,
            mm: MmEntry::default(),
            entries: Vec::new(),
            pages: Vec::new(),
        }
    }

    pub fn vma(mut self, start: u64, end: u64, status: u32) -> Self {
        self.mm.vmas.push(VmaEntry {
            start,
            end,
            prot: 3,
            flags: 0x22,
            status,
            fd: -1,
            ..Default::default()
        });
        self
    }

    /// Present run backed by `data`, which must be whole pages.
    pub fn run(mut self, vaddr: u64, data: &[u8]) -> Self {
        assert_eq!(data.len() % PAGE_SIZE, 0);
        let nr_pages = (data.len() / PAGE_SIZE) as u64;
        self.entries.push(PagemapEntry {
            vaddr,
            compat_nr_pages: nr_pages as u32,
            in_parent: None,
            flags: Some(PE_PRESENT),
            nr_pages: Some(nr_pages),
        });
        self.pages.extend_from_slice(data);
        self
    }

    /// Present run of pages each filled with one byte.
    pub fn filled_run(self, vaddr: u64, fills: &[u8]) -> Self {
        let data: Vec<u8> = fills.iter().flat_map(|&b| vec![b; PAGE_SIZE]).collect();
        self.run(vaddr, &data)
    }

    /// Run whose pages live in the parent snapshot.
    pub fn parent_run(mut self, vaddr: u64, nr_pages: u64) -> Self {
        self.entries.push(PagemapEntry {
            vaddr,
            compat_nr_pages: nr_pages as u32,
            in_parent: Some(true),
            flags: Some(PE_PARENT),
            nr_pages: Some(nr_pages),
        });
        self
    }

    /// Entry as written by old CRIU: no flags and only the 32-bit count.
    pub fn compat_run(mut self, vaddr: u64, fills: &[u8]) -> Self {
        self.entries.push(PagemapEntry {
            vaddr,
            compat_nr_pages: fills.len() as u32,
            in_parent: None,
            flags: None,
            nr_pages: None,
        });
        for &b in fills {
            self.pages.extend(std::iter::repeat(b).take(PAGE_SIZE));
        }
        self
    }

    pub fn args(mut self, start: u64, end: u64) -> Self {
        self.mm.mm_arg_start = start;
        self.mm.mm_arg_end = end;
        self
    }

    pub fn env(mut self, start: u64, end: u64) -> Self {
        self.mm.mm_env_start = start;
        self.mm.mm_env_end = end;
        self
    }

    pub fn write(self, dir: &Path) -> PathBuf {
        std::fs::write(
            dir.join(format!("mm-{}.img", self.pid)),
            image(MM_MAGIC, &[self.mm.encode_to_vec()]),
        )
        .unwrap();

        let mut entries = vec![PagemapHead {
            pages_id: self.pages_id,
        }
        .encode_to_vec()];
        entries.extend(self.entries.iter().map(|e| e.encode_to_vec()));
        std::fs::write(
            dir.join(format!("pagemap-{}.img", self.pid)),
            image(PAGEMAP_MAGIC, &entries),
        )
        .unwrap();

        let pages_path = dir.join(format!("pages-{}.img", self.pages_id));
        std::fs::write(&pages_path, &self.pages).unwrap();
        pages_path
    }
}

/// CRIU framing: two magics, then size-prefixed entries.
pub fn image(magic: u32, entries: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&IMG_COMMON_MAGIC.to_le_bytes());
    buf.extend_from_slice(&magic.to_le_bytes());
    for e in entries {
        buf.extend_from_slice(&(e.len() as u32).to_le_bytes());
        buf.extend_from_slice(e);
    }
    buf
}

/// Page of distinct bytes so misplaced offsets show up.
pub fn patterned_page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
