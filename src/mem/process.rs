//! Per-process memory access
//!
//! `ProcessMemory` owns everything one reconstruction needs: the VMA list,
//! the page index and the open page store. The free functions are one-shot
//! wrappers that load, read and drop it.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::page_index::PageIndex;
use super::page_store::PageStore;
use super::reconstruct::{MemoryReconstructor, PageFetch};
use super::{Vma, PAGE_SIZE};
use crate::error::{CritError, Result};
use crate::images::{ImageDir, ProcessImages};

pub struct ProcessMemory {
    images: ProcessImages,
    index: PageIndex,
    store: PageStore<File>,
    parent: Option<Box<ProcessMemory>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl ProcessMemory {
    pub fn load(dir: impl AsRef<Path>, pid: u32) -> Result<Self> {
        let img = ImageDir::open(dir)?;
        Self::from_image_dir(&img, pid)
    }

    pub fn from_image_dir(img: &ImageDir, pid: u32) -> Result<Self> {
        let mut visited = Vec::new();
        Self::load_snapshot(img, pid, &mut visited)
    }

    // `visited` holds the canonical paths of the snapshots already on the chain
    fn load_snapshot(img: &ImageDir, pid: u32, visited: &mut Vec<PathBuf>) -> Result<Self> {
        visited.push(std::fs::canonicalize(img.path())?);

        let images = ProcessImages::load(img, pid)?;
        images.display();

        let store = PageStore::open(img.pages_path(images.pages_id))?;
        log::debug!("Opened {} ({} pages)", store.name(), store.page_count());
        let index = PageIndex::build(&images.runs, store.page_count())?;

        let parent = if index.has_parent_pages() {
            Some(Box::new(Self::load_parent(img, pid, visited)?))
        } else {
            None
        };

        Ok(ProcessMemory {
            images,
            index,
            store,
            parent,
        })
    }

    fn load_parent(img: &ImageDir, pid: u32, visited: &mut Vec<PathBuf>) -> Result<Self> {
        let parent = img.parent()?.ok_or_else(|| CritError::MalformedPagemap {
            reason: format!(
                "pagemap-{}.img references a parent snapshot but {} has none",
                pid,
                img.path().display()
            ),
        })?;

        let real = std::fs::canonicalize(parent.path())?;
        if visited.contains(&real) {
            return Err(CritError::MalformedPagemap {
                reason: format!(
                    "parent snapshot chain of {} has a cycle at {}",
                    img.path().display(),
                    real.display()
                ),
            });
        }

        log::debug!("Loading parent snapshot {}", parent.path().display());
        match Self::load_snapshot(&parent, pid, visited) {
            Err(CritError::ProcessNotFound { .. }) => Err(CritError::MalformedPagemap {
                reason: format!(
                    "parent snapshot {} has no images for PID {}",
                    parent.path().display(),
                    pid
                ),
            }),
            other => other,
        }
    }

    pub fn pid(&self) -> u32 {
        self.images.pid
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.images.vmas
    }

    pub fn images(&self) -> &ProcessImages {
        &self.images
    }

    pub fn index(&self) -> &PageIndex {
        &self.index
    }

    pub fn reconstructor(&mut self) -> MemoryReconstructor<'_, File> {
        let parent = self.parent.as_deref_mut().map(|p| p as &mut dyn PageFetch);
        MemoryReconstructor::new(&self.images.vmas, &self.index, &mut self.store, parent)
    }

    /// Contents of `[lo, hi)`.
    pub fn read_range(&mut self, lo: u64, hi: u64) -> Result<Vec<u8>> {
        self.reconstructor().read(lo, hi)
    }

    /// Every VMA over its full extent, concatenated in address order.
    pub fn dump(&mut self) -> Result<Vec<u8>> {
        let total: u64 = self.images.vmas.iter().map(Vma::len).sum();
        let mut out = Vec::new();
        if total > isize::MAX as u64 || out.try_reserve_exact(total as usize).is_err() {
            let lo = self.images.vmas.first().map_or(0, |v| v.start);
            let hi = self.images.vmas.last().map_or(0, |v| v.end);
            return Err(CritError::InvalidRange { lo, hi });
        }

        let parent = self.parent.as_deref_mut().map(|p| p as &mut dyn PageFetch);
        let mut r =
            MemoryReconstructor::new(&self.images.vmas, &self.index, &mut self.store, parent);
        for vma in &self.images.vmas {
            out.extend(r.read_vma(vma)?);
        }

        log::info!(
            "Dumped {} VMAs of PID {}: {} bytes, {} pages read",
            self.images.vmas.len(),
            self.images.pid,
            out.len(),
            r.pages_read()
        );
        Ok(out)
    }

    /// Same bytes as `dump`, streamed to `w`. Returns the number written.
    pub fn dump_to<W: Write>(&mut self, w: &mut W) -> Result<u64> {
        let parent = self.parent.as_deref_mut().map(|p| p as &mut dyn PageFetch);
        let mut r =
            MemoryReconstructor::new(&self.images.vmas, &self.index, &mut self.store, parent);

        let mut written = 0u64;
        for vma in &self.images.vmas {
            log::debug!("Dumping VMA 0x{:x}-0x{:x}", vma.start, vma.end);
            written += r.write_range(vma.start, vma.end, w)?;
        }

        log::info!(
            "Dumped {} VMAs of PID {}: {} bytes, {} pages read",
            self.images.vmas.len(),
            self.images.pid,
            written,
            r.pages_read()
        );
        Ok(written)
    }

    /// Command-line arguments from `[mm_arg_start, mm_arg_end)`.
    pub fn arguments(&mut self) -> Result<Vec<String>> {
        let (lo, hi) = (self.images.mm.mm_arg_start, self.images.mm.mm_arg_end);
        let data = self.read_range(lo, hi)?;
        Ok(split_nul(&data))
    }

    /// Environment from `[mm_env_start, mm_env_end)`.
    pub fn environment(&mut self) -> Result<Vec<EnvVar>> {
        let (lo, hi) = (self.images.mm.mm_env_start, self.images.mm.mm_env_end);
        let data = self.read_range(lo, hi)?;

        Ok(split_nul(&data)
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((name, value)) => EnvVar {
                    name: name.to_string(),
                    value: value.to_string(),
                },
                None => EnvVar {
                    name: entry,
                    value: String::new(),
                },
            })
            .collect())
    }
}

impl PageFetch for ProcessMemory {
    fn fetch_page(&mut self, page_no: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<bool> {
        self.reconstructor().fetch_page(page_no, buf)
    }
}

/// NUL-separated strings, ignoring empty ones.
fn split_nul(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Full memory image of `pid`: every VMA in address order.
pub fn dump_process(dir: impl AsRef<Path>, pid: u32) -> Result<Vec<u8>> {
    ProcessMemory::load(dir, pid)?.dump()
}

/// Stream the full memory image of `pid` into `w`.
pub fn dump_process_to<W: Write>(dir: impl AsRef<Path>, pid: u32, w: &mut W) -> Result<u64> {
    ProcessMemory::load(dir, pid)?.dump_to(w)
}

/// Contents of `[lo, hi)` in the address space of `pid`.
pub fn read_range(dir: impl AsRef<Path>, pid: u32, lo: u64, hi: u64) -> Result<Vec<u8>> {
    if hi < lo {
        return Err(CritError::InvalidRange { lo, hi });
    }
    ProcessMemory::load(dir, pid)?.read_range(lo, hi)
}

pub fn process_arguments(dir: impl AsRef<Path>, pid: u32) -> Result<Vec<String>> {
    ProcessMemory::load(dir, pid)?.arguments()
}

pub fn process_environment(dir: impl AsRef<Path>, pid: u32) -> Result<Vec<EnvVar>> {
    ProcessMemory::load(dir, pid)?.environment()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_nul() {
        assert_eq!(split_nul(b"bash\0-c\0ls\0"), vec!["bash", "-c", "ls"]);
        assert_eq!(split_nul(b"\0\0"), Vec::<String>::new());
        assert_eq!(split_nul(b"tail"), vec!["tail"]);
    }

    #[test]
    fn test_read_range_checks_order_first() {
        // Inverted ranges fail before the directory is touched
        let err = read_range("/nonexistent", 1, 0x2000, 0x1000).unwrap_err();
        assert!(matches!(err, CritError::InvalidRange { .. }));
    }
}
