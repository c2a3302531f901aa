// Reader for pages-<id>.img
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use super::PAGE_SIZE;
use crate::error::{CritError, Result};

/// Raw page data addressed by slot. The file has no image header: slot `n`
/// is at byte offset `n * PAGE_SIZE`.
pub struct PageStore<R = File> {
    reader: R,
    name: String,
    pages: u64,
    // Byte offset the reader is positioned at, if known
    pos: Option<u64>,
}

impl PageStore<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();

        let file = File::open(path).map_err(|e| CritError::CorruptPageStore {
            reason: format!("can't open {}: {}", name, e),
        })?;
        let len = file.metadata()?.len();

        if len % PAGE_SIZE as u64 != 0 {
            log::warn!(
                "{} has {} trailing bytes past the last whole page",
                name,
                len % PAGE_SIZE as u64
            );
        }

        Ok(PageStore::new(file, name, len))
    }
}

impl<R: Read + Seek> PageStore<R> {
    /// Wrap a reader holding `len` bytes of page data.
    pub fn new(reader: R, name: impl Into<String>, len: u64) -> Self {
        PageStore {
            reader,
            name: name.into(),
            pages: len / PAGE_SIZE as u64,
            pos: None,
        }
    }

    /// Number of whole pages in the store.
    pub fn page_count(&self) -> u64 {
        self.pages
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the page at `slot` into `buf`. A short read is an error; the
    /// missing tail is never zero-filled.
    pub fn read_page(&mut self, slot: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let offset = slot
            .checked_mul(PAGE_SIZE as u64)
            .ok_or_else(|| CritError::CorruptPageStore {
                reason: format!("slot {} is out of range for {}", slot, self.name),
            })?;

        if self.pos != Some(offset) {
            self.pos = None;
            self.reader.seek(SeekFrom::Start(offset))?;
        }

        match self.reader.read_exact(buf) {
            Ok(()) => {
                self.pos = Some(offset + PAGE_SIZE as u64);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.pos = None;
                Err(CritError::CorruptPageStore {
                    reason: format!(
                        "short read of slot {} (offset 0x{:x}) in {}",
                        slot, offset, self.name
                    ),
                })
            }
            Err(e) => {
                self.pos = None;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store_of(pages: &[u8]) -> PageStore<Cursor<Vec<u8>>> {
        let mut data = Vec::new();
        for &fill in pages {
            data.extend(std::iter::repeat(fill).take(PAGE_SIZE));
        }
        let len = data.len() as u64;
        PageStore::new(Cursor::new(data), "test", len)
    }

    #[test]
    fn test_read_pages_out_of_order() {
        let mut store = store_of(&[0xaa, 0xbb, 0xcc]);
        let mut buf = [0u8; PAGE_SIZE];

        store.read_page(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xcc));
        store.read_page(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xaa));
        store.read_page(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xbb));
        assert_eq!(store.page_count(), 3);
    }

    #[test]
    fn test_short_read_is_corruption() {
        let mut data = vec![0x11u8; PAGE_SIZE + 100];
        data[PAGE_SIZE] = 0x22;
        let len = data.len() as u64;
        let mut store = PageStore::new(Cursor::new(data), "short", len);
        let mut buf = [0u8; PAGE_SIZE];

        assert_eq!(store.page_count(), 1);
        store.read_page(0, &mut buf).unwrap();
        let err = store.read_page(1, &mut buf).unwrap_err();
        assert!(matches!(err, CritError::CorruptPageStore { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PageStore::open(dir.path().join("pages-1.img")).err().unwrap();
        assert!(matches!(err, CritError::CorruptPageStore { .. }));
    }

    #[test]
    fn test_open_counts_whole_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages-1.img");
        std::fs::write(&path, vec![0u8; PAGE_SIZE * 2 + 7]).unwrap();

        let store = PageStore::open(&path).unwrap();
        assert_eq!(store.page_count(), 2);
    }
}
