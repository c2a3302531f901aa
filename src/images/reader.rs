// CRIU image file reader
use prost::Message;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::checkpoint::Pagemap;
use crate::error::{CritError, Result};
use crate::proto::{MmEntry, PagemapEntry, PagemapHead};

pub const IMG_COMMON_MAGIC: u32 = 0x54564319;
pub const MM_MAGIC: u32 = 0x57492820;
pub const PAGEMAP_MAGIC: u32 = 0x56084025;

/// Both magics plus nothing else
const IMG_HEADER_SIZE: usize = 8;

pub struct ImageDir {
    path: PathBuf,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(CritError::ImageNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(ImageDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot this one was taken incrementally against, if any.
    pub fn parent(&self) -> Result<Option<ImageDir>> {
        let parent = self.path.join("parent");
        if !parent.exists() {
            return Ok(None);
        }
        ImageDir::open(parent).map(Some)
    }

    pub fn pages_path(&self, pages_id: u32) -> PathBuf {
        self.path.join(format!("pages-{}.img", pages_id))
    }

    /// Read a whole image file and check its magic.
    ///
    /// CRIU image format:
    /// - 4 bytes: IMG_COMMON_MAGIC
    /// - 4 bytes: image type magic
    /// - entries of [4-byte little-endian size][protobuf]
    fn read_image_file(&self, filename: &str, magic: u32) -> Result<Vec<u8>> {
        let img_path = self.path.join(filename);
        let mut file = File::open(&img_path).map_err(|_| CritError::ImageNotFound {
            path: img_path.display().to_string(),
        })?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.len() < IMG_HEADER_SIZE {
            return Err(CritError::InvalidImage {
                reason: format!("{} is too small (< {} bytes)", filename, IMG_HEADER_SIZE),
            });
        }

        let common = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let kind = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        if common != IMG_COMMON_MAGIC || kind != magic {
            return Err(CritError::InvalidImage {
                reason: format!(
                    "{} has magic 0x{:08x}/0x{:08x}, expected 0x{:08x}/0x{:08x}",
                    filename, common, kind, IMG_COMMON_MAGIC, magic
                ),
            });
        }

        Ok(buffer)
    }

    /// Split the entry stream following the header into protobuf payloads.
    fn split_entries<'b>(buffer: &'b [u8], filename: &str) -> Result<Vec<&'b [u8]>> {
        let mut entries = Vec::new();
        let mut pos = IMG_HEADER_SIZE;

        while pos < buffer.len() {
            if pos + 4 > buffer.len() {
                return Err(CritError::InvalidImage {
                    reason: format!("{} truncated in entry size at offset {}", filename, pos),
                });
            }
            let size = u32::from_le_bytes([
                buffer[pos],
                buffer[pos + 1],
                buffer[pos + 2],
                buffer[pos + 3],
            ]) as usize;
            pos += 4;

            if pos + size > buffer.len() {
                return Err(CritError::InvalidImage {
                    reason: format!(
                        "{} truncated: entry at offset {} needs {} bytes, only {} available",
                        filename,
                        pos,
                        size,
                        buffer.len() - pos
                    ),
                });
            }

            entries.push(&buffer[pos..pos + size]);
            pos += size;
        }

        log::debug!("Parsed {} entries from {}", entries.len(), filename);
        Ok(entries)
    }

    /// Read memory map for a specific PID
    ///
    /// Returns `None` if the image holds no entry.
    pub fn read_mm(&self, pid: u32) -> Result<Option<MmEntry>> {
        let filename = format!("mm-{}.img", pid);
        let buffer = self.read_image_file(&filename, MM_MAGIC)?;
        let entries = Self::split_entries(&buffer, &filename)?;

        match entries.first() {
            Some(data) => {
                let mm = MmEntry::decode(*data).map_err(|e| CritError::InvalidImage {
                    reason: format!("Failed to decode mm: {}", e),
                })?;
                Ok(Some(mm))
            }
            None => Ok(None),
        }
    }

    /// Read pagemap for a specific PID
    ///
    /// The first entry is the PagemapHead, the rest are PagemapEntry records.
    /// Returns `None` if the image holds no head.
    pub fn read_pagemap(&self, pid: u32) -> Result<Option<Pagemap>> {
        let filename = format!("pagemap-{}.img", pid);
        let buffer = self.read_image_file(&filename, PAGEMAP_MAGIC)?;
        let entries = Self::split_entries(&buffer, &filename)?;

        let Some((head_data, rest)) = entries.split_first() else {
            return Ok(None);
        };

        let head = PagemapHead::decode(*head_data).map_err(|e| CritError::InvalidImage {
            reason: format!("Failed to decode PagemapHead: {}", e),
        })?;

        let mut pagemap_entries = Vec::with_capacity(rest.len());
        for (i, data) in rest.iter().enumerate() {
            let entry = PagemapEntry::decode(*data).map_err(|e| CritError::InvalidImage {
                reason: format!("Failed to decode PagemapEntry[{}]: {}", i, e),
            })?;
            pagemap_entries.push(entry);
        }

        Ok(Some(Pagemap {
            pages_id: head.pages_id,
            entries: pagemap_entries,
        }))
    }
}
