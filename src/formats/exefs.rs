//! ExeFS - the flat executable file system of an NCCH.
//!
//! ## Header (0x200 bytes)
//! ```text
//! [0x000] File headers     10 × {Name [8], Offset u32 LE, Size u32 LE}
//! [0x0A0] Reserved         (0x20 bytes)
//! [0x0C0] File hashes      10 × SHA-256, in reverse order
//! ```
//!
//! Section data starts right after the header. Offsets are relative to the
//! end of the header.
//!
//! ## Notes
//! * The hash of file header `i` is hash slot `FILE_NUM - 1 - i`.
//! * A slot with an empty name or a zero size is unused.
//! * Sections are packed in slot order, each starting at the previous end
//!   rounded up to 0x200.

use std::ops::Index;

use tracing::{debug, warn};

use crate::crypto::{SHA256_SIZE, sha256};
use crate::storage::{MemoryStorage, SharedStorage, check_range, read_vec};
use crate::utils::{align_up, le_u32_at, padded_ascii};
use crate::vfs::VirtualFileSystem;
use crate::{Error, Result};

/// Number of file slots in the header.
pub const FILE_NUM: usize = 10;
/// Size of the header; section data follows it.
pub const HEADER_SIZE: u64 = 0x200;
/// Sections start on this alignment.
pub const SECTION_ALIGN: u64 = 0x200;

const NAME_SIZE: usize = 8;
const FILE_HEADER_SIZE: usize = 0x10;
const HASH_TABLE_OFFSET: usize = 0xC0;

/// One populated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeFsSection {
    /// Slot index in the header.
    pub slot: usize,
    pub name: String,
    /// Offset after the header.
    pub offset: u64,
    pub size: u64,
    pub hash: [u8; SHA256_SIZE],
}

/// Parsed ExeFS header.
#[derive(Debug, Clone)]
pub struct ExeFs {
    pub sections: Vec<ExeFsSection>,
}

impl ExeFs {
    /// Decode an already loaded 0x200-byte header.
    pub fn from_header(header: &[u8]) -> Result<Self> {
        if header.len() < HEADER_SIZE as usize {
            return Err(Error::UnexpectedEof);
        }
        let mut sections = Vec::new();
        let mut next = 0u64;
        for slot in 0..FILE_NUM {
            let at = slot * FILE_HEADER_SIZE;
            let raw_name = &header[at..at + NAME_SIZE];
            let offset = le_u32_at(header, at + NAME_SIZE)? as u64;
            let size = le_u32_at(header, at + NAME_SIZE + 4)? as u64;
            if raw_name[0] == 0 || size == 0 {
                continue;
            }
            if offset != next {
                return Err(Error::Parse("ExeFS section is not packed after the previous one"));
            }
            next = align_up(offset + size, SECTION_ALIGN)?;

            let hash_at = HASH_TABLE_OFFSET + (FILE_NUM - 1 - slot) * SHA256_SIZE;
            let mut hash = [0u8; SHA256_SIZE];
            hash.copy_from_slice(&header[hash_at..hash_at + SHA256_SIZE]);
            sections.push(ExeFsSection {
                slot,
                name: padded_ascii(raw_name),
                offset,
                size,
                hash,
            });
        }
        let mut names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Parse("duplicate ExeFS section name"));
        }
        Ok(Self { sections })
    }

    /// Read and decode the header at the start of `storage`.
    pub fn parse(storage: &SharedStorage) -> Result<Self> {
        let exefs = Self::from_header(&read_vec(&**storage, 0, HEADER_SIZE as usize)?)?;
        debug!(sections = exefs.sections.len(), "parsed ExeFS header");
        Ok(exefs)
    }

    pub fn section(&self, name: &str) -> Option<&ExeFsSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Absolute offset of `section` inside the ExeFS storage.
    pub fn data_offset(section: &ExeFsSection) -> u64 {
        HEADER_SIZE + section.offset
    }

    /// Build the snapshot, one root file per section.
    ///
    /// With `verify`, every section is read whole, hashed and exposed from
    /// memory only if the hash matches. Without it, sections are lazy
    /// windows over `storage`.
    pub fn mount(&self, storage: &SharedStorage, verify: bool) -> Result<VirtualFileSystem> {
        let mut vfs = VirtualFileSystem::new();
        for section in &self.sections {
            let offset = Self::data_offset(section);
            check_range(storage.len(), offset, section.size)?;
            if !verify {
                vfs.add_file("/", &section.name, storage, offset, section.size)?;
                continue;
            }
            let data = read_vec(&**storage, offset, section.size as usize)?;
            if sha256(&data) != section.hash {
                warn!(slot = section.slot, name = %section.name, "ExeFS section hash mismatch");
                return Err(Error::Integrity {
                    what: "exefs section",
                    index: section.slot as u64,
                });
            }
            vfs.add_loaded_file("/", &section.name, MemoryStorage::shared(data))?;
        }
        debug!(files = vfs.file_count(), verify, "mounted ExeFS");
        Ok(vfs)
    }
}

impl Index<&str> for ExeFs {
    type Output = ExeFsSection;

    /// Index by section name.
    ///
    /// # Panics
    /// Panics if there is no such section.
    fn index(&self, index: &str) -> &Self::Output {
        self.section(index)
            .unwrap_or_else(|| panic!("no section '{index}' in ExeFS"))
    }
}
