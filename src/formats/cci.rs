//! CCI (NCSD) - game card image.
//!
//! ## Header (0x200 bytes)
//! ```text
//! [0x000] RSA-2048 signature over [0x100..0x200]   (0x100 bytes)
//! [0x100] Magic "NCSD"                             (4 bytes)
//! [0x104] ImageSize (media units)                  (u32 LE)
//! [0x108] MediaId                                  (u64 LE)
//! [0x110] Partition fs types                       (8 bytes)
//! [0x118] Partition crypt types                    (8 bytes)
//! [0x120] Partition table  8 × {Offset, Size}      (media units, u32 LE)
//! [0x160] Extended header hash                     (0x20 bytes)
//! [0x180] Additional header size                   (u32 LE)
//! [0x184] Sector zero offset                       (u32 LE)
//! [0x188] Partition flags                          (8 bytes)
//! [0x190] Partition ids                            (8 × u64 LE)
//! ```
//!
//! ## Partition flags
//! | Index | Meaning | Accepted |
//! |-------|---------|----------|
//! | 4 | Media platform | 1 (CTR) |
//! | 5 | Media type | 1 (card 1), 2 (card 2) |
//! | 6 | Media unit size, `0x200 << n` | 0 |
//!
//! Partition 0 is the executable content; 1 the manual, 2 the download
//! play child, 6 and 7 the update data.

use std::io::{Seek, SeekFrom};

use tracing::debug;

use crate::storage::{SharedStorage, StorageReader, SubStorage};
use crate::utils::{bytesa, end_of, le_u32, le_u64, magic};
use crate::vfs::VirtualFileSystem;
use crate::{Error, Result};

/// Number of partition slots.
pub const PARTITION_NUM: usize = 8;
/// Size of a media unit.
pub const MEDIA_UNIT: u64 = 0x200;
/// Size of the NCSD header.
pub const HEADER_SIZE: u64 = 0x200;

const FLAG_PLATFORM: usize = 4;
const FLAG_MEDIA_TYPE: usize = 5;
const FLAG_UNIT_SIZE: usize = 6;

/// One non-empty partition, with byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CciPartition {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    pub fs_type: u8,
    pub crypt_type: u8,
    pub title_id: u64,
}

impl CciPartition {
    /// File name in the mounted snapshot.
    pub fn file_name(&self) -> String {
        format!("content{}.{:016x}.ncch", self.index, self.title_id)
    }
}

/// Parsed NCSD header.
#[derive(Debug, Clone)]
pub struct Cci {
    pub media_id: u64,
    /// Declared image size in bytes.
    pub image_size: u64,
    pub flags: [u8; 8],
    pub partitions: Vec<CciPartition>,
}

impl Cci {
    /// Parse and validate the header of the card image in `storage`.
    pub fn parse(storage: &SharedStorage) -> Result<Self> {
        let mut r = StorageReader::new(storage.clone());
        r.seek(SeekFrom::Start(0x100))?;
        magic(&mut r, b"NCSD")?;
        let image_size = le_u32(&mut r)? as u64 * MEDIA_UNIT;
        let media_id = le_u64(&mut r)?;
        let fs_types = bytesa::<PARTITION_NUM>(&mut r)?;
        let crypt_types = bytesa::<PARTITION_NUM>(&mut r)?;
        let mut table = [(0u64, 0u64); PARTITION_NUM];
        for entry in &mut table {
            *entry = (
                le_u32(&mut r)? as u64 * MEDIA_UNIT,
                le_u32(&mut r)? as u64 * MEDIA_UNIT,
            );
        }
        r.seek(SeekFrom::Start(0x188))?;
        let flags = bytesa::<8>(&mut r)?;
        let mut ids = [0u64; PARTITION_NUM];
        for id in &mut ids {
            *id = le_u64(&mut r)?;
        }

        if flags[FLAG_PLATFORM] != 1 {
            return Err(Error::Parse("CCI media platform is not CTR"));
        }
        if !matches!(flags[FLAG_MEDIA_TYPE], 1 | 2) {
            return Err(Error::Parse("CCI media type is not a game card"));
        }
        if flags[FLAG_UNIT_SIZE] != 0 {
            return Err(Error::Parse("CCI media unit size is not 0x200"));
        }

        let mut partitions = Vec::new();
        for (index, &(offset, size)) in table.iter().enumerate() {
            if size == 0 {
                continue;
            }
            if offset < HEADER_SIZE || end_of(offset, size)? > storage.len() {
                return Err(Error::InvalidRange);
            }
            partitions.push(CciPartition {
                index,
                offset,
                size,
                fs_type: fs_types[index],
                crypt_type: crypt_types[index],
                title_id: ids[index],
            });
        }
        if partitions.first().is_none_or(|p| p.index != 0) {
            return Err(Error::Parse("CCI has no executable partition"));
        }
        let mut spans: Vec<_> = partitions.iter().map(|p| (p.offset, p.offset + p.size)).collect();
        spans.sort_unstable();
        if spans.windows(2).any(|w| w[0].1 > w[1].0) {
            return Err(Error::Parse("CCI partitions overlap"));
        }

        debug!(
            partitions = partitions.len(),
            image_size,
            "parsed NCSD header for media {media_id:016x}"
        );
        Ok(Self {
            media_id,
            image_size,
            flags,
            partitions,
        })
    }

    pub fn partition(&self, index: usize) -> Option<&CciPartition> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// Storage of one partition (an NCCH).
    pub fn open_partition(&self, storage: &SharedStorage, index: usize) -> Result<SharedStorage> {
        let p = self
            .partition(index)
            .ok_or_else(|| Error::NotFound(format!("partition {index}")))?;
        SubStorage::shared(storage, p.offset, p.size)
    }

    /// One root file per partition.
    pub fn mount(&self, storage: &SharedStorage) -> Result<VirtualFileSystem> {
        let mut vfs = VirtualFileSystem::new();
        for p in &self.partitions {
            vfs.add_file("/", &p.file_name(), storage, p.offset, p.size)?;
        }
        debug!(files = vfs.file_count(), "mounted CCI");
        Ok(vfs)
    }
}
