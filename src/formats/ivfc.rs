//! IVFC - the hash tree wrapped around a RomFS.
//!
//! ## Header (0x5C bytes)
//! ```text
//! [0x00] Magic "IVFC"                          (4 bytes)
//! [0x04] Id (0x10000 for RomFS)                (u32 LE)
//! [0x08] MasterHashSize                        (u32 LE)
//! [0x0C] Level 1 {LogicalOffset u64, Size u64, BlockSizeLog2 u32, Reserved u32}
//! [0x24] Level 2 (same layout)
//! [0x3C] Level 3 (same layout)
//! [0x54] HeaderSize (0x5C)                     (u32 LE)
//! [0x58] Reserved                              (u32)
//! [0x60] Master hash                           (MasterHashSize bytes)
//! ```
//!
//! ## Physical layout
//! The logical offsets are not where the levels live. Level 3 (the RomFS
//! itself) comes first, right after the master hash, then level 1, then
//! level 2; each starts on a multiple of its own block size.
//!
//! ```text
//! 0x0000  header + master hash
//! align(0x60 + MasterHashSize, lv3 block)   level 3
//! align(lv3 end, lv1 block)                 level 1
//! align(lv1 end, lv2 block)                 level 2
//! ```
//!
//! The master hash covers level 1, level 1 covers level 2, level 2 covers
//! level 3.

use tracing::debug;

use crate::crypto::SHA256_SIZE;
use crate::storage::verify::MAX_BLOCK_SIZE_LOG2;
use crate::storage::{HashTree, HashTreeLevel, SharedStorage, StorageReader, SubStorage};
use crate::utils::{align_up, bytesv, end_of, le_u32, le_u64, magic};
use crate::{Error, Result};

/// IVFC id used by RomFS.
pub const ROMFS_ID: u32 = 0x10000;
/// Size of the IVFC header.
pub const HEADER_SIZE: u32 = 0x5C;
/// Offset of the master hash.
pub const MASTER_HASH_OFFSET: u64 = 0x60;

/// One level as declared in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfcLevel {
    pub logical_offset: u64,
    pub size: u64,
    pub block_size_log2: u32,
}

/// Parsed IVFC header plus master hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ivfc {
    pub master_hash: Vec<u8>,
    /// Levels 1 to 3.
    pub levels: [IvfcLevel; 3],
}

impl Ivfc {
    /// Parse the IVFC header at the start of `storage`.
    pub fn parse(storage: &SharedStorage) -> Result<Self> {
        let mut r = StorageReader::new(storage.clone());
        magic(&mut r, b"IVFC")?;
        if le_u32(&mut r)? != ROMFS_ID {
            return Err(Error::Parse("IVFC id is not the RomFS id"));
        }
        let master_hash_size = le_u32(&mut r)?;
        let mut levels = [IvfcLevel {
            logical_offset: 0,
            size: 0,
            block_size_log2: 0,
        }; 3];
        for level in &mut levels {
            level.logical_offset = le_u64(&mut r)?;
            level.size = le_u64(&mut r)?;
            level.block_size_log2 = le_u32(&mut r)?;
            let _reserved = le_u32(&mut r)?;
        }
        if le_u32(&mut r)? != HEADER_SIZE {
            return Err(Error::Parse("IVFC header size is not 0x5C"));
        }
        if master_hash_size == 0 || master_hash_size as usize % SHA256_SIZE != 0 {
            return Err(Error::Parse("IVFC master hash size is not a hash multiple"));
        }
        if levels.iter().any(|l| !(1..=MAX_BLOCK_SIZE_LOG2).contains(&l.block_size_log2)) {
            return Err(Error::Parse("IVFC block size out of range"));
        }

        let _reserved = le_u32(&mut r)?;
        let master_hash = bytesv(&mut r, master_hash_size as usize)?;
        debug!(
            master_hash_size,
            lv1 = levels[0].size,
            lv2 = levels[1].size,
            lv3 = levels[2].size,
            "parsed IVFC header"
        );
        Ok(Self {
            master_hash,
            levels,
        })
    }

    /// Physical offsets of levels 1, 2 and 3 inside the IVFC storage.
    pub fn physical_offsets(&self) -> Result<[u64; 3]> {
        let [lv1, lv2, lv3] = &self.levels;
        let block = |l: &IvfcLevel| 1u64 << l.block_size_log2;
        let lv3_at = align_up(
            MASTER_HASH_OFFSET + self.master_hash.len() as u64,
            block(lv3),
        )?;
        let lv1_at = align_up(end_of(lv3_at, lv3.size)?, block(lv1))?;
        let lv2_at = align_up(end_of(lv1_at, lv1.size)?, block(lv2))?;
        Ok([lv1_at, lv2_at, lv3_at])
    }

    /// The hash tree, master hash first, RomFS last.
    pub fn hash_tree(&self) -> Result<HashTree> {
        let offsets = self.physical_offsets()?;
        Ok(HashTree {
            master_hash: self.master_hash.clone(),
            levels: self
                .levels
                .iter()
                .zip(offsets)
                .map(|(l, offset)| HashTreeLevel {
                    offset,
                    size: l.size,
                    block_size_log2: l.block_size_log2,
                })
                .collect(),
        })
    }

    /// Storage of the RomFS (level 3), verified through the hash tree when
    /// `verify` is set and read raw otherwise.
    pub fn open_content(&self, storage: &SharedStorage, verify: bool) -> Result<SharedStorage> {
        if verify {
            return self.hash_tree()?.open(storage);
        }
        let [_, _, lv3_at] = self.physical_offsets()?;
        SubStorage::shared(storage, lv3_at, self.levels[2].size)
    }
}
