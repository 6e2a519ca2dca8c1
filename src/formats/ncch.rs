//! NCCH - executable (CXI) or data (CFA) partition.
//!
//! ## Header (0x200 bytes)
//! ```text
//! [0x000] RSA-2048 signature over [0x100..0x200]      (0x100 bytes)
//! [0x100] Magic "NCCH"                                (4 bytes)
//! [0x104] ContentSize (media units)                   (u32 LE)
//! [0x108] PartitionId                                 (u64 LE)
//! [0x110] MakerCode                                   (2 bytes)
//! [0x112] Version                                     (u16 LE)
//! [0x114] Seed check                                  (u32)
//! [0x118] ProgramId                                   (u64 LE)
//! [0x120] Reserved                                    (0x10 bytes)
//! [0x130] Logo region hash                            (0x20 bytes)
//! [0x150] ProductCode                                 (0x10 bytes)
//! [0x160] Extended header hash                        (0x20 bytes)
//! [0x180] Extended header size                        (u32 LE)
//! [0x184] Reserved                                    (u32)
//! [0x188] Flags                                       (8 bytes)
//! [0x190] Plain region   offset, size                 (media units)
//! [0x198] Logo region    offset, size                 (media units)
//! [0x1A0] ExeFS          offset, size, hash region    (media units) + reserved
//! [0x1B0] RomFS          offset, size, hash region    (media units) + reserved
//! [0x1C0] ExeFS superblock hash                       (0x20 bytes)
//! [0x1E0] RomFS superblock hash                       (0x20 bytes)
//! ```
//!
//! ## Flags
//! | Index | Meaning |
//! |-------|---------|
//! | 3 | Security version, selects the secondary keyslot |
//! | 4 | Platform (1 = CTR, 2 = New 3DS) |
//! | 5 | Content type (bit 0 data, bit 1 executable) |
//! | 6 | Media unit size, `0x200 << n` |
//! | 7 | Bit 0 fixed key, bit 1 no RomFS mount, bit 2 no crypto, bit 5 seed crypto |
//!
//! ## Encryption
//! Every section is AES-128-CTR. The extended header, the ExeFS header and
//! the `icon` and `banner` ExeFS sections use the primary key (slot 0x2C);
//! the other ExeFS sections and the RomFS use the secondary key.
//!
//! Counter, version 0 and 2: partition id big-endian, then the section
//! number (1 exheader, 2 ExeFS, 3 RomFS), then zeros. Version 1: partition
//! id little-endian, zeros, then the section's byte offset big-endian in
//! the last four bytes.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use aes::Aes128;
use tracing::{debug, warn};

use super::Options;
use super::exefs::{self, ExeFs};
use super::ivfc::Ivfc;
use super::romfs::RomFs;
use crate::crypto::{Ctr, Key128, SHA256_SIZE, sha256};
use crate::keys::{KeySet, KeySlot};
use crate::storage::{CtrRegion, DecryptStorage, SharedStorage, StorageReader, SubStorage, read_vec};
use crate::utils::{align_up, bytesa, end_of, le_u16, le_u32, le_u64, magic, padded_ascii};
use crate::vfs::VirtualFileSystem;
use crate::{Error, Result};

/// Size of the NCCH header.
pub const HEADER_SIZE: u64 = 0x200;
/// Offset of the extended header.
pub const EXHEADER_OFFSET: u64 = 0x200;
/// Encrypted extent of the extended header (exheader + access descriptor).
pub const EXHEADER_CRYPT_SIZE: u64 = 0x800;

const FLAG_SECURITY_VERSION: usize = 3;
const FLAG_PLATFORM: usize = 4;
const FLAG_CONTENT_TYPE: usize = 5;
const FLAG_UNIT_SIZE: usize = 6;
const FLAG_OTHER: usize = 7;

const OTHER_FIXED_KEY: u8 = 0x01;
const OTHER_NO_MOUNT_ROMFS: u8 = 0x02;
const OTHER_NO_CRYPTO: u8 = 0x04;
const OTHER_SEED: u8 = 0x20;

/// Sections with their own counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NcchSection {
    ExHeader = 1,
    ExeFs = 2,
    RomFs = 3,
}

/// A byte range inside the partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

/// Decoded NCCH header. Region offsets and sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcchHeader {
    pub content_size: u64,
    pub partition_id: u64,
    pub maker_code: String,
    pub version: u16,
    pub program_id: u64,
    pub logo_hash: [u8; SHA256_SIZE],
    pub product_code: String,
    pub exheader_hash: [u8; SHA256_SIZE],
    pub exheader_size: u32,
    pub flags: [u8; 8],
    pub plain: Region,
    pub logo: Region,
    pub exefs: Region,
    pub exefs_hash_size: u64,
    pub romfs: Region,
    pub romfs_hash_size: u64,
    pub exefs_superblock_hash: [u8; SHA256_SIZE],
    pub romfs_superblock_hash: [u8; SHA256_SIZE],
}

impl NcchHeader {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        r.seek(SeekFrom::Start(0x100))?;
        magic(r, b"NCCH")?;
        let content_size = le_u32(r)?;
        let partition_id = le_u64(r)?;
        let maker_code = padded_ascii(&bytesa::<2>(r)?);
        let version = le_u16(r)?;
        let _seed_check = le_u32(r)?;
        let program_id = le_u64(r)?;
        let _reserved = bytesa::<0x10>(r)?;
        let logo_hash = bytesa(r)?;
        let product_code = padded_ascii(&bytesa::<0x10>(r)?);
        let exheader_hash = bytesa(r)?;
        let exheader_size = le_u32(r)?;
        let _reserved = le_u32(r)?;
        let flags = bytesa::<8>(r)?;

        if !matches!(version, 0..=2) {
            return Err(Error::UnsupportedVersion(version as u8));
        }
        if flags[FLAG_UNIT_SIZE] > 16 {
            return Err(Error::Parse("NCCH media unit size out of range"));
        }
        let unit = 0x200u64 << flags[FLAG_UNIT_SIZE];
        let region = |r: &mut R| -> Result<Region> {
            Ok(Region {
                offset: le_u32(r)? as u64 * unit,
                size: le_u32(r)? as u64 * unit,
            })
        };
        let plain = region(r)?;
        let logo = region(r)?;
        let exefs = region(r)?;
        let exefs_hash_size = le_u32(r)? as u64 * unit;
        let _reserved = le_u32(r)?;
        let romfs = region(r)?;
        let romfs_hash_size = le_u32(r)? as u64 * unit;
        let _reserved = le_u32(r)?;
        let exefs_superblock_hash = bytesa(r)?;
        let romfs_superblock_hash = bytesa(r)?;

        Ok(Self {
            content_size: content_size as u64 * unit,
            partition_id,
            maker_code,
            version,
            program_id,
            logo_hash,
            product_code,
            exheader_hash,
            exheader_size,
            flags,
            plain,
            logo,
            exefs,
            exefs_hash_size,
            romfs,
            romfs_hash_size,
            exefs_superblock_hash,
            romfs_superblock_hash,
        })
    }

    pub fn media_unit(&self) -> u64 {
        0x200 << self.flags[FLAG_UNIT_SIZE]
    }

    pub fn security_version(&self) -> u8 {
        self.flags[FLAG_SECURITY_VERSION]
    }

    pub fn platform(&self) -> u8 {
        self.flags[FLAG_PLATFORM]
    }

    /// CXI rather than CFA.
    pub fn is_executable(&self) -> bool {
        self.flags[FLAG_CONTENT_TYPE] & 0x02 != 0
    }

    pub fn fixed_key(&self) -> bool {
        self.flags[FLAG_OTHER] & OTHER_FIXED_KEY != 0
    }

    pub fn no_mount_romfs(&self) -> bool {
        self.flags[FLAG_OTHER] & OTHER_NO_MOUNT_ROMFS != 0
    }

    pub fn no_crypto(&self) -> bool {
        self.flags[FLAG_OTHER] & OTHER_NO_CRYPTO != 0
    }

    pub fn seed_crypto(&self) -> bool {
        self.flags[FLAG_OTHER] & OTHER_SEED != 0
    }

    /// System titles have bit 4 set in the category half of the program id.
    pub fn is_system(&self) -> bool {
        (self.program_id >> 32) & 0x10 != 0
    }

    /// Initial CTR counter of `section`.
    pub fn counter(&self, section: NcchSection) -> [u8; 16] {
        let mut ctr = [0u8; 16];
        if self.version == 1 {
            let offset = match section {
                NcchSection::ExHeader => EXHEADER_OFFSET,
                NcchSection::ExeFs => self.exefs.offset,
                NcchSection::RomFs => self.romfs.offset,
            };
            ctr[..8].copy_from_slice(&self.partition_id.to_le_bytes());
            ctr[12..].copy_from_slice(&(offset as u32).to_be_bytes());
        } else {
            ctr[..8].copy_from_slice(&self.partition_id.to_be_bytes());
            ctr[8] = section as u8;
        }
        ctr
    }

    /// Primary and secondary keys for this partition.
    pub fn keys(&self, keys: &KeySet) -> Result<(Key128, Key128)> {
        if self.fixed_key() {
            let key = if self.is_system() {
                *keys
                    .fixed_system_key
                    .as_ref()
                    .ok_or_else(|| Error::MissingKey("fixed_system_key".to_string()))?
            } else {
                [0u8; 16]
            };
            return Ok((key, key));
        }
        let secondary = KeySlot::for_security_version(self.security_version())?;
        Ok((
            *keys.ncch_key(self.partition_id, KeySlot::Slot0x2C)?,
            *keys.ncch_key(self.partition_id, secondary)?,
        ))
    }

    fn validate(&self, len: u64) -> Result<()> {
        for region in [self.plain, self.logo, self.exefs, self.romfs] {
            if region.size > 0 && (region.offset < HEADER_SIZE || end_of(region.offset, region.size)? > len) {
                return Err(Error::InvalidRange);
            }
        }
        if self.exefs_hash_size > self.exefs.size || self.romfs_hash_size > self.romfs.size {
            return Err(Error::Parse("NCCH hash region exceeds its section"));
        }
        if self.exheader_size as u64 > EXHEADER_CRYPT_SIZE {
            return Err(Error::Parse("NCCH exheader size exceeds its region"));
        }
        if self.exheader_size > 0 && end_of(EXHEADER_OFFSET, EXHEADER_CRYPT_SIZE)? > len {
            return Err(Error::InvalidRange);
        }
        Ok(())
    }
}

/// An opened NCCH partition.
#[derive(Debug)]
pub struct Ncch {
    pub header: NcchHeader,
    /// The partition with every keyed region decrypted.
    storage: SharedStorage,
    options: Options,
}

impl Ncch {
    /// Parse the header of the NCCH in `base`, lay out its decryption, and
    /// check the exheader and superblock hashes if `options.verify` is set.
    pub fn open(base: SharedStorage, keys: &KeySet, options: Options) -> Result<Self> {
        let header = NcchHeader::parse(&mut StorageReader::new(base.clone()))?;
        header.validate(base.len())?;
        debug!(
            version = header.version,
            product = %header.product_code,
            exefs = header.exefs.size,
            romfs = header.romfs.size,
            "parsed NCCH header for partition {:016x}",
            header.partition_id
        );

        let encrypted = !header.no_crypto();
        let storage: SharedStorage = if encrypted && options.decrypt {
            if header.seed_crypto() {
                return Err(Error::Parse("seed-keyed NCCH content is not supported"));
            }
            Arc::new(Self::decrypting(&base, &header, keys)?)
        } else {
            base
        };

        let ncch = Self {
            header,
            storage,
            options,
        };
        if options.verify && (!encrypted || options.decrypt) {
            ncch.verify_superblocks()?;
        }
        Ok(ncch)
    }

    /// Bind every keyed region of the partition.
    fn decrypting(base: &SharedStorage, header: &NcchHeader, keys: &KeySet) -> Result<DecryptStorage> {
        let (primary, secondary) = header.keys(keys)?;
        let mut storage = DecryptStorage::new(base.clone());

        if header.exheader_size > 0 {
            let ctr = header.counter(NcchSection::ExHeader);
            storage.bind(
                EXHEADER_OFFSET,
                EXHEADER_CRYPT_SIZE,
                CtrRegion::<Aes128>::new(&primary, &ctr)?,
            )?;
        }

        if header.exefs.size > 0 {
            let ctr = header.counter(NcchSection::ExeFs);
            let mut raw = read_vec(&**base, header.exefs.offset, exefs::HEADER_SIZE as usize)?;
            Ctr::<Aes128>::new(&primary, &ctr)?.apply_keystream(&mut raw, 0);
            let layout = ExeFs::from_header(&raw)?;
            for (start, end, use_secondary) in exefs_key_spans(&layout, header.exefs.size)? {
                let key = if use_secondary { &secondary } else { &primary };
                storage.bind(
                    header.exefs.offset + start,
                    end - start,
                    CtrRegion::<Aes128>::new(key, &ctr)?.with_block_offset(start / 16),
                )?;
            }
        }

        if header.romfs.size > 0 {
            let ctr = header.counter(NcchSection::RomFs);
            storage.bind(
                header.romfs.offset,
                header.romfs.size,
                CtrRegion::<Aes128>::new(&secondary, &ctr)?,
            )?;
        }
        Ok(storage)
    }

    fn verify_superblocks(&self) -> Result<()> {
        let h = &self.header;
        let checks = [
            ("ncch exheader", EXHEADER_OFFSET, h.exheader_size as u64, h.exheader_hash),
            ("ncch exefs superblock", h.exefs.offset, h.exefs_hash_size, h.exefs_superblock_hash),
            ("ncch romfs superblock", h.romfs.offset, h.romfs_hash_size, h.romfs_superblock_hash),
        ];
        for (what, offset, size, expected) in checks {
            if size == 0 {
                continue;
            }
            let data = read_vec(&*self.storage, offset, size as usize)?;
            if sha256(&data) != expected {
                warn!(what, "NCCH region hash mismatch");
                return Err(Error::Integrity { what, index: 0 });
            }
        }
        Ok(())
    }

    /// The partition, decrypted where keys were bound.
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Decrypted extended header bytes, if the partition has one.
    pub fn exheader(&self) -> Result<Option<Vec<u8>>> {
        if self.header.exheader_size == 0 {
            return Ok(None);
        }
        read_vec(&*self.storage, EXHEADER_OFFSET, self.header.exheader_size as usize).map(Some)
    }

    /// Mount the ExeFS.
    pub fn exefs(&self) -> Result<VirtualFileSystem> {
        let exefs = self.section(self.header.exefs, "exefs")?;
        ExeFs::parse(&exefs)?.mount(&exefs, self.options.verify)
    }

    /// Mount the RomFS, through its IVFC hash tree when verifying.
    pub fn romfs(&self) -> Result<VirtualFileSystem> {
        if self.header.no_mount_romfs() {
            return Err(Error::NotFound("romfs".to_string()));
        }
        let ivfc_storage = self.section(self.header.romfs, "romfs")?;
        let ivfc = Ivfc::parse(&ivfc_storage)?;
        let content = ivfc.open_content(&ivfc_storage, self.options.verify)?;
        RomFs::parse(&content)?.mount(&content)
    }

    fn section(&self, region: Region, name: &str) -> Result<SharedStorage> {
        if region.size == 0 {
            return Err(Error::NotFound(name.to_string()));
        }
        SubStorage::shared(&self.storage, region.offset, region.size)
    }
}

/// Split the ExeFS into `(start, end, secondary key)` spans relative to the
/// ExeFS start, covering it completely.
fn exefs_key_spans(layout: &ExeFs, size: u64) -> Result<Vec<(u64, u64, bool)>> {
    let mut spans = Vec::new();
    let mut cursor = 0u64;
    let mut push = |start: u64, end: u64, secondary: bool, cursor: &mut u64| {
        let end = end.min(size);
        if start < *cursor || start >= end {
            return;
        }
        spans.push((start, end, secondary));
        *cursor = end;
    };
    push(0, exefs::HEADER_SIZE, false, &mut cursor);
    for section in &layout.sections {
        let start = ExeFs::data_offset(section);
        let end = end_of(start, align_up(section.size, exefs::SECTION_ALIGN)?)?;
        let secondary = !matches!(section.name.as_str(), "icon" | "banner");
        if start > cursor {
            let gap_start = cursor;
            push(gap_start, start, false, &mut cursor);
        }
        push(start, end, secondary, &mut cursor);
    }
    if cursor < size {
        let tail = cursor;
        push(tail, size, false, &mut cursor);
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: u16) -> NcchHeader {
        let mut h = NcchHeader::parse(&mut std::io::Cursor::new(blank_header())).unwrap();
        h.version = version;
        h.partition_id = 0x0004_0000_0012_3400;
        h.exefs = Region {
            offset: 0x1000,
            size: 0x800,
        };
        h.romfs = Region {
            offset: 0x2000,
            size: 0x1000,
        };
        h
    }

    fn blank_header() -> Vec<u8> {
        let mut raw = vec![0u8; 0x200];
        raw[0x100..0x104].copy_from_slice(b"NCCH");
        raw
    }

    #[test]
    fn counters_by_version() {
        let v0 = header(0);
        assert_eq!(
            v0.counter(NcchSection::RomFs),
            [0x00, 0x04, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00, 3, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(header(2).counter(NcchSection::ExHeader)[8], 1);

        let v1 = header(1);
        assert_eq!(
            v1.counter(NcchSection::ExeFs),
            [0x00, 0x34, 0x12, 0x00, 0x00, 0x00, 0x04, 0x00, 0, 0, 0, 0, 0x00, 0x00, 0x10, 0x00]
        );
        assert_eq!(&v1.counter(NcchSection::ExHeader)[12..], &[0, 0, 0x02, 0x00]);
    }

    #[test]
    fn exefs_spans_cover_everything_and_key_icon_with_primary() {
        let mut raw = vec![0u8; 0x200];
        raw[..5].copy_from_slice(b".code");
        raw[12..16].copy_from_slice(&0x300u32.to_le_bytes());
        raw[0x10..0x14].copy_from_slice(b"icon");
        raw[0x18..0x1C].copy_from_slice(&0x400u32.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&0x100u32.to_le_bytes());
        let layout = ExeFs::from_header(&raw).unwrap();
        let spans = exefs_key_spans(&layout, 0xA00).unwrap();
        assert_eq!(
            spans,
            [(0, 0x200, false), (0x200, 0x600, true), (0x600, 0x800, false), (0x800, 0xA00, false)]
        );
    }

    #[test]
    fn fixed_key_needs_system_key_only_for_system_titles() {
        let mut h = header(0);
        h.flags[FLAG_OTHER] = OTHER_FIXED_KEY;
        let keys = KeySet::new();
        assert_eq!(h.keys(&keys).unwrap(), ([0; 16], [0; 16]));
        h.program_id = 0x0004_0010_0000_1000;
        assert!(matches!(h.keys(&keys), Err(Error::MissingKey(_))));
    }
}
