//! TMD - signed title metadata listing a title's contents.
//!
//! All fields are big-endian unless noted.
//!
//! ## Header (0xC4 bytes after the signature block)
//! ```text
//! [0x00] Issuer                       (0x40 bytes)
//! [0x40] Version, CA CRL, signer CRL, reserved   (4 × u8)
//! [0x44] System version               (u64)
//! [0x4C] Title id                     (u64)
//! [0x54] Title type                   (u32)
//! [0x58] Group id                     (u16)
//! [0x5A] Custom data                  (13 bytes, see below)
//! [0x67] Reserved                     (0x31 bytes)
//! [0x98] Access rights                (u32)
//! [0x9C] Title version                (u16)
//! [0x9E] Content count                (u16)
//! [0xA0] Boot content                 (u16)
//! [0xA2] Padding                      (u16)
//! [0xA4] SHA-256 of the info records  (0x20 bytes)
//! ```
//!
//! Then 64 content info records of 0x24 bytes (`{index offset u16,
//! command count u16, SHA-256}`), then `ContentCount` chunk records:
//!
//! ```text
//! [0x00] Content id     (u32)
//! [0x04] Content index  (u16)
//! [0x06] Content type   (u16, bit 0 = encrypted)
//! [0x08] Content size   (u64)
//! [0x10] SHA-256        (0x20 bytes)
//! ```
//!
//! ## Custom data
//! The same 13 bytes mean different things per platform, both little-endian:
//!
//! | Offset | CTR | TWL |
//! |--------|-----|-----|
//! | 0x0 | Save data size (u32) | Public save data size (u32) |
//! | 0x4 | - | Private save data size (u32) |
//! | 0xC | - | Flag (u8) |

use std::io::Read;

use tracing::warn;

use super::skip_signature;
use crate::crypto::{SHA256_SIZE, sha256};
use crate::utils::{be_u16, be_u32, be_u64, bytesa, bytesv, le_u32_at, padded_ascii, u8};
use crate::{Error, Result};

/// Number of content info records.
pub const INFO_RECORD_NUM: usize = 64;
const INFO_RECORD_SIZE: usize = 0x24;
const CHUNK_SIZE: usize = 0x30;
const CUSTOM_DATA_SIZE: usize = 13;

/// Content type bit: content is AES-128-CBC encrypted with the title key.
pub const CONTENT_ENCRYPTED: u16 = 0x0001;

/// One content chunk record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    pub id: u32,
    pub index: u16,
    pub content_type: u16,
    pub size: u64,
    pub hash: [u8; SHA256_SIZE],
}

impl ContentChunk {
    pub fn is_encrypted(&self) -> bool {
        self.content_type & CONTENT_ENCRYPTED != 0
    }
}

/// One content info record: a run of chunk records and their hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfoRecord {
    pub index_offset: u16,
    pub command_count: u16,
    pub hash: [u8; SHA256_SIZE],
}

/// Custom data read as a CTR title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrCustomData {
    pub save_data_size: u32,
}

/// Custom data read as a TWL (DSi) title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwlCustomData {
    pub public_save_data_size: u32,
    pub private_save_data_size: u32,
    pub flag: u8,
}

/// Custom data decoded for the title's platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleCustomData {
    Ctr(CtrCustomData),
    Twl(TwlCustomData),
    /// Neither platform; use the raw bytes.
    Unknown,
}

/// Decoded TMD.
#[derive(Debug, Clone)]
pub struct Tmd {
    pub signature_type: u32,
    pub issuer: String,
    pub version: u8,
    pub system_version: u64,
    pub title_id: u64,
    pub title_type: u32,
    pub group_id: u16,
    pub custom_data: [u8; CUSTOM_DATA_SIZE],
    pub access_rights: u32,
    pub title_version: u16,
    pub boot_content: u16,
    pub info_records_hash: [u8; SHA256_SIZE],
    pub info_records: Vec<ContentInfoRecord>,
    pub chunks: Vec<ContentChunk>,
    raw_info_records: Vec<u8>,
    raw_chunks: Vec<u8>,
}

impl Tmd {
    pub fn parse<R: Read>(r: &mut R) -> Result<Self> {
        let signature_type = skip_signature(r)?;
        let issuer = padded_ascii(&bytesa::<0x40>(r)?);
        let version = u8(r)?;
        let _crl_versions = bytesa::<3>(r)?;
        let system_version = be_u64(r)?;
        let title_id = be_u64(r)?;
        let title_type = be_u32(r)?;
        let group_id = be_u16(r)?;
        let custom_data = bytesa::<CUSTOM_DATA_SIZE>(r)?;
        let _reserved = bytesv(r, 0x31)?;
        let access_rights = be_u32(r)?;
        let title_version = be_u16(r)?;
        let content_count = be_u16(r)?;
        let boot_content = be_u16(r)?;
        let _padding = be_u16(r)?;
        let info_records_hash = bytesa::<SHA256_SIZE>(r)?;

        let raw_info_records = bytesv(r, INFO_RECORD_NUM * INFO_RECORD_SIZE)?;
        let info_records = raw_info_records
            .chunks_exact(INFO_RECORD_SIZE)
            .map(|rec| {
                let mut hash = [0u8; SHA256_SIZE];
                hash.copy_from_slice(&rec[4..]);
                ContentInfoRecord {
                    index_offset: u16::from_be_bytes([rec[0], rec[1]]),
                    command_count: u16::from_be_bytes([rec[2], rec[3]]),
                    hash,
                }
            })
            .collect();

        let raw_chunks = bytesv(r, content_count as usize * CHUNK_SIZE)?;
        let chunks: Vec<ContentChunk> = raw_chunks
            .chunks_exact(CHUNK_SIZE)
            .map(|c| {
                let mut hash = [0u8; SHA256_SIZE];
                hash.copy_from_slice(&c[0x10..]);
                ContentChunk {
                    id: u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                    index: u16::from_be_bytes([c[4], c[5]]),
                    content_type: u16::from_be_bytes([c[6], c[7]]),
                    size: u64::from_be_bytes([c[8], c[9], c[10], c[11], c[12], c[13], c[14], c[15]]),
                    hash,
                }
            })
            .collect();

        let mut indices: Vec<u16> = chunks.iter().map(|c| c.index).collect();
        indices.sort_unstable();
        if indices.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Parse("duplicate TMD content index"));
        }

        Ok(Self {
            signature_type,
            issuer,
            version,
            system_version,
            title_id,
            title_type,
            group_id,
            custom_data,
            access_rights,
            title_version,
            boot_content,
            info_records_hash,
            info_records,
            chunks,
            raw_info_records,
            raw_chunks,
        })
    }

    pub fn content_count(&self) -> usize {
        self.chunks.len()
    }

    /// Platform half of the title id: 0x0004 for CTR, 0x0003 for TWL.
    pub fn platform(&self) -> u16 {
        (self.title_id >> 48) as u16
    }

    pub fn ctr_view(&self) -> CtrCustomData {
        CtrCustomData {
            save_data_size: self.custom_u32(0),
        }
    }

    pub fn twl_view(&self) -> TwlCustomData {
        TwlCustomData {
            public_save_data_size: self.custom_u32(0),
            private_save_data_size: self.custom_u32(4),
            flag: self.custom_data[0xC],
        }
    }

    /// Custom data interpreted for [`Tmd::platform`].
    pub fn custom(&self) -> TitleCustomData {
        match self.platform() {
            0x0004 => TitleCustomData::Ctr(self.ctr_view()),
            0x0003 => TitleCustomData::Twl(self.twl_view()),
            _ => TitleCustomData::Unknown,
        }
    }

    fn custom_u32(&self, offset: usize) -> u32 {
        le_u32_at(&self.custom_data, offset).unwrap_or(0)
    }

    /// Check the info record table against the header hash, and every chunk
    /// run against its info record.
    pub fn verify(&self) -> Result<()> {
        if sha256(&self.raw_info_records) != self.info_records_hash {
            warn!(title_id = self.title_id, "TMD info record hash mismatch");
            return Err(Error::Integrity {
                what: "tmd info records",
                index: 0,
            });
        }
        let mut covered = 0usize;
        for (i, rec) in self.info_records.iter().enumerate() {
            if rec.command_count == 0 {
                continue;
            }
            let start = rec.index_offset as usize * CHUNK_SIZE;
            let end = start + rec.command_count as usize * CHUNK_SIZE;
            let run = self
                .raw_chunks
                .get(start..end)
                .ok_or(Error::Parse("TMD info record covers missing chunks"))?;
            if sha256(run) != rec.hash {
                warn!(record = i, "TMD chunk records hash mismatch");
                return Err(Error::Integrity {
                    what: "tmd chunk records",
                    index: i as u64,
                });
            }
            covered += rec.command_count as usize;
        }
        if covered < self.chunks.len() {
            return Err(Error::Parse("TMD chunk records not covered by an info record"));
        }
        Ok(())
    }
}
