//! CIA - CTR importable archive.
//!
//! ## Header (0x2020 bytes)
//! ```text
//! [0x00] HeaderSize (0x2020)          (u32 LE)
//! [0x04] Type                         (u16 LE)
//! [0x06] Version                      (u16 LE)
//! [0x08] Certificate chain size       (u32 LE)
//! [0x0C] Ticket size                  (u32 LE)
//! [0x10] TMD size                     (u32 LE)
//! [0x14] Meta size                    (u32 LE)
//! [0x18] Content size                 (u64 LE)
//! [0x20] Content index bit array      (0x2000 bytes, MSB first)
//! ```
//!
//! ## Sections
//! Sizes are in bytes. Each section starts at the previous section's end
//! rounded up to 0x40:
//!
//! ```text
//! header | cert chain | ticket | TMD | contents | meta
//! ```
//!
//! Contents are stored back to back in TMD chunk order. A content whose
//! chunk type has bit 0 set is AES-128-CBC encrypted with the title key
//! and an IV of the big-endian content index followed by zeros.

use std::io::{Seek, SeekFrom};
use std::sync::Arc;

use aes::Aes128;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::Options;
use super::ticket::Ticket;
use super::tmd::{ContentChunk, Tmd};
use crate::keys::KeySet;
use crate::storage::{
    CbcRegion, DecryptStorage, SharedStorage, Storage, StorageReader, SubStorage,
};
use crate::utils::{align_up, bytesv, end_of, le_u16, le_u32, le_u64};
use crate::vfs::VirtualFileSystem;
use crate::{Error, Result};

/// Size of the CIA header.
pub const HEADER_SIZE: u32 = 0x2020;
/// Section alignment.
pub const ALIGN: u64 = 0x40;
/// Size of the content index bit array.
pub const INDEX_BITS_SIZE: usize = 0x2000;

const HASH_CHUNK: usize = 0x10_0000;

/// Offset and size of one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub offset: u64,
    pub size: u64,
}

/// One content in the content section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiaContent {
    pub chunk: ContentChunk,
    /// Absolute offset in the CIA.
    pub offset: u64,
}

impl CiaContent {
    /// File name in the mounted snapshot.
    pub fn file_name(&self) -> String {
        format!("{:04x}.{:08x}.app", self.chunk.index, self.chunk.id)
    }
}

/// Parsed CIA.
#[derive(Debug, Clone)]
pub struct Cia {
    pub cia_type: u16,
    pub version: u16,
    pub cert: Section,
    pub ticket_section: Section,
    pub tmd_section: Section,
    pub content: Section,
    pub meta: Section,
    pub ticket: Ticket,
    pub tmd: Tmd,
    pub contents: Vec<CiaContent>,
    index_bits: Vec<u8>,
}

impl Cia {
    /// Parse the header, ticket and TMD, and lay out the contents.
    pub fn parse(storage: &SharedStorage) -> Result<Self> {
        let mut r = StorageReader::new(storage.clone());
        if le_u32(&mut r)? != HEADER_SIZE {
            return Err(Error::Parse("CIA header size is not 0x2020"));
        }
        let cia_type = le_u16(&mut r)?;
        let version = le_u16(&mut r)?;
        let cert_size = le_u32(&mut r)? as u64;
        let ticket_size = le_u32(&mut r)? as u64;
        let tmd_size = le_u32(&mut r)? as u64;
        let meta_size = le_u32(&mut r)? as u64;
        let content_size = le_u64(&mut r)?;
        let index_bits = bytesv(&mut r, INDEX_BITS_SIZE)?;

        let mut at = HEADER_SIZE as u64;
        let mut section = |size: u64| -> Result<Section> {
            let s = Section {
                offset: align_up(at, ALIGN)?,
                size,
            };
            at = end_of(s.offset, size)?;
            Ok(s)
        };
        let cert = section(cert_size)?;
        let ticket_section = section(ticket_size)?;
        let tmd_section = section(tmd_size)?;
        let content = section(content_size)?;
        let meta = section(meta_size)?;
        let end = if meta_size > 0 { at } else { end_of(content.offset, content.size)? };
        if end > storage.len() {
            return Err(Error::InvalidRange);
        }

        r.seek(SeekFrom::Start(ticket_section.offset))?;
        let ticket = Ticket::parse(&mut r)?;
        if r.stream_position()? > ticket_section.offset + ticket_section.size {
            return Err(Error::Parse("CIA ticket overruns its section"));
        }
        r.seek(SeekFrom::Start(tmd_section.offset))?;
        let tmd = Tmd::parse(&mut r)?;
        if r.stream_position()? > tmd_section.offset + tmd_section.size {
            return Err(Error::Parse("CIA TMD overruns its section"));
        }

        let present = index_bits.iter().map(|b| b.count_ones() as usize).sum::<usize>();
        if present != tmd.content_count() {
            return Err(Error::Parse("CIA index bits disagree with the TMD content count"));
        }
        let mut contents = Vec::with_capacity(tmd.content_count());
        let mut offset = content.offset;
        for chunk in &tmd.chunks {
            if !bit_set(&index_bits, chunk.index) {
                return Err(Error::Parse("TMD content missing from the CIA index bits"));
            }
            contents.push(CiaContent {
                chunk: chunk.clone(),
                offset,
            });
            offset = end_of(offset, chunk.size)?;
        }
        if offset > content.offset + content.size {
            return Err(Error::Parse("CIA contents exceed the content section"));
        }

        debug!(
            contents = contents.len(),
            content_size,
            "parsed CIA for title {:016x}",
            tmd.title_id
        );
        Ok(Self {
            cia_type,
            version,
            cert,
            ticket_section,
            tmd_section,
            content,
            meta,
            ticket,
            tmd,
            contents,
            index_bits,
        })
    }

    /// Whether content `index` is present according to the header.
    pub fn has_content(&self, index: u16) -> bool {
        bit_set(&self.index_bits, index)
    }

    /// Storage of one content, decrypted when it is encrypted and
    /// `options.decrypt` is set.
    pub fn open_content(
        &self,
        storage: &SharedStorage,
        content: &CiaContent,
        keys: &KeySet,
        options: Options,
    ) -> Result<SharedStorage> {
        let window = SubStorage::shared(storage, content.offset, content.chunk.size)?;
        if !content.chunk.is_encrypted() || !options.decrypt {
            return Ok(window);
        }
        let key = self.ticket.title_key(keys)?;
        let mut iv = [0u8; 16];
        iv[..2].copy_from_slice(&content.chunk.index.to_be_bytes());
        let mut decrypted = DecryptStorage::new(window);
        decrypted.bind(0, content.chunk.size, CbcRegion::<Aes128>::new(&key, &iv)?)?;
        Ok(Arc::new(decrypted))
    }

    /// Mount the CIA: `/cert`, `/ticket`, `/tmd`, `/meta` (if any) and one
    /// `/<index>.<id>.app` per content.
    ///
    /// With `options.verify`, the TMD record hashes and every readable
    /// content are hashed before the snapshot is returned.
    pub fn mount(
        &self,
        storage: &SharedStorage,
        keys: &KeySet,
        options: Options,
    ) -> Result<VirtualFileSystem> {
        let mut vfs = VirtualFileSystem::new();
        for (name, s) in [
            ("cert", self.cert),
            ("ticket", self.ticket_section),
            ("tmd", self.tmd_section),
            ("meta", self.meta),
        ] {
            if s.size > 0 {
                vfs.add_file("/", name, storage, s.offset, s.size)?;
            }
        }
        if options.verify {
            self.tmd.verify()?;
        }
        for content in &self.contents {
            let view = self.open_content(storage, content, keys, options)?;
            let plaintext = !content.chunk.is_encrypted() || options.decrypt;
            if options.verify && plaintext {
                verify_content(&*view, content)?;
            }
            vfs.add_loaded_file("/", &content.file_name(), view)?;
        }
        debug!(files = vfs.file_count(), "mounted CIA");
        Ok(vfs)
    }
}

fn bit_set(bits: &[u8], index: u16) -> bool {
    bits[index as usize / 8] & (0x80 >> (index % 8)) != 0
}

/// Hash a content in bounded pieces and compare it with its chunk record.
fn verify_content(view: &dyn Storage, content: &CiaContent) -> Result<()> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut pos = 0u64;
    while pos < view.len() {
        let n = (view.len() - pos).min(HASH_CHUNK as u64) as usize;
        view.read_at(pos, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        pos += n as u64;
    }
    if hasher.finalize()[..] != content.chunk.hash[..] {
        warn!(index = content.chunk.index, "CIA content hash mismatch");
        return Err(Error::Integrity {
            what: "cia content",
            index: content.chunk.index as u64,
        });
    }
    Ok(())
}
