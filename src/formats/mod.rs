//! Walkers for 3DS container formats.
//!
//! Each submodule targets one format. They share a few conventions:
//!
//! * **Storage in, snapshot out** - every parser takes a
//!   [`SharedStorage`](crate::storage::SharedStorage) positioned at the
//!   start of its format, and archive formats build a
//!   [`VirtualFileSystem`](crate::vfs::VirtualFileSystem) whose files are
//!   lazy windows over that storage.
//! * **Parse, then mount** - `parse` reads and validates headers and tables
//!   only; `mount` produces the snapshot. Headers are fully validated before
//!   any offset from them is trusted, and nothing malformed is repaired.
//! * **Crypto and verification are layers** - decryption and hash checking
//!   happen in [`crate::storage`] decorators stacked under the walker, not
//!   inside it.
//!
//! ## Format overview
//!
//! | Module     | Format     | Description |
//! |------------|------------|-------------|
//! | [`cci`]    | CCI / NCSD | Game card image; up to 8 NCCH partitions |
//! | [`cia`]    | CIA        | Installable package: certificates, ticket, TMD, contents |
//! | [`ncch`]   | NCCH       | Executable (CXI) or data (CFA) partition; carries ExeFS and RomFS |
//! | [`exefs`]  | ExeFS      | Flat 10-slot file table with per-section SHA-256 |
//! | [`ivfc`]   | IVFC       | Three-level hash tree around a RomFS |
//! | [`romfs`]  | RomFS      | Directory tree with hash-bucketed lookup tables |
//! | [`ticket`] | Ticket     | Signed title key |
//! | [`tmd`]    | TMD        | Signed title metadata and content chunk list |

use std::io::Read;

use crate::utils::{be_u32, bytesv};
use crate::{Error, Result};

pub mod cci;
pub mod cia;
pub mod exefs;
pub mod ivfc;
pub mod ncch;
pub mod romfs;
pub mod ticket;
pub mod tmd;

/// Behavior switches shared by the walkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Check hashes (ExeFS sections, NCCH superblocks, CIA contents) before
    /// exposing data.
    pub verify: bool,
    /// Decrypt encrypted regions. When off, ciphertext is exposed as is.
    pub decrypt: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verify: true,
            decrypt: true,
        }
    }
}

/// Size of a signature block (type, signature and padding) by signature
/// type.
pub fn signature_block_size(signature_type: u32) -> Result<usize> {
    match signature_type {
        // RSA-4096 with SHA-1 / SHA-256
        0x010000 | 0x010003 => Ok(0x240),
        // RSA-2048 with SHA-1 / SHA-256
        0x010001 | 0x010004 => Ok(0x140),
        // ECDSA with SHA-1 / SHA-256
        0x010002 | 0x010005 => Ok(0x80),
        _ => Err(Error::Parse("unknown signature type")),
    }
}

/// Skip the signature block at the start of a signed structure, returning
/// its type.
pub(crate) fn skip_signature<R: Read>(r: &mut R) -> Result<u32> {
    let signature_type = be_u32(r)?;
    let size = signature_block_size(signature_type)?;
    bytesv(r, size - 4)?;
    Ok(signature_type)
}
