//! Key material for 3DS content.
//!
//! 3DS containers are keyed at two levels:
//!
//! * **Common keys** (`common_key_XX`, 6 of them) wrap the per-title key
//!   stored in a CIA ticket.
//! * **NCCH keys** decrypt an NCCH partition's exheader, ExeFS and RomFS.
//!   The console derives them in hardware from a keyslot and the partition's
//!   key Y; this crate does not reimplement that scrambler and instead takes
//!   the resulting normal keys, one per title and keyslot.
//!
//! This module is a plain data container. It performs no cryptography.
//!
//! ## Key file format
//! `name = hex_value`, one entry per line, `;` starts a comment line.
//! Unknown names are skipped.
//!
//! | Name | Meaning |
//! |------|---------|
//! | `common_key_XX` | Ticket common key `XX` (hex, 00..05) |
//! | `ncch_key_<title id>_<slot>` | Normal key for a title (16 hex) and keyslot (2 hex) |
//! | `fixed_system_key` | Fixed key of system titles with the fixed-key flag |
//! | `title_key_<title id>` | Already unwrapped title key |

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};

use tracing::debug;

use crate::crypto::Key128;
use crate::{Error, Result};

/// Number of ticket common keys.
pub const COMMON_KEY_COUNT: usize = 6;

/// AES keyslot an NCCH section is decrypted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeySlot {
    /// Original slot; always the primary key.
    Slot0x2C = 0x2C,
    /// 7.0.0 titles.
    Slot0x25 = 0x25,
    /// New 3DS 9.3 titles.
    Slot0x18 = 0x18,
    /// New 3DS 9.6 titles.
    Slot0x1B = 0x1B,
}

impl KeySlot {
    /// Secondary keyslot selected by the NCCH security version byte.
    pub fn for_security_version(version: u8) -> Result<Self> {
        match version {
            0x00 => Ok(Self::Slot0x2C),
            0x01 => Ok(Self::Slot0x25),
            0x0A => Ok(Self::Slot0x18),
            0x0B => Ok(Self::Slot0x1B),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }
}

impl TryFrom<u8> for KeySlot {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x2C => Ok(Self::Slot0x2C),
            0x25 => Ok(Self::Slot0x25),
            0x18 => Ok(Self::Slot0x18),
            0x1B => Ok(Self::Slot0x1B),
            _ => Err(Error::Parse("unknown keyslot")),
        }
    }
}

/// All keys needed to open 3DS content.
///
/// Missing keys surface as [`Error::MissingKey`] when a container that
/// needs them is opened.
#[derive(Default, Clone)]
pub struct KeySet {
    pub common_keys: [Option<Key128>; COMMON_KEY_COUNT],
    /// Normal keys by (title id, keyslot).
    pub ncch_keys: HashMap<(u64, KeySlot), Key128>,
    pub fixed_system_key: Option<Key128>,
    /// Unwrapped title keys by title id.
    pub title_keys: HashMap<u64, Key128>,
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field(
                "common_keys",
                &self.common_keys.iter().filter(|k| k.is_some()).count(),
            )
            .field("ncch_keys", &self.ncch_keys.len())
            .field("fixed_system_key", &self.fixed_system_key.is_some())
            .field("title_keys", &self.title_keys.len())
            .finish()
    }
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a key file from `reader`, adding to the keys already present.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut loaded = 0usize;
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            if self.insert(name.trim(), value.trim()) {
                loaded += 1;
            }
        }
        debug!(loaded, keys = ?self, "loaded key file");
        Ok(())
    }

    /// Store one `name = value` entry. Returns whether the name was known and
    /// the value decoded.
    fn insert(&mut self, name: &str, value: &str) -> bool {
        let Some(key) = decode_key(value) else {
            return false;
        };
        if name == "fixed_system_key" {
            self.fixed_system_key = Some(key);
            return true;
        }
        if let Some(index) = name.strip_prefix("common_key_")
            && let Ok(index) = usize::from_str_radix(index, 16)
            && index < COMMON_KEY_COUNT
        {
            self.common_keys[index] = Some(key);
            return true;
        }
        if let Some(title) = name.strip_prefix("title_key_")
            && let Ok(title_id) = u64::from_str_radix(title, 16)
        {
            self.title_keys.insert(title_id, key);
            return true;
        }
        if let Some(rest) = name.strip_prefix("ncch_key_")
            && let Some((title, slot)) = rest.split_once('_')
            && let Ok(title_id) = u64::from_str_radix(title, 16)
            && let Ok(slot) = u8::from_str_radix(slot, 16)
            && let Ok(slot) = KeySlot::try_from(slot)
        {
            self.ncch_keys.insert((title_id, slot), key);
            return true;
        }
        false
    }

    pub fn common_key(&self, index: u8) -> Result<&Key128> {
        self.common_keys
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::MissingKey(format!("common_key_{index:02x}")))
    }

    /// Normal key for `title_id` in `slot`.
    pub fn ncch_key(&self, title_id: u64, slot: KeySlot) -> Result<&Key128> {
        self.ncch_keys.get(&(title_id, slot)).ok_or_else(|| {
            Error::MissingKey(format!("ncch_key_{title_id:016x}_{:02x}", slot as u8))
        })
    }

    pub fn title_key(&self, title_id: u64) -> Option<&Key128> {
        self.title_keys.get(&title_id)
    }
}

fn decode_key(value: &str) -> Option<Key128> {
    let mut key = [0u8; 16];
    hex::decode_to_slice(value, &mut key).ok()?;
    Some(key)
}
