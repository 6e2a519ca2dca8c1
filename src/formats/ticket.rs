//! Ticket - signed record carrying a title's encrypted title key.
//!
//! All fields are big-endian.
//!
//! ## Layout (after the signature block)
//! ```text
//! [0x00] Issuer                    (0x40 bytes, NUL padded)
//! [0x40] ECC public key            (0x3C bytes)
//! [0x7C] Version                   (u8)
//! [0x7D] CA CRL version            (u8)
//! [0x7E] Signer CRL version        (u8)
//! [0x7F] Encrypted title key       (0x10 bytes)
//! [0x8F] Reserved                  (u8)
//! [0x90] Ticket id                 (u64)
//! [0x98] Console id                (u32)
//! [0x9C] Title id                  (u64)
//! [0xA4] Reserved                  (u16)
//! [0xA6] Title version             (u16)
//! [0xA8] Reserved                  (8 bytes)
//! [0xB0] License type              (u8)
//! [0xB1] Common key index          (u8)
//! ```
//!
//! The title key is AES-128-CBC encrypted with common key `CommonKeyIndex`
//! and an IV of the title id followed by eight zero bytes.

use std::io::Read;

use aes::Aes128;

use super::skip_signature;
use crate::crypto::{Cbc, Key128};
use crate::keys::KeySet;
use crate::utils::{be_u16, be_u32, be_u64, bytesa, bytesv, padded_ascii, u8};
use crate::Result;

/// Decoded ticket fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub signature_type: u32,
    pub issuer: String,
    pub version: u8,
    /// Title key as stored, still wrapped with a common key.
    pub encrypted_title_key: Key128,
    pub ticket_id: u64,
    pub console_id: u32,
    pub title_id: u64,
    pub title_version: u16,
    pub license_type: u8,
    pub common_key_index: u8,
}

impl Ticket {
    pub fn parse<R: Read>(r: &mut R) -> Result<Self> {
        let signature_type = skip_signature(r)?;
        let issuer = padded_ascii(&bytesa::<0x40>(r)?);
        let _ecc_public_key = bytesv(r, 0x3C)?;
        let version = u8(r)?;
        let _ca_crl_version = u8(r)?;
        let _signer_crl_version = u8(r)?;
        let encrypted_title_key = bytesa::<16>(r)?;
        let _reserved = u8(r)?;
        let ticket_id = be_u64(r)?;
        let console_id = be_u32(r)?;
        let title_id = be_u64(r)?;
        let _reserved = be_u16(r)?;
        let title_version = be_u16(r)?;
        let _reserved = bytesa::<8>(r)?;
        let license_type = u8(r)?;
        let common_key_index = u8(r)?;
        Ok(Self {
            signature_type,
            issuer,
            version,
            encrypted_title_key,
            ticket_id,
            console_id,
            title_id,
            title_version,
            license_type,
            common_key_index,
        })
    }

    /// The unwrapped title key. A `title_key_*` entry in `keys` wins over
    /// the ticket's own key.
    pub fn title_key(&self, keys: &KeySet) -> Result<Key128> {
        if let Some(key) = keys.title_key(self.title_id) {
            return Ok(*key);
        }
        let common = keys.common_key(self.common_key_index)?;
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&self.title_id.to_be_bytes());
        let mut key = self.encrypted_title_key;
        Cbc::<Aes128>::new(common, &iv)?.decrypt_in_place(&mut key)?;
        Ok(key)
    }
}
