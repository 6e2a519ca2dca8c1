//! Block-cipher modes of operation used by 3DS containers.
//!
//! The AES primitive itself comes from the [`aes`] crate; this module only
//! implements the modes on top of it. Every mode is generic over
//! [`BlockCipher`], so AES-128/192/256 all work the same way.
//!
//! ## Submodules
//!
//! | Module | Mode | Used by |
//! |--------|------|---------|
//! | [`ecb`] | ECB with ciphertext stealing | - |
//! | [`cbc`] | CBC with a repositionable IV | CIA contents, title-key unwrap |
//! | [`ctr`] | CTR with random-access block numbers | NCCH exheader/ExeFS/RomFS |
//! | [`xts`] | XTS with ciphertext stealing, either tweak word order | - |
//!
//! All engines reject mis-sized keys, IVs and inputs with
//! [`Error::InvalidArgument`]; nothing is silently truncated. Each engine
//! offers an in-place form and a `dst`/`src` form. Because Rust forbids
//! aliasing `dst` and `src`, "decrypt onto itself" is the in-place form.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

pub mod cbc;
pub mod ctr;
pub mod ecb;
pub mod xts;

pub use cbc::Cbc;
pub use ctr::Ctr;
pub use ecb::Ecb;
pub use xts::{TweakWordOrder, Xts};

/// A 128-bit AES key, the only size 3DS containers use.
pub type Key128 = [u8; 16];

/// SHA-256 digest size in bytes.
pub const SHA256_SIZE: usize = 32;

/// A keyed block cipher: fixed block size, fixed key size, single-block
/// encrypt and decrypt.
///
/// `encrypt_block`/`decrypt_block` are only ever called with slices of
/// exactly [`BlockCipher::BLOCK_SIZE`] bytes.
pub trait BlockCipher: Clone + Send + Sync {
    /// Block size in bytes.
    const BLOCK_SIZE: usize;
    /// Key size in bytes.
    const KEY_SIZE: usize;

    /// Build a cipher from raw key bytes.
    fn with_key(key: &[u8]) -> Result<Self>;

    /// Encrypt one block in place.
    fn encrypt_block(&self, block: &mut [u8]);

    /// Decrypt one block in place.
    fn decrypt_block(&self, block: &mut [u8]);
}

macro_rules! aes_block_cipher {
    ($ty:ty, $key_size:expr) => {
        impl BlockCipher for $ty {
            const BLOCK_SIZE: usize = 16;
            const KEY_SIZE: usize = $key_size;

            fn with_key(key: &[u8]) -> Result<Self> {
                if key.len() != Self::KEY_SIZE {
                    return Err(Error::InvalidArgument("key size does not match cipher"));
                }
                <$ty as KeyInit>::new_from_slice(key)
                    .map_err(|_| Error::InvalidArgument("key size does not match cipher"))
            }

            fn encrypt_block(&self, block: &mut [u8]) {
                <$ty as BlockEncrypt>::encrypt_block(self, Block::from_mut_slice(block));
            }

            fn decrypt_block(&self, block: &mut [u8]) {
                <$ty as BlockDecrypt>::decrypt_block(self, Block::from_mut_slice(block));
            }
        }
    };
}

aes_block_cipher!(Aes128, 16);
aes_block_cipher!(Aes192, 24);
aes_block_cipher!(Aes256, 32);

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    Sha256::digest(data).into()
}

/// Copy `src` into `dst` for the `dst`/`src` flavor of each mode.
pub(crate) fn copy_input(dst: &mut [u8], src: &[u8]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::InvalidArgument(
            "destination and source lengths differ",
        ));
    }
    dst.copy_from_slice(src);
    Ok(())
}

#[inline]
pub(crate) fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}
