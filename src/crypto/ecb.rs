//! ECB with ciphertext stealing.
//!
//! Whole blocks are processed independently. When the input is not a
//! multiple of the block size, the last full block and the trailing partial
//! block trade places: the partial output is the head of the last full
//! block's ciphertext, and the last full output block is the encryption of
//! the partial plaintext padded with that ciphertext's tail.
//!
//! <https://en.wikipedia.org/wiki/Ciphertext_stealing#ECB_ciphertext_stealing>

use std::fmt;

use super::{BlockCipher, copy_input};
use crate::{Error, Result};

/// ECB engine over any [`BlockCipher`].
#[derive(Clone)]
pub struct Ecb<C> {
    cipher: C,
}

// Key schedules stay out of debug output.
impl<C> fmt::Debug for Ecb<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ecb").finish_non_exhaustive()
    }
}

impl<C: BlockCipher> Ecb<C> {
    /// Bind a key. Fails if the key is not [`BlockCipher::KEY_SIZE`] bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: C::with_key(key)?,
        })
    }

    /// Encrypt `src` into `dst` (equal lengths, at least one block).
    pub fn encrypt(&self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        copy_input(dst, src)?;
        self.encrypt_in_place(dst)
    }

    /// Decrypt `src` into `dst` (equal lengths, at least one block).
    pub fn decrypt(&self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        copy_input(dst, src)?;
        self.decrypt_in_place(dst)
    }

    pub fn encrypt_in_place(&self, buf: &mut [u8]) -> Result<()> {
        let (full, rem) = split_len::<C>(buf.len())?;
        for block in buf[..full].chunks_exact_mut(C::BLOCK_SIZE) {
            self.cipher.encrypt_block(block);
        }
        if rem != 0 {
            let (head, tail) = buf.split_at_mut(full);
            let last = &mut head[full - C::BLOCK_SIZE..];
            // tail <- head of CC, last <- P_n || tail of CC
            last[..rem].swap_with_slice(tail);
            self.cipher.encrypt_block(last);
        }
        Ok(())
    }

    pub fn decrypt_in_place(&self, buf: &mut [u8]) -> Result<()> {
        let (full, rem) = split_len::<C>(buf.len())?;
        let independent = if rem == 0 { full } else { full - C::BLOCK_SIZE };
        for block in buf[..independent].chunks_exact_mut(C::BLOCK_SIZE) {
            self.cipher.decrypt_block(block);
        }
        if rem != 0 {
            let (head, tail) = buf.split_at_mut(full);
            let last = &mut head[full - C::BLOCK_SIZE..];
            self.cipher.decrypt_block(last);
            // last <- C_n || tail of CC (the stolen ciphertext), tail <- P_n
            last[..rem].swap_with_slice(tail);
            self.cipher.decrypt_block(last);
        }
        Ok(())
    }
}

/// Length of the whole-block prefix and of the trailing partial block.
fn split_len<C: BlockCipher>(len: usize) -> Result<(usize, usize)> {
    if len < C::BLOCK_SIZE {
        return Err(Error::InvalidArgument("ECB input shorter than one block"));
    }
    let rem = len % C::BLOCK_SIZE;
    Ok((len - rem, rem))
}
