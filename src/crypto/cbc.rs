//! CBC with a running, repositionable IV.
//!
//! The engine keeps the chaining value between calls, so a long region can
//! be processed in pieces. [`Cbc::update_iv`] moves the chain to an
//! arbitrary point: for random access, the IV of block `n` is the
//! ciphertext of block `n - 1`.

use std::fmt;

use super::{BlockCipher, copy_input, xor_in_place};
use crate::{Error, Result};

/// CBC engine over any [`BlockCipher`].
#[derive(Clone)]
pub struct Cbc<C> {
    cipher: C,
    iv: Vec<u8>,
}

impl<C> fmt::Debug for Cbc<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cbc").finish_non_exhaustive()
    }
}

impl<C: BlockCipher> Cbc<C> {
    /// Bind a key and an initial IV (one block).
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        let cipher = C::with_key(key)?;
        check_iv::<C>(iv)?;
        Ok(Self {
            cipher,
            iv: iv.to_vec(),
        })
    }

    /// Reposition the chain.
    pub fn update_iv(&mut self, iv: &[u8]) -> Result<()> {
        check_iv::<C>(iv)?;
        self.iv.copy_from_slice(iv);
        Ok(())
    }

    /// The chaining value the next call will start from.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypt(&mut self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        copy_input(dst, src)?;
        self.encrypt_in_place(dst)
    }

    pub fn decrypt(&mut self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        copy_input(dst, src)?;
        self.decrypt_in_place(dst)
    }

    /// Encrypt whole blocks; the IV advances to the last ciphertext block.
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        check_aligned::<C>(buf.len())?;
        for block in buf.chunks_exact_mut(C::BLOCK_SIZE) {
            xor_in_place(block, &self.iv);
            self.cipher.encrypt_block(block);
            self.iv.copy_from_slice(block);
        }
        Ok(())
    }

    /// Decrypt whole blocks; the IV advances to the last ciphertext block.
    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        check_aligned::<C>(buf.len())?;
        let mut next_iv = vec![0u8; C::BLOCK_SIZE];
        for block in buf.chunks_exact_mut(C::BLOCK_SIZE) {
            // Capture the ciphertext before it is overwritten.
            next_iv.copy_from_slice(block);
            self.cipher.decrypt_block(block);
            xor_in_place(block, &self.iv);
            std::mem::swap(&mut self.iv, &mut next_iv);
        }
        Ok(())
    }
}

fn check_iv<C: BlockCipher>(iv: &[u8]) -> Result<()> {
    if iv.len() != C::BLOCK_SIZE {
        return Err(Error::InvalidArgument("IV size does not match block size"));
    }
    Ok(())
}

fn check_aligned<C: BlockCipher>(len: usize) -> Result<()> {
    if len % C::BLOCK_SIZE != 0 {
        return Err(Error::InvalidArgument(
            "CBC input is not a multiple of the block size",
        ));
    }
    Ok(())
}
