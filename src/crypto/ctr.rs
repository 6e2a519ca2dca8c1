//! CTR mode with random access.
//!
//! The counter block is a big-endian integer as wide as the cipher block.
//! Encrypting and decrypting are the same keystream XOR, and any block can
//! be reached directly by adding its block number to the initial counter,
//! which is what lets a RomFS be read at arbitrary offsets.
//!
//! <https://en.wikipedia.org/wiki/Block_cipher_mode_of_operation#Counter_(CTR)>

use std::fmt;

use super::{BlockCipher, copy_input, xor_in_place};
use crate::{Error, Result};

/// CTR engine over any [`BlockCipher`].
#[derive(Clone)]
pub struct Ctr<C> {
    cipher: C,
    counter: Vec<u8>,
}

impl<C> fmt::Debug for Ctr<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctr")
            .field("counter", &hex::encode(&self.counter))
            .finish_non_exhaustive()
    }
}

impl<C: BlockCipher> Ctr<C> {
    /// Bind a key and the counter of block 0.
    pub fn new(key: &[u8], counter: &[u8]) -> Result<Self> {
        let cipher = C::with_key(key)?;
        if counter.len() != C::BLOCK_SIZE {
            return Err(Error::InvalidArgument(
                "counter size does not match block size",
            ));
        }
        Ok(Self {
            cipher,
            counter: counter.to_vec(),
        })
    }

    /// Replace the counter of block 0.
    pub fn update_counter(&mut self, counter: &[u8]) -> Result<()> {
        if counter.len() != C::BLOCK_SIZE {
            return Err(Error::InvalidArgument(
                "counter size does not match block size",
            ));
        }
        self.counter.copy_from_slice(counter);
        Ok(())
    }

    pub fn encrypt(&self, dst: &mut [u8], src: &[u8], block_number: u64) -> Result<()> {
        copy_input(dst, src)?;
        self.apply_keystream(dst, block_number);
        Ok(())
    }

    pub fn decrypt(&self, dst: &mut [u8], src: &[u8], block_number: u64) -> Result<()> {
        self.encrypt(dst, src, block_number)
    }

    /// XOR `buf` with the keystream starting at block `block_number`.
    ///
    /// `buf` need not be block aligned; only the keystream bytes that are
    /// needed are used.
    pub fn apply_keystream(&self, buf: &mut [u8], block_number: u64) {
        let mut counter = self.counter.clone();
        increment_counter(&mut counter, block_number);
        let mut keystream = vec![0u8; C::BLOCK_SIZE];
        for chunk in buf.chunks_mut(C::BLOCK_SIZE) {
            keystream.copy_from_slice(&counter);
            self.cipher.encrypt_block(&mut keystream);
            xor_in_place(chunk, &keystream);
            increment_counter(&mut counter, 1);
        }
    }
}

/// Add `by` to a big-endian counter, carrying through every byte and
/// wrapping at the counter width.
pub fn increment_counter(counter: &mut [u8], by: u64) {
    let mut addend = by;
    let mut carry = 0u64;
    for byte in counter.iter_mut().rev() {
        if addend == 0 && carry == 0 {
            break;
        }
        let sum = *byte as u64 + (addend & 0xFF) + carry;
        *byte = sum as u8;
        carry = sum >> 8;
        addend >>= 8;
    }
}
