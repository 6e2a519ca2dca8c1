//! XTS (XEX with tweak and ciphertext stealing).
//!
//! Each sector gets its own tweak: the sector number is laid out in a block
//! (little-endian in the first eight bytes per IEEE 1619, or big-endian in
//! the last eight bytes), encrypted once with the tweak key, then doubled
//! in GF(2^128) for every following block of the sector. A sector whose size is not a
//! multiple of the block size ends with ciphertext stealing.
//!
//! <https://en.wikipedia.org/wiki/Disk_encryption_theory#XTS>

use std::fmt;

use super::{BlockCipher, copy_input, xor_in_place};
use crate::{Error, Result};

/// Byte order used to place the sector number into the initial tweak block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TweakWordOrder {
    /// IEEE 1619: sector number in the first eight bytes, little-endian.
    LittleEndian,
    /// Sector number in the last eight bytes, big-endian.
    BigEndian,
}

/// XTS engine over a 128-bit [`BlockCipher`].
#[derive(Clone)]
pub struct Xts<C> {
    data: C,
    tweak: C,
    sector_size: usize,
    word_order: TweakWordOrder,
}

impl<C> fmt::Debug for Xts<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xts")
            .field("sector_size", &self.sector_size)
            .field("word_order", &self.word_order)
            .finish_non_exhaustive()
    }
}

type Tweak = [u8; 16];

impl<C: BlockCipher> Xts<C> {
    /// Bind the data key (`key1`), the tweak key (`key2`) and the sector
    /// geometry.
    ///
    /// `sector_size` must be at least one block; it does not have to be a
    /// multiple of the block size.
    pub fn new(
        key1: &[u8],
        key2: &[u8],
        sector_size: usize,
        word_order: TweakWordOrder,
    ) -> Result<Self> {
        if C::BLOCK_SIZE != 16 {
            return Err(Error::InvalidArgument("XTS requires a 128-bit block cipher"));
        }
        if sector_size < C::BLOCK_SIZE {
            return Err(Error::InvalidArgument("XTS sector smaller than one block"));
        }
        Ok(Self {
            data: C::with_key(key1)?,
            tweak: C::with_key(key2)?,
            sector_size,
            word_order,
        })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn encrypt(&self, dst: &mut [u8], src: &[u8], sector_number: u64) -> Result<()> {
        copy_input(dst, src)?;
        self.encrypt_in_place(dst, sector_number)
    }

    pub fn decrypt(&self, dst: &mut [u8], src: &[u8], sector_number: u64) -> Result<()> {
        copy_input(dst, src)?;
        self.decrypt_in_place(dst, sector_number)
    }

    /// Encrypt consecutive sectors, the first of which is `sector_number`.
    pub fn encrypt_in_place(&self, buf: &mut [u8], sector_number: u64) -> Result<()> {
        self.check_len(buf.len())?;
        for (i, sector) in buf.chunks_exact_mut(self.sector_size).enumerate() {
            self.encrypt_sector(sector, sector_number.wrapping_add(i as u64));
        }
        Ok(())
    }

    /// Decrypt consecutive sectors, the first of which is `sector_number`.
    pub fn decrypt_in_place(&self, buf: &mut [u8], sector_number: u64) -> Result<()> {
        self.check_len(buf.len())?;
        for (i, sector) in buf.chunks_exact_mut(self.sector_size).enumerate() {
            self.decrypt_sector(sector, sector_number.wrapping_add(i as u64));
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len % self.sector_size != 0 {
            return Err(Error::InvalidArgument(
                "XTS input is not a multiple of the sector size",
            ));
        }
        Ok(())
    }

    fn initial_tweak(&self, sector_number: u64) -> Tweak {
        let mut t = [0u8; 16];
        match self.word_order {
            TweakWordOrder::LittleEndian => t[..8].copy_from_slice(&sector_number.to_le_bytes()),
            TweakWordOrder::BigEndian => t[8..].copy_from_slice(&sector_number.to_be_bytes()),
        }
        self.tweak.encrypt_block(&mut t);
        t
    }

    fn encrypt_sector(&self, sector: &mut [u8], sector_number: u64) {
        let rem = sector.len() % 16;
        let full = sector.len() - rem;
        let independent = if rem == 0 { full } else { full - 16 };
        let mut t = self.initial_tweak(sector_number);

        for block in sector[..independent].chunks_exact_mut(16) {
            xex(block, &t, |b| self.data.encrypt_block(b));
            gf128_double(&mut t);
        }
        if rem != 0 {
            let (head, tail) = sector.split_at_mut(full);
            let last = &mut head[full - 16..];
            xex(last, &t, |b| self.data.encrypt_block(b));
            gf128_double(&mut t);
            last[..rem].swap_with_slice(tail);
            xex(last, &t, |b| self.data.encrypt_block(b));
        }
    }

    fn decrypt_sector(&self, sector: &mut [u8], sector_number: u64) {
        let rem = sector.len() % 16;
        let full = sector.len() - rem;
        let independent = if rem == 0 { full } else { full - 16 };
        let mut t = self.initial_tweak(sector_number);

        for block in sector[..independent].chunks_exact_mut(16) {
            xex(block, &t, |b| self.data.decrypt_block(b));
            gf128_double(&mut t);
        }
        if rem != 0 {
            // The stolen block was produced with the *next* tweak.
            let mut t_next = t;
            gf128_double(&mut t_next);
            let (head, tail) = sector.split_at_mut(full);
            let last = &mut head[full - 16..];
            xex(last, &t_next, |b| self.data.decrypt_block(b));
            last[..rem].swap_with_slice(tail);
            xex(last, &t, |b| self.data.decrypt_block(b));
        }
    }
}

/// Pre-whiten, apply the block operation, post-whiten.
#[inline]
fn xex(block: &mut [u8], t: &Tweak, op: impl Fn(&mut [u8])) {
    xor_in_place(block, t);
    op(block);
    xor_in_place(block, t);
}

/// Multiply the tweak by x in GF(2^128) (little-endian bit order, reduction
/// polynomial x^128 + x^7 + x^2 + x + 1).
pub(crate) fn gf128_double(t: &mut Tweak) {
    let carry = t[15] >> 7;
    for i in (1..16).rev() {
        t[i] = (t[i] << 1) | (t[i - 1] >> 7);
    }
    t[0] <<= 1;
    if carry != 0 {
        t[0] ^= 0x87;
    }
}
