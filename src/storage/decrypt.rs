//! On-demand decryption of keyed byte regions.
//!
//! A [`DecryptStorage`] wraps a base storage and a set of disjoint
//! bindings, each pairing a byte region with a [`RegionCipher`]. A read
//! decrypts only the cipher units it touches. The cipher position (counter,
//! IV, sector number) is derived from the read offset, never from a running
//! cursor, so any offset can be read in any order. Bytes outside every
//! binding pass through untouched.

use std::fmt;

use tracing::debug;

use super::{SharedStorage, Storage, check_range, read_vec};
use crate::crypto::{BlockCipher, Cbc, Ctr, Ecb, TweakWordOrder, Xts};
use crate::utils::end_of;
use crate::{Error, Result};

/// A cipher bound to one region, able to decrypt any unit-aligned span of
/// that region.
pub trait RegionCipher: fmt::Debug + Send + Sync {
    /// Size of the smallest independently decryptable unit.
    fn unit_size(&self) -> u64;

    /// Bytes immediately preceding a unit that its decryption depends on.
    fn chain_size(&self) -> u64 {
        0
    }

    /// Whether the region may end in the middle of a unit.
    fn allows_partial_tail(&self) -> bool {
        false
    }

    /// Decrypt `data`, which starts at the unit-aligned `offset` inside the
    /// region. `chain` holds the [`RegionCipher::chain_size`] ciphertext
    /// bytes before `offset`, or is empty at the region start.
    fn decrypt(&self, offset: u64, chain: &[u8], data: &mut [u8]) -> Result<()>;
}

/// CTR region. The region's first byte is `block_offset` blocks into the
/// counter sequence.
#[derive(Clone)]
pub struct CtrRegion<C> {
    engine: Ctr<C>,
    block_offset: u64,
}

impl<C> fmt::Debug for CtrRegion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtrRegion")
            .field("engine", &self.engine)
            .field("block_offset", &self.block_offset)
            .finish()
    }
}

impl<C: BlockCipher> CtrRegion<C> {
    pub fn new(key: &[u8], counter: &[u8]) -> Result<Self> {
        Ok(Self {
            engine: Ctr::new(key, counter)?,
            block_offset: 0,
        })
    }

    /// Start the region `block_offset` blocks after the counter passed to
    /// [`CtrRegion::new`].
    pub fn with_block_offset(mut self, block_offset: u64) -> Self {
        self.block_offset = block_offset;
        self
    }
}

impl<C: BlockCipher + 'static> RegionCipher for CtrRegion<C> {
    fn unit_size(&self) -> u64 {
        C::BLOCK_SIZE as u64
    }

    fn allows_partial_tail(&self) -> bool {
        true
    }

    fn decrypt(&self, offset: u64, _chain: &[u8], data: &mut [u8]) -> Result<()> {
        let block = self.block_offset + offset / C::BLOCK_SIZE as u64;
        self.engine.apply_keystream(data, block);
        Ok(())
    }
}

/// CBC region with initial IV `iv`. Later blocks chain from the previous
/// ciphertext block, which the storage supplies.
#[derive(Clone)]
pub struct CbcRegion<C> {
    engine: Cbc<C>,
    iv: Vec<u8>,
}

impl<C> fmt::Debug for CbcRegion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbcRegion").finish_non_exhaustive()
    }
}

impl<C: BlockCipher> CbcRegion<C> {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self {
            engine: Cbc::new(key, iv)?,
            iv: iv.to_vec(),
        })
    }
}

impl<C: BlockCipher + 'static> RegionCipher for CbcRegion<C> {
    fn unit_size(&self) -> u64 {
        C::BLOCK_SIZE as u64
    }

    fn chain_size(&self) -> u64 {
        C::BLOCK_SIZE as u64
    }

    fn decrypt(&self, offset: u64, chain: &[u8], data: &mut [u8]) -> Result<()> {
        let mut engine = self.engine.clone();
        engine.update_iv(if offset == 0 { &self.iv } else { chain })?;
        engine.decrypt_in_place(data)
    }
}

/// ECB region; the region must be a whole number of blocks.
#[derive(Clone)]
pub struct EcbRegion<C> {
    engine: Ecb<C>,
}

impl<C> fmt::Debug for EcbRegion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcbRegion").finish_non_exhaustive()
    }
}

impl<C: BlockCipher> EcbRegion<C> {
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            engine: Ecb::new(key)?,
        })
    }
}

impl<C: BlockCipher + 'static> RegionCipher for EcbRegion<C> {
    fn unit_size(&self) -> u64 {
        C::BLOCK_SIZE as u64
    }

    fn decrypt(&self, _offset: u64, _chain: &[u8], data: &mut [u8]) -> Result<()> {
        self.engine.decrypt_in_place(data)
    }
}

/// XTS region whose first sector is `first_sector`.
#[derive(Clone)]
pub struct XtsRegion<C> {
    engine: Xts<C>,
    first_sector: u64,
}

impl<C> fmt::Debug for XtsRegion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XtsRegion")
            .field("engine", &self.engine)
            .field("first_sector", &self.first_sector)
            .finish()
    }
}

impl<C: BlockCipher> XtsRegion<C> {
    pub fn new(
        key1: &[u8],
        key2: &[u8],
        sector_size: usize,
        word_order: TweakWordOrder,
        first_sector: u64,
    ) -> Result<Self> {
        Ok(Self {
            engine: Xts::new(key1, key2, sector_size, word_order)?,
            first_sector,
        })
    }
}

impl<C: BlockCipher + 'static> RegionCipher for XtsRegion<C> {
    fn unit_size(&self) -> u64 {
        self.engine.sector_size() as u64
    }

    fn decrypt(&self, offset: u64, _chain: &[u8], data: &mut [u8]) -> Result<()> {
        let sector = self.first_sector + offset / self.unit_size();
        self.engine.decrypt_in_place(data, sector)
    }
}

#[derive(Debug)]
struct Binding {
    offset: u64,
    size: u64,
    cipher: Box<dyn RegionCipher>,
}

impl Binding {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A base storage with keyed regions decrypted on read.
#[derive(Debug)]
pub struct DecryptStorage {
    base: SharedStorage,
    /// Sorted by offset, pairwise disjoint.
    bindings: Vec<Binding>,
}

impl DecryptStorage {
    /// Start with no bindings: every byte passes through.
    pub fn new(base: SharedStorage) -> Self {
        Self {
            base,
            bindings: Vec::new(),
        }
    }

    /// Decrypt `[offset, offset + size)` of the base with `cipher`.
    ///
    /// Fails if the region is empty, leaves the base, overlaps an existing
    /// binding, or is not a whole number of cipher units (CTR excepted).
    pub fn bind(
        &mut self,
        offset: u64,
        size: u64,
        cipher: impl RegionCipher + 'static,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("empty decryption region"));
        }
        check_range(self.base.len(), offset, size)?;
        if !cipher.allows_partial_tail() && size % cipher.unit_size() != 0 {
            return Err(Error::InvalidArgument(
                "decryption region is not a whole number of cipher units",
            ));
        }
        let end = end_of(offset, size)?;
        let at = self.bindings.partition_point(|b| b.offset < offset);
        let overlaps_prev = at > 0 && self.bindings[at - 1].end() > offset;
        let overlaps_next = self.bindings.get(at).is_some_and(|b| b.offset < end);
        if overlaps_prev || overlaps_next {
            return Err(Error::InvalidArgument("decryption regions overlap"));
        }
        debug!(offset, size, cipher = ?cipher, "bound decryption region");
        self.bindings.insert(
            at,
            Binding {
                offset,
                size,
                cipher: Box::new(cipher),
            },
        );
        Ok(())
    }

    /// Decrypt the part of binding `b` covered by `out`, which starts at
    /// absolute offset `pos`.
    fn read_bound(&self, b: &Binding, pos: u64, out: &mut [u8]) -> Result<()> {
        let unit = b.cipher.unit_size();
        let rel = pos - b.offset;
        let start = rel - rel % unit;
        let stop = (rel + out.len() as u64).div_ceil(unit) * unit;
        let stop = stop.min(b.size);

        let mut scratch = read_vec(&*self.base, b.offset + start, (stop - start) as usize)?;
        let chain_len = b.cipher.chain_size();
        let chain = if start >= chain_len && chain_len > 0 {
            read_vec(&*self.base, b.offset + start - chain_len, chain_len as usize)?
        } else {
            Vec::new()
        };
        b.cipher.decrypt(start, &chain, &mut scratch)?;

        let skip = (rel - start) as usize;
        out.copy_from_slice(&scratch[skip..skip + out.len()]);
        Ok(())
    }
}

impl Storage for DecryptStorage {
    fn len(&self) -> u64 {
        self.base.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.len(), offset, buf.len() as u64)?;
        let end = offset + buf.len() as u64;
        let mut pos = offset;
        while pos < end {
            let out_start = (pos - offset) as usize;
            // First binding that ends after `pos`.
            let at = self.bindings.partition_point(|b| b.end() <= pos);
            match self.bindings.get(at) {
                Some(b) if b.offset <= pos => {
                    let seg_end = end.min(b.end());
                    let out = &mut buf[out_start..(seg_end - offset) as usize];
                    self.read_bound(b, pos, out)?;
                    pos = seg_end;
                }
                next => {
                    let seg_end = next.map_or(end, |b| end.min(b.offset));
                    let out = &mut buf[out_start..(seg_end - offset) as usize];
                    self.base.read_at(pos, out)?;
                    pos = seg_end;
                }
            }
        }
        Ok(())
    }
}
