//! Hash-tree verification.
//!
//! A [`VerifiedStorage`] splits its data into fixed-size blocks and checks
//! each block against a SHA-256 table before any byte of it reaches the
//! caller. A multi-level tree is a chain of these: the table of level `k`
//! is the verified output of level `k - 1`, and the first table is the
//! master hash, which the caller trusts through some outer signature.
//!
//! ```text
//! master hash ─▶ level 1 ─▶ level 2 ─▶ ... ─▶ content
//!   (eager)      (lazy)      (lazy)
//! ```
//!
//! A failed block is never cached: every later read of it re-reads and
//! re-hashes, and fails again. Blocks that verified once are trusted for the
//! lifetime of the storage.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{trace, warn};

use super::{SharedStorage, Storage, SubStorage, check_range};
use crate::crypto::{SHA256_SIZE, sha256};
use crate::{Error, Result};

/// Largest block size accepted in a hash tree (1 MiB).
pub const MAX_BLOCK_SIZE_LOG2: u32 = 20;

/// Where the expected hashes of a level come from.
#[derive(Debug, Clone)]
pub enum HashSource {
    /// The whole table, read up front (master hash, small levels).
    Eager(Vec<u8>),
    /// Fetched 32 bytes at a time from a (usually verified) storage.
    Lazy(SharedStorage),
}

impl HashSource {
    fn len(&self) -> u64 {
        match self {
            HashSource::Eager(v) => v.len() as u64,
            HashSource::Lazy(s) => s.len(),
        }
    }

    fn hash_of(&self, index: u64) -> Result<[u8; SHA256_SIZE]> {
        let offset = index * SHA256_SIZE as u64;
        let mut hash = [0u8; SHA256_SIZE];
        match self {
            HashSource::Eager(v) => {
                check_range(v.len() as u64, offset, SHA256_SIZE as u64)?;
                let start = offset as usize;
                hash.copy_from_slice(&v[start..start + SHA256_SIZE]);
            }
            HashSource::Lazy(s) => s.read_at(offset, &mut hash)?,
        }
        Ok(hash)
    }
}

/// Observable state of a [`VerifiedStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    /// Geometry checked, no block verified yet.
    Initialized,
    /// At least one block verified, none failed.
    Ready,
    /// A block failed verification. Terminal: the storage stays corrupted
    /// even though unrelated blocks remain readable.
    Corrupted,
}

#[derive(Debug)]
struct Session {
    state: VerifyState,
    /// One bit per block.
    verified: Vec<u64>,
    /// Most recently verified block, kept for short-lived reuse.
    cached: Option<(u64, Vec<u8>)>,
}

impl Session {
    fn is_verified(&self, block: u64) -> bool {
        self.verified[(block / 64) as usize] & (1 << (block % 64)) != 0
    }

    fn mark_verified(&mut self, block: u64) {
        self.verified[(block / 64) as usize] |= 1 << (block % 64);
    }
}

/// A storage whose blocks are checked against a hash table before use.
#[derive(Debug)]
pub struct VerifiedStorage {
    data: SharedStorage,
    hashes: HashSource,
    block_size: u64,
    block_count: u64,
    session: Mutex<Session>,
}

impl VerifiedStorage {
    /// Bind `data`, split into blocks of `block_size` bytes (a power of two),
    /// to the table in `hashes`.
    ///
    /// Fails if the table is too short to cover every block.
    pub fn new(data: SharedStorage, hashes: HashSource, block_size: u64) -> Result<Self> {
        if !block_size.is_power_of_two() || block_size > 1 << MAX_BLOCK_SIZE_LOG2 {
            return Err(Error::InvalidArgument(
                "hash block size is not a supported power of two",
            ));
        }
        let block_count = data.len().div_ceil(block_size);
        if block_count * SHA256_SIZE as u64 > hashes.len() {
            return Err(Error::Parse("hash table does not cover every block"));
        }
        Ok(Self {
            data,
            hashes,
            block_size,
            block_count,
            session: Mutex::new(Session {
                state: VerifyState::Initialized,
                verified: vec![0; block_count.div_ceil(64) as usize],
                cached: None,
            }),
        })
    }

    pub fn state(&self) -> VerifyState {
        self.lock().state
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn block_len(&self, block: u64) -> u64 {
        self.block_size
            .min(self.data.len() - block * self.block_size)
    }

    /// Copy `out.len()` bytes at `skip` inside `block` into `out`, verifying
    /// the block first if this session has not done so yet.
    fn read_block(&self, block: u64, skip: u64, out: &mut [u8]) -> Result<()> {
        let block_start = block * self.block_size;
        let mut session = self.lock();

        if let Some((cached, bytes)) = &session.cached
            && *cached == block
        {
            let skip = skip as usize;
            out.copy_from_slice(&bytes[skip..skip + out.len()]);
            return Ok(());
        }
        if session.is_verified(block) {
            return self.data.read_at(block_start + skip, out);
        }

        // The final block may be short; it is hashed zero-padded.
        let len = self.block_len(block) as usize;
        let mut bytes = vec![0u8; self.block_size as usize];
        self.data.read_at(block_start, &mut bytes[..len])?;
        let expected = self.hashes.hash_of(block)?;
        if sha256(&bytes) != expected {
            warn!(block, block_size = self.block_size, "hash tree block failed verification");
            session.state = VerifyState::Corrupted;
            return Err(Error::Integrity {
                what: "hash tree block",
                index: block,
            });
        }
        trace!(block, "hash tree block verified");
        session.mark_verified(block);
        if session.state == VerifyState::Initialized {
            session.state = VerifyState::Ready;
        }
        let skip = skip as usize;
        out.copy_from_slice(&bytes[skip..skip + out.len()]);
        bytes.truncate(len);
        session.cached = Some((block, bytes));
        Ok(())
    }
}

impl Storage for VerifiedStorage {
    fn len(&self) -> u64 {
        self.data.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.len(), offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset + buf.len() as u64;
        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;
        debug_assert!(last < self.block_count);

        for block in first..=last {
            let block_start = block * self.block_size;
            let from = offset.max(block_start);
            let to = end.min(block_start + self.block_size);
            let out = &mut buf[(from - offset) as usize..(to - offset) as usize];
            self.read_block(block, from - block_start, out)?;
        }
        Ok(())
    }
}

/// One level of a hash tree, located inside the tree's backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashTreeLevel {
    /// Byte offset of the level inside the backing storage.
    pub offset: u64,
    /// Size of the level in bytes.
    pub size: u64,
    /// log2 of the level's block size.
    pub block_size_log2: u32,
}

impl HashTreeLevel {
    pub fn block_size(&self) -> u64 {
        1 << self.block_size_log2
    }

    fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size())
    }
}

/// A complete hash tree: the trusted master hash plus the levels it covers,
/// outermost first. The last level is the content itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTree {
    /// Hashes of the first level's blocks.
    pub master_hash: Vec<u8>,
    pub levels: Vec<HashTreeLevel>,
}

impl HashTree {
    /// Check that every level is block aligned and every table is large
    /// enough for the level it covers.
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.levels.first() else {
            return Err(Error::Parse("hash tree has no levels"));
        };
        for level in &self.levels {
            if level.block_size_log2 > MAX_BLOCK_SIZE_LOG2 {
                return Err(Error::Parse("hash tree block size out of range"));
            }
            if level.offset % level.block_size() != 0 {
                return Err(Error::Parse("hash level offset is not block aligned"));
            }
        }
        if first.block_count() * SHA256_SIZE as u64 > self.master_hash.len() as u64 {
            return Err(Error::Parse("master hash does not cover the first level"));
        }
        for pair in self.levels.windows(2) {
            if pair[1].block_count() * SHA256_SIZE as u64 > pair[0].size {
                return Err(Error::Parse("hash level does not cover the next level"));
            }
        }
        Ok(())
    }

    /// Chain one [`VerifiedStorage`] per level over `base` and return the
    /// content level.
    pub fn open(&self, base: &SharedStorage) -> Result<SharedStorage> {
        self.validate()?;
        let mut hashes = HashSource::Eager(self.master_hash.clone());
        let mut top: Option<SharedStorage> = None;
        for level in &self.levels {
            let data = SubStorage::shared(base, level.offset, level.size)?;
            let verified: SharedStorage =
                Arc::new(VerifiedStorage::new(data, hashes, level.block_size())?);
            hashes = HashSource::Lazy(verified.clone());
            top = Some(verified);
        }
        top.ok_or(Error::Parse("hash tree has no levels"))
    }
}

/// Build the hash table for `data` split into `block_size` blocks, with the
/// final block zero-padded. Useful to author trees and in tests.
pub fn hash_blocks(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().div_ceil(block_size) * SHA256_SIZE);
    let mut padded = vec![0u8; block_size];
    for chunk in data.chunks(block_size) {
        padded[..chunk.len()].copy_from_slice(chunk);
        padded[chunk.len()..].fill(0);
        out.extend_from_slice(&sha256(&padded));
    }
    out
}
