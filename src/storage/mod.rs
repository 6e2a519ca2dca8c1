//! Random-access byte sources and the decorators stacked on top of them.
//!
//! Every layer of the pipeline is a [`Storage`]: the file on disk, a window
//! into it, a decrypting view, a hash-verified view, an in-memory buffer.
//! Layers are composed by wrapping, and share the layer below through
//! [`SharedStorage`] (`Arc<dyn Storage>`); the last holder of a
//! [`FileStorage`] closes the file.
//!
//! Reads are positional (`read_at`), so every view has its own cursor and
//! nothing is shared between readers except the bytes. Use
//! [`StorageReader`] when a `std::io::Read + Seek` cursor is needed.
//!
//! ```text
//! FileStorage ─▶ SubStorage (partition) ─▶ DecryptStorage ─▶ VerifiedStorage ×N ─▶ SubStorage (file)
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::utils::end_of;
use crate::{Error, Result};

pub mod decrypt;
pub mod verify;

pub use decrypt::{CbcRegion, CtrRegion, DecryptStorage, EcbRegion, RegionCipher, XtsRegion};
pub use verify::{HashSource, HashTree, HashTreeLevel, VerifiedStorage, VerifyState};

/// A random-access, read-only byte source.
pub trait Storage: fmt::Debug + Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// Reads past the end fail with [`Error::InvalidRange`]; there are no
    /// short reads.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to a storage layer.
pub type SharedStorage = Arc<dyn Storage>;

/// Fail with [`Error::InvalidRange`] unless `[offset, offset + count)` lies
/// inside a storage of `len` bytes.
pub(crate) fn check_range(len: u64, offset: u64, count: u64) -> Result<()> {
    if end_of(offset, count)? > len {
        return Err(Error::InvalidRange);
    }
    Ok(())
}

/// Read `len` bytes at `offset` into a new buffer.
pub fn read_vec(storage: &dyn Storage, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    storage.read_at(offset, &mut buf)?;
    Ok(buf)
}

/// Bytes held in memory.
#[derive(Clone)]
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Wrap into a [`SharedStorage`].
    pub fn shared(data: Vec<u8>) -> SharedStorage {
        Arc::new(Self::new(data))
    }
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Storage for MemoryStorage {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.len(), offset, buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}

/// A file on disk.
///
/// The handle sits behind a mutex so that a seek and the read that follows
/// it cannot interleave with another view's.
#[derive(Debug)]
pub struct FileStorage {
    file: Mutex<File>,
    len: u64,
}

impl FileStorage {
    /// Open `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file(File::open(path)?)
    }

    pub fn from_file(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl Storage for FileStorage {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.len, offset, buf.len() as u64)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

/// A window of `len` bytes starting at `offset` inside another storage.
#[derive(Debug, Clone)]
pub struct SubStorage {
    base: SharedStorage,
    offset: u64,
    len: u64,
}

impl SubStorage {
    /// Fails with [`Error::InvalidRange`] if the window does not fit in
    /// `base`.
    pub fn new(base: SharedStorage, offset: u64, len: u64) -> Result<Self> {
        check_range(base.len(), offset, len)?;
        Ok(Self { base, offset, len })
    }

    /// Like [`SubStorage::new`], wrapped into a [`SharedStorage`].
    pub fn shared(base: &SharedStorage, offset: u64, len: u64) -> Result<SharedStorage> {
        Ok(Arc::new(Self::new(base.clone(), offset, len)?))
    }

    /// Offset of the window inside its base.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Storage for SubStorage {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.len, offset, buf.len() as u64)?;
        self.base.read_at(self.offset + offset, buf)
    }
}

/// `std::io::Read + Seek` cursor over a storage.
///
/// Each reader has its own position; several readers over the same storage
/// do not disturb each other.
#[derive(Debug, Clone)]
pub struct StorageReader {
    storage: SharedStorage,
    pos: u64,
}

impl StorageReader {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage, pos: 0 }
    }

    /// The storage being read.
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Consume the reader, returning the storage.
    pub fn into_inner(self) -> SharedStorage {
        self.storage
    }
}

impl Read for StorageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.storage.len().saturating_sub(self.pos);
        let n = remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.storage.read_at(self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for StorageReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.storage.len().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
