//! RomFS - read-only file system carried in an NCCH's RomFS section.
//!
//! The RomFS proper is the content level of an IVFC hash tree (see
//! [`super::ivfc`]); offsets below are relative to its start.
//!
//! ## Header (0x28 bytes)
//! ```text
//! [0x00] HeaderSize (always 0x28)          (u32 LE)
//! [0x04] DirHashTable     offset, size     (u32 LE ×2)
//! [0x0C] DirMetaTable     offset, size     (u32 LE ×2)
//! [0x14] FileHashTable    offset, size     (u32 LE ×2)
//! [0x1C] FileMetaTable    offset, size     (u32 LE ×2)
//! [0x24] DataOffset                        (u32 LE)
//! ```
//!
//! ## Directory entry (0x18 bytes + name)
//! ```text
//! [0x00] Parent           (dir offset)
//! [0x04] Sibling          (dir offset)
//! [0x08] FirstChildDir    (dir offset)
//! [0x0C] FirstChildFile   (file offset)
//! [0x10] HashSibling      (dir offset)
//! [0x14] NameLength       (bytes)
//! [0x18] Name             (UTF-16LE, padded to 4 bytes)
//! ```
//!
//! ## File entry (0x20 bytes + name)
//! ```text
//! [0x00] Parent           (dir offset)
//! [0x04] Sibling          (file offset)
//! [0x08] DataOffset       (u64 LE, relative to the header's DataOffset)
//! [0x10] DataSize         (u64 LE)
//! [0x18] HashSibling      (file offset)
//! [0x1C] NameLength       (bytes)
//! [0x20] Name             (UTF-16LE, padded to 4 bytes)
//! ```
//!
//! ## Notes
//! * Every link is a byte offset into its meta table; `0xFFFFFFFF` means
//!   "none". Entries are decoded into a flat `Vec` and links become indices.
//! * The hash tables are buckets of entry offsets, each heading a chain
//!   linked through `HashSibling`. They only speed up lookup by path; the
//!   tree itself is built from the parent/child/sibling links.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::storage::{SharedStorage, StorageReader, check_range, read_vec};
use crate::utils::{align_up, le_u32, le_u32_at, le_u64_at, utf16_name};
use crate::vfs::VirtualFileSystem;
use crate::{Error, Result};

/// Size of the RomFS header.
pub const HEADER_SIZE: u32 = 0x28;
/// "No entry" marker in every link field.
pub const NONE: u32 = 0xFFFF_FFFF;

const DIR_ENTRY_SIZE: usize = 0x18;
const FILE_ENTRY_SIZE: usize = 0x20;

/// Offset and size of one header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
}

/// The fixed RomFS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomFsHeader {
    pub dir_hash: Region,
    pub dir_meta: Region,
    pub file_hash: Region,
    pub file_meta: Region,
    /// Start of file data, relative to the RomFS.
    pub data_offset: u32,
}

/// A decoded directory entry. Links are indices into [`RomFs::dirs`] and
/// [`RomFs::files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomFsDir {
    /// Byte offset of the entry in the directory meta table.
    pub offset: u32,
    pub parent: usize,
    pub sibling: Option<usize>,
    pub first_child_dir: Option<usize>,
    pub first_child_file: Option<usize>,
    pub hash_sibling: Option<usize>,
    /// Empty for the root.
    pub name: String,
}

/// A decoded file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomFsFile {
    /// Byte offset of the entry in the file meta table.
    pub offset: u32,
    pub parent: usize,
    pub sibling: Option<usize>,
    pub hash_sibling: Option<usize>,
    pub name: String,
    /// Relative to [`RomFsHeader::data_offset`].
    pub data_offset: u64,
    pub data_size: u64,
}

/// Parsed RomFS tables (metadata only).
#[derive(Debug)]
pub struct RomFs {
    pub header: RomFsHeader,
    /// Directory arena; index 0 is the root.
    pub dirs: Vec<RomFsDir>,
    pub files: Vec<RomFsFile>,
    dir_buckets: Vec<Option<usize>>,
    file_buckets: Vec<Option<usize>>,
}

/// Raw links of one entry before they are resolved to indices.
struct RawLinks {
    parent: u32,
    sibling: u32,
    child_dir: u32,
    child_file: u32,
    hash_sibling: u32,
}

/// Bucket hash of `name` inside the directory at meta offset `parent`.
pub fn path_hash(parent: u32, name: &str) -> u32 {
    let mut hash = parent ^ 123_456_789;
    for unit in name.encode_utf16() {
        hash = hash.rotate_right(5) ^ unit as u32;
    }
    hash
}

/// Number of hash buckets the format uses for `entries` entries.
pub fn bucket_count(entries: u32) -> u32 {
    match entries {
        0..3 => 3,
        3..19 => entries | 1,
        _ => {
            let mut count = entries;
            while [2, 3, 5, 7, 11, 13, 17].iter().any(|p| count % p == 0) {
                count += 1;
            }
            count
        }
    }
}

impl RomFs {
    /// Parse the header and all four tables from `storage`, which starts at
    /// the RomFS header.
    pub fn parse(storage: &SharedStorage) -> Result<Self> {
        let mut r = StorageReader::new(storage.clone());
        if le_u32(&mut r)? != HEADER_SIZE {
            return Err(Error::Parse("RomFS header size is not 0x28"));
        }
        let mut region = || -> Result<Region> {
            Ok(Region {
                offset: le_u32(&mut r)?,
                size: le_u32(&mut r)?,
            })
        };
        let dir_hash = region()?;
        let dir_meta = region()?;
        let file_hash = region()?;
        let file_meta = region()?;
        let data_offset = le_u32(&mut r)?;
        let header = RomFsHeader {
            dir_hash,
            dir_meta,
            file_hash,
            file_meta,
            data_offset,
        };

        for table in [dir_hash, dir_meta, file_hash, file_meta] {
            check_range(storage.len(), table.offset as u64, table.size as u64)?;
            if (table.offset as u64) < HEADER_SIZE as u64 {
                return Err(Error::Parse("RomFS table overlaps the header"));
            }
        }
        if data_offset as u64 > storage.len() {
            return Err(Error::InvalidRange);
        }
        if dir_hash.size % 4 != 0 || file_hash.size % 4 != 0 {
            return Err(Error::Parse("RomFS hash table size is not a multiple of 4"));
        }

        let (dirs, dir_links, dir_at) = decode_dirs(&read_vec(
            &**storage,
            dir_meta.offset as u64,
            dir_meta.size as usize,
        )?)?;
        let (files, file_links, file_at) = decode_files(&read_vec(
            &**storage,
            file_meta.offset as u64,
            file_meta.size as usize,
        )?)?;

        let dir_ref = |raw: u32| opt_ref(&dir_at, raw);
        let file_ref = |raw: u32| opt_ref(&file_at, raw);

        let dirs = dirs
            .into_iter()
            .zip(dir_links)
            .map(|((offset, name), l)| -> Result<RomFsDir> {
                Ok(RomFsDir {
                    offset,
                    parent: dir_ref(l.parent)?.ok_or(Error::Parse("RomFS directory has no parent"))?,
                    sibling: dir_ref(l.sibling)?,
                    first_child_dir: dir_ref(l.child_dir)?,
                    first_child_file: file_ref(l.child_file)?,
                    hash_sibling: dir_ref(l.hash_sibling)?,
                    name,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let files = files
            .into_iter()
            .zip(file_links)
            .map(|((offset, name, data_offset, data_size), l)| -> Result<RomFsFile> {
                Ok(RomFsFile {
                    offset,
                    parent: dir_ref(l.parent)?.ok_or(Error::Parse("RomFS file has no parent"))?,
                    sibling: file_ref(l.sibling)?,
                    hash_sibling: file_ref(l.hash_sibling)?,
                    name,
                    data_offset,
                    data_size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if dirs.first().is_none_or(|root| root.offset != 0) {
            return Err(Error::Parse("RomFS has no root directory"));
        }

        let buckets = |table: Region, at: &HashMap<u32, usize>| -> Result<Vec<Option<usize>>> {
            let raw = read_vec(&**storage, table.offset as u64, table.size as usize)?;
            raw.chunks_exact(4)
                .map(|c| opt_ref(at, u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect()
        };
        let dir_buckets = buckets(dir_hash, &dir_at)?;
        let file_buckets = buckets(file_hash, &file_at)?;

        debug!(
            dirs = dirs.len(),
            files = files.len(),
            data_offset,
            "parsed RomFS tables"
        );
        Ok(Self {
            header,
            dirs,
            files,
            dir_buckets,
            file_buckets,
        })
    }

    /// Build the snapshot. File windows are taken from `storage`, the same
    /// storage the tables were parsed from.
    ///
    /// Fails on cycles, duplicate paths and file data outside `storage`.
    pub fn mount(&self, storage: &SharedStorage) -> Result<VirtualFileSystem> {
        let mut vfs = VirtualFileSystem::new();
        let mut seen_dirs = HashSet::from([0usize]);
        let mut seen_files = HashSet::new();
        let mut pending = vec![(0usize, "/".to_string())];
        let data_base = self.header.data_offset as u64;

        while let Some((dir, path)) = pending.pop() {
            let mut child = self.dirs[dir].first_child_dir;
            while let Some(c) = child {
                if !seen_dirs.insert(c) {
                    return Err(Error::Parse("RomFS directory links form a cycle"));
                }
                let sub = vfs.add_dir(&path, &self.dirs[c].name)?;
                pending.push((c, sub));
                child = self.dirs[c].sibling;
            }
            let mut file = self.dirs[dir].first_child_file;
            while let Some(f) = file {
                if !seen_files.insert(f) {
                    return Err(Error::Parse("RomFS file links form a cycle"));
                }
                let entry = &self.files[f];
                let offset = data_base
                    .checked_add(entry.data_offset)
                    .ok_or(Error::InvalidRange)?;
                vfs.add_file(&path, &entry.name, storage, offset, entry.data_size)?;
                file = entry.sibling;
            }
        }
        debug!(
            dirs = vfs.dir_count(),
            files = vfs.file_count(),
            "mounted RomFS"
        );
        Ok(vfs)
    }

    /// Index of the directory at `path`, found through the hash buckets.
    pub fn find_dir(&self, path: &str) -> Option<usize> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(0usize, |dir, name| self.lookup_dir(dir, name))
    }

    /// The file at `path`, found through the hash buckets.
    pub fn find_file(&self, path: &str) -> Option<&RomFsFile> {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let parent = self.find_dir(dir)?;
        let bucket = self.bucket(&self.file_buckets, parent, name)?;
        let mut next = self.file_buckets[bucket];
        // Chains are bounded by the entry count; a longer one is a loop.
        for _ in 0..self.files.len() {
            let file = &self.files[next?];
            if file.parent == parent && file.name == name {
                return Some(file);
            }
            next = file.hash_sibling;
        }
        None
    }

    fn lookup_dir(&self, parent: usize, name: &str) -> Option<usize> {
        let bucket = self.bucket(&self.dir_buckets, parent, name)?;
        let mut next = self.dir_buckets[bucket];
        for _ in 0..self.dirs.len() {
            let index = next?;
            let dir = &self.dirs[index];
            if dir.parent == parent && dir.name == name && index != 0 {
                return Some(index);
            }
            next = dir.hash_sibling;
        }
        None
    }

    fn bucket(&self, buckets: &[Option<usize>], parent: usize, name: &str) -> Option<usize> {
        if buckets.is_empty() {
            return None;
        }
        let hash = path_hash(self.dirs[parent].offset, name);
        Some(hash as usize % buckets.len())
    }
}

fn opt_ref(at: &HashMap<u32, usize>, raw: u32) -> Result<Option<usize>> {
    if raw == NONE {
        return Ok(None);
    }
    at.get(&raw)
        .copied()
        .map(Some)
        .ok_or(Error::Parse("RomFS link does not point at an entry"))
}

/// Length of an entry with a `name_len`-byte name, padded to 4.
fn entry_len(fixed: usize, name_len: u32) -> Result<usize> {
    Ok(align_up(fixed as u64 + name_len as u64, 4)? as usize)
}

type DirRecords = (Vec<(u32, String)>, Vec<RawLinks>, HashMap<u32, usize>);
type FileRecords = (
    Vec<(u32, String, u64, u64)>,
    Vec<RawLinks>,
    HashMap<u32, usize>,
);

fn decode_dirs(table: &[u8]) -> Result<DirRecords> {
    let mut records = Vec::new();
    let mut links = Vec::new();
    let mut at = HashMap::new();
    let mut pos = 0usize;
    while pos < table.len() {
        if table.len() - pos < DIR_ENTRY_SIZE {
            return Err(Error::Parse("truncated RomFS directory entry"));
        }
        let name_len = le_u32_at(table, pos + 0x14)?;
        let len = entry_len(DIR_ENTRY_SIZE, name_len)?;
        if len > table.len() - pos {
            return Err(Error::Parse("truncated RomFS directory entry"));
        }
        let name = utf16_name(table, pos + DIR_ENTRY_SIZE, name_len as usize)?;
        links.push(RawLinks {
            parent: le_u32_at(table, pos)?,
            sibling: le_u32_at(table, pos + 0x04)?,
            child_dir: le_u32_at(table, pos + 0x08)?,
            child_file: le_u32_at(table, pos + 0x0C)?,
            hash_sibling: le_u32_at(table, pos + 0x10)?,
        });
        at.insert(pos as u32, records.len());
        records.push((pos as u32, name));
        pos += len;
    }
    Ok((records, links, at))
}

fn decode_files(table: &[u8]) -> Result<FileRecords> {
    let mut records = Vec::new();
    let mut links = Vec::new();
    let mut at = HashMap::new();
    let mut pos = 0usize;
    while pos < table.len() {
        if table.len() - pos < FILE_ENTRY_SIZE {
            return Err(Error::Parse("truncated RomFS file entry"));
        }
        let name_len = le_u32_at(table, pos + 0x1C)?;
        let len = entry_len(FILE_ENTRY_SIZE, name_len)?;
        if len > table.len() - pos {
            return Err(Error::Parse("truncated RomFS file entry"));
        }
        let name = utf16_name(table, pos + FILE_ENTRY_SIZE, name_len as usize)?;
        links.push(RawLinks {
            parent: le_u32_at(table, pos)?,
            sibling: le_u32_at(table, pos + 0x04)?,
            child_dir: NONE,
            child_file: NONE,
            hash_sibling: le_u32_at(table, pos + 0x18)?,
        });
        at.insert(pos as u32, records.len());
        records.push((
            pos as u32,
            name,
            le_u64_at(table, pos + 0x08)?,
            le_u64_at(table, pos + 0x10)?,
        ));
        pos += len;
    }
    Ok((records, links, at))
}
