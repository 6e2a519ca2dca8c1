//! Mounted snapshot of a container's file tree.
//!
//! Every walker in [`crate::formats`] produces a [`VirtualFileSystem`]: two
//! path-sorted maps, one for directories and one for files. Paths are
//! absolute and `/`-separated; the root is `/`.
//!
//! A [`FileNode`] does not hold file data. It remembers a window into the
//! storage the snapshot was built from (or an already verified in-memory
//! copy) and builds its [`SharedStorage`] view the first time it is asked.
//! The snapshot therefore keeps the underlying storage alive for as long as
//! it exists.

use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::OnceLock;

use crate::storage::{SharedStorage, StorageReader, SubStorage, check_range, read_vec};
use crate::{Error, Result};

/// A directory in a mounted snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    /// Absolute path (`/` for the root).
    pub path: String,
    /// Last path component (empty for the root).
    pub name: String,
    /// Names of child directories, in container order.
    pub dirs: Vec<String>,
    /// Names of child files, in container order.
    pub files: Vec<String>,
}

#[derive(Debug)]
enum FileSource {
    Window { base: SharedStorage, offset: u64 },
    Loaded(SharedStorage),
}

/// A file in a mounted snapshot.
#[derive(Debug)]
pub struct FileNode {
    /// Absolute path.
    pub path: String,
    /// Last path component.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    source: FileSource,
    view: OnceLock<SharedStorage>,
}

impl FileNode {
    /// Storage holding exactly this file's bytes.
    pub fn storage(&self) -> Result<SharedStorage> {
        if let Some(view) = self.view.get() {
            return Ok(view.clone());
        }
        let view = match &self.source {
            FileSource::Window { base, offset } => SubStorage::shared(base, *offset, self.size)?,
            FileSource::Loaded(storage) => storage.clone(),
        };
        Ok(self.view.get_or_init(|| view).clone())
    }

    /// A fresh `Read + Seek` cursor over the file.
    pub fn reader(&self) -> Result<StorageReader> {
        Ok(StorageReader::new(self.storage()?))
    }

    /// Read the whole file into memory.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.size).map_err(|_| Error::InvalidRange)?;
        read_vec(&*self.storage()?, 0, size)
    }
}

/// Path-indexed snapshot of a mounted container.
#[derive(Debug)]
pub struct VirtualFileSystem {
    dirs: BTreeMap<String, DirectoryNode>,
    files: BTreeMap<String, FileNode>,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    /// A snapshot holding only the root directory.
    pub fn new() -> Self {
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "/".to_string(),
            DirectoryNode {
                path: "/".to_string(),
                name: String::new(),
                dirs: Vec::new(),
                files: Vec::new(),
            },
        );
        Self {
            dirs,
            files: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &DirectoryNode {
        &self.dirs["/"]
    }

    pub fn dir(&self, path: &str) -> Option<&DirectoryNode> {
        self.dirs.get(path)
    }

    pub fn file(&self, path: &str) -> Option<&FileNode> {
        self.files.get(path)
    }

    /// All directories, sorted by path.
    pub fn dirs(&self) -> impl Iterator<Item = &DirectoryNode> {
        self.dirs.values()
    }

    /// All files, sorted by path.
    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.files.values()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Directory count, root included.
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Storage of the file at `path`.
    pub fn open(&self, path: &str) -> Result<SharedStorage> {
        self.files
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?
            .storage()
    }

    /// Add directory `name` under `parent` and return its path.
    pub(crate) fn add_dir(&mut self, parent: &str, name: &str) -> Result<String> {
        let path = self.child_path(parent, name)?;
        self.dirs.insert(
            path.clone(),
            DirectoryNode {
                path: path.clone(),
                name: name.to_string(),
                dirs: Vec::new(),
                files: Vec::new(),
            },
        );
        if let Some(p) = self.dirs.get_mut(parent) {
            p.dirs.push(name.to_string());
        }
        Ok(path)
    }

    /// Add file `name` under `parent`, backed by `size` bytes of `base`
    /// starting at `offset`.
    pub(crate) fn add_file(
        &mut self,
        parent: &str,
        name: &str,
        base: &SharedStorage,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        check_range(base.len(), offset, size)?;
        let source = FileSource::Window {
            base: base.clone(),
            offset,
        };
        self.insert_file(parent, name, size, source)
    }

    /// Add file `name` under `parent` whose bytes are all of `storage`.
    pub(crate) fn add_loaded_file(
        &mut self,
        parent: &str,
        name: &str,
        storage: SharedStorage,
    ) -> Result<()> {
        let size = storage.len();
        self.insert_file(parent, name, size, FileSource::Loaded(storage))
    }

    fn insert_file(&mut self, parent: &str, name: &str, size: u64, source: FileSource) -> Result<()> {
        let path = self.child_path(parent, name)?;
        self.files.insert(
            path.clone(),
            FileNode {
                path,
                name: name.to_string(),
                size,
                source,
                view: OnceLock::new(),
            },
        );
        if let Some(p) = self.dirs.get_mut(parent) {
            p.files.push(name.to_string());
        }
        Ok(())
    }

    fn child_path(&self, parent: &str, name: &str) -> Result<String> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::InvalidName);
        }
        if !self.dirs.contains_key(parent) {
            return Err(Error::NotFound(parent.to_string()));
        }
        let path = if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        };
        if self.dirs.contains_key(&path) || self.files.contains_key(&path) {
            return Err(Error::Parse("duplicate path in file table"));
        }
        Ok(path)
    }
}

impl Index<&str> for VirtualFileSystem {
    type Output = FileNode;

    /// Index by absolute file path.
    ///
    /// # Panics
    /// Panics if there is no file at `index`.
    fn index(&self, index: &str) -> &Self::Output {
        self.file(index)
            .unwrap_or_else(|| panic!("no file '{index}' in snapshot"))
    }
}
