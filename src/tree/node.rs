use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use super::attr::{Attr, NodeKind, Stat};
use crate::error::{FsError, Result};

/// Largest size a file may reach through write or truncate (8 GiB).
pub const MAX_FILE_SIZE: u64 = 1 << 33;

#[derive(Debug)]
pub enum Node {
    Directory(Directory),
    File(File),
    Symlink(Symlink),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Directory(_) => NodeKind::Directory,
            Node::File(_) => NodeKind::File,
            Node::Symlink(_) => NodeKind::Symlink,
        }
    }

    pub fn attr(&self) -> &Attr {
        match self {
            Node::Directory(d) => &d.attr,
            Node::File(f) => &f.attr,
            Node::Symlink(l) => &l.attr,
        }
    }

    pub fn attr_mut(&mut self) -> &mut Attr {
        match self {
            Node::Directory(d) => &mut d.attr,
            Node::File(f) => &mut f.attr,
            Node::Symlink(l) => &mut l.attr,
        }
    }

    pub fn as_dir(&self) -> Result<&Directory> {
        match self {
            Node::Directory(d) => Ok(d),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn as_dir_mut(&mut self) -> Result<&mut Directory> {
        match self {
            Node::Directory(d) => Ok(d),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn as_file(&self) -> Result<&File> {
        match self {
            Node::File(f) => Ok(f),
            Node::Directory(_) => Err(FsError::IsADirectory),
            Node::Symlink(_) => Err(FsError::InvalidTarget),
        }
    }

    pub fn as_file_mut(&mut self) -> Result<&mut File> {
        match self {
            Node::File(f) => Ok(f),
            Node::Directory(_) => Err(FsError::IsADirectory),
            Node::Symlink(_) => Err(FsError::InvalidTarget),
        }
    }
}

#[derive(Debug)]
pub struct Directory {
    pub attr: Attr,
    /// Inode of the directory holding this one. The root is its own parent.
    pub parent: u64,
    pub entries: HashMap<OsString, u64>,
}

impl Directory {
    pub fn new(attr: Attr, parent: u64) -> Self {
        Self {
            attr,
            parent,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, name: &OsStr) -> Option<u64> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &OsStr) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry, returning the inode it displaced.
    pub fn insert(&mut self, name: OsString, ino: u64) -> Option<u64> {
        let old = self.entries.insert(name, ino);
        self.attr.touch();
        old
    }

    pub fn remove(&mut self, name: &OsStr) -> Option<u64> {
        let ino = self.entries.remove(name);
        if ino.is_some() {
            self.attr.touch();
        }
        ino
    }
}

#[derive(Debug)]
pub struct File {
    pub attr: Attr,
    pub content: Vec<u8>,
    /// Directory entries referring to this file.
    pub nlink: u32,
    /// Open handles pinning this file.
    pub open: u32,
}

impl File {
    pub fn new(attr: Attr) -> Self {
        Self {
            attr,
            content: Vec::new(),
            nlink: 1,
            open: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Unreferenced and unpinned.
    pub fn is_reclaimable(&self) -> bool {
        self.nlink == 0 && self.open == 0
    }

    /// Up to `size` bytes from `offset`, cut short at end of content.
    pub fn read(&self, offset: u64, size: usize) -> Result<&[u8]> {
        let len = self.content.len();
        let start = usize::try_from(offset)
            .ok()
            .filter(|&start| start <= len)
            .ok_or(FsError::InvalidRange {
                offset,
                len: len as u64,
            })?;
        let end = start.saturating_add(size).min(len);
        Ok(&self.content[start..end])
    }

    /// Overwrite `[offset, offset + data.len())`, zero-filling any gap past the
    /// current end. Never shrinks the buffer. Nothing changes on error.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge { size: u64::MAX })?;
        self.grow_to(end)?;
        let start = offset as usize;
        self.content[start..start + data.len()].copy_from_slice(data);
        self.attr.touch();
        Ok(data.len())
    }

    /// Shrink or zero-extend to exactly `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if size < self.len() {
            self.content.truncate(size as usize);
            self.content.shrink_to_fit();
            return Ok(());
        }
        self.grow_to(size)
    }

    /// Zero-extend to at least `size` bytes, bounded by [`MAX_FILE_SIZE`] and
    /// by what the allocator can provide.
    fn grow_to(&mut self, size: u64) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge { size });
        }
        let size = usize::try_from(size).map_err(|_| FsError::FileTooLarge { size })?;
        if size > self.content.len() {
            self.content
                .try_reserve_exact(size - self.content.len())
                .map_err(|_| FsError::FileTooLarge { size: size as u64 })?;
            self.content.resize(size, 0);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Symlink {
    pub attr: Attr,
    target: PathBuf,
}

impl Symlink {
    pub fn new(attr: Attr, target: PathBuf) -> Self {
        Self { attr, target }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

pub(crate) fn stat_of(node: &Node, subdirs: u32) -> Stat {
    let attr = node.attr();
    let (size, nlink) = match node {
        Node::Directory(_) => (0, 2 + subdirs),
        Node::File(f) => (f.len(), f.nlink),
        Node::Symlink(l) => (l.target.as_os_str().len() as u64, 1),
    };
    Stat {
        ino: attr.ino,
        kind: node.kind(),
        mode: attr.mode,
        size,
        nlink,
        crtime: attr.crtime,
        mtime: attr.mtime,
    }
}
