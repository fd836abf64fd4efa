//! The in-memory node tree.
//!
//! Nodes live in an arena keyed by inode; directory entries hold inode
//! numbers. A single reader/writer lock guards the whole arena together with
//! the inode allocator, so every public operation is atomic with respect to
//! every other one.

pub mod attr;
pub mod inodes;
pub mod node;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

pub use self::attr::{AttrField, NodeKind, SetAttr, Stat};
pub use self::inodes::ROOT_INO;
pub use self::node::MAX_FILE_SIZE;
pub use crate::error::{FsError, Result};

use self::attr::{Attr, DIR_HANDLED, DIR_IGNORED, FILE_HANDLED, FILE_IGNORED};
use self::inodes::InodeAllocator;
use self::node::{stat_of, Directory, File, Node, Symlink};

/// Permission bits given to every symlink.
const SYMLINK_PERM: u32 = 0o444;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: NodeKind,
    pub ino: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    /// Files with no directory entry, kept alive by open handles.
    pub orphans: u64,
    /// Total bytes held in file buffers.
    pub bytes: u64,
    pub next_inode: u64,
}

impl TreeStats {
    pub fn nodes(&self) -> u64 {
        self.directories + self.files + self.symlinks
    }
}

pub struct MemTree {
    inner: RwLock<Tree>,
}

impl MemTree {
    /// A tree holding only the root directory, with permission bits `root_mode`.
    pub fn new(root_mode: u32) -> Self {
        let root = Directory::new(Attr::new(ROOT_INO, NodeKind::Directory, root_mode), ROOT_INO);
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::Directory(root));
        Self {
            inner: RwLock::new(Tree {
                nodes,
                inodes: InodeAllocator::new(),
            }),
        }
    }

    pub fn root(&self) -> u64 {
        ROOT_INO
    }

    pub fn getattr(&self, ino: u64) -> Result<Stat> {
        self.inner.read().stat(ino)
    }

    /// Exact-match lookup of `name` in directory `parent`.
    pub fn lookup(&self, parent: u64, name: impl AsRef<OsStr>) -> Result<Stat> {
        let tree = self.inner.read();
        let ino = tree.dir(parent)?.get(name.as_ref()).ok_or(FsError::NotFound)?;
        tree.stat(ino)
    }

    /// Every entry of directory `dir`, in no particular order.
    pub fn list(&self, dir: u64) -> Result<Vec<DirEntry>> {
        let tree = self.inner.read();
        let dir = tree.dir(dir)?;
        dir.entries
            .iter()
            .map(|(name, &ino)| {
                Ok(DirEntry {
                    name: name.clone(),
                    kind: tree.node(ino)?.kind(),
                    ino,
                })
            })
            .collect()
    }

    /// Inode of the directory containing `dir`. The root is its own parent.
    pub fn parent(&self, dir: u64) -> Result<u64> {
        Ok(self.inner.read().dir(dir)?.parent)
    }

    pub fn mkdir(&self, parent: u64, name: impl AsRef<OsStr>, mode: u32) -> Result<Stat> {
        self.inner.write().insert_new(parent, name.as_ref(), |ino| {
            Node::Directory(Directory::new(
                Attr::new(ino, NodeKind::Directory, mode),
                parent,
            ))
        })
    }

    pub fn create(&self, parent: u64, name: impl AsRef<OsStr>, mode: u32) -> Result<Stat> {
        self.inner.write().insert_new(parent, name.as_ref(), |ino| {
            Node::File(File::new(Attr::new(ino, NodeKind::File, mode)))
        })
    }

    /// Create a file and pin it for an open handle in one step, so no
    /// concurrent unlink can reclaim it in between.
    pub fn create_open(&self, parent: u64, name: impl AsRef<OsStr>, mode: u32) -> Result<Stat> {
        let mut tree = self.inner.write();
        let st = tree.insert_new(parent, name.as_ref(), |ino| {
            Node::File(File::new(Attr::new(ino, NodeKind::File, mode)))
        })?;
        tree.node_mut(st.ino)?.as_file_mut()?.open += 1;
        Ok(st)
    }

    pub fn symlink(
        &self,
        parent: u64,
        name: impl AsRef<OsStr>,
        target: impl AsRef<Path>,
    ) -> Result<Stat> {
        let target = target.as_ref().to_path_buf();
        self.inner.write().insert_new(parent, name.as_ref(), |ino| {
            Node::Symlink(Symlink::new(
                Attr::new(ino, NodeKind::Symlink, SYMLINK_PERM),
                target,
            ))
        })
    }

    /// Add entry `name` in `parent` referring to the existing file `target`.
    /// Only files can be hard-linked.
    pub fn link(&self, target: u64, parent: u64, name: impl AsRef<OsStr>) -> Result<Stat> {
        let name = name.as_ref();
        let mut tree = self.inner.write();
        if tree.node(target)?.kind() != NodeKind::File {
            return Err(FsError::InvalidTarget);
        }
        if tree.dir(parent)?.contains(name) {
            return Err(FsError::AlreadyExists);
        }
        tree.node_mut(target)?.as_file_mut()?.nlink += 1;
        tree.dir_mut(parent)?.insert(name.to_os_string(), target);
        tree.stat(target)
    }

    pub fn readlink(&self, ino: u64) -> Result<PathBuf> {
        match self.inner.read().node(ino)? {
            Node::Symlink(link) => Ok(link.target().to_path_buf()),
            _ => Err(FsError::InvalidTarget),
        }
    }

    /// Remove entry `name` whatever it refers to. Non-empty directories are
    /// refused.
    pub fn remove(&self, parent: u64, name: impl AsRef<OsStr>) -> Result<()> {
        self.inner.write().remove_where(parent, name.as_ref(), |_| Ok(()))
    }

    /// Remove a non-directory entry.
    pub fn unlink(&self, parent: u64, name: impl AsRef<OsStr>) -> Result<()> {
        self.inner
            .write()
            .remove_where(parent, name.as_ref(), |node| match node {
                Node::Directory(_) => Err(FsError::IsADirectory),
                _ => Ok(()),
            })
    }

    /// Remove an empty directory entry.
    pub fn rmdir(&self, parent: u64, name: impl AsRef<OsStr>) -> Result<()> {
        self.inner
            .write()
            .remove_where(parent, name.as_ref(), |node| node.as_dir().map(|_| ()))
    }

    /// Move entry `name` of `parent` to `newname` in `newparent`.
    ///
    /// An existing entry at the destination is replaced whatever its kind,
    /// including a non-empty directory, whose whole subtree is dropped.
    pub fn rename(
        &self,
        parent: u64,
        name: impl AsRef<OsStr>,
        newparent: u64,
        newname: impl AsRef<OsStr>,
    ) -> Result<()> {
        self.inner
            .write()
            .rename(parent, name.as_ref(), newparent, newname.as_ref())
    }

    pub fn setattr(&self, ino: u64, req: &SetAttr) -> Result<Stat> {
        self.inner.write().setattr(ino, req)
    }

    pub fn read(&self, ino: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let tree = self.inner.read();
        let file = tree.node(ino)?.as_file()?;
        file.read(offset, size).map(<[u8]>::to_vec)
    }

    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.inner
            .write()
            .node_mut(ino)?
            .as_file_mut()?
            .write(offset, data)
    }

    /// Pin file `ino` for an open handle.
    pub fn open(&self, ino: u64) -> Result<()> {
        self.inner.write().node_mut(ino)?.as_file_mut()?.open += 1;
        Ok(())
    }

    /// Drop a pin taken by [`MemTree::open`], reclaiming the file if it has
    /// no entries left.
    pub fn release(&self, ino: u64) -> Result<()> {
        let mut tree = self.inner.write();
        let file = tree.node_mut(ino)?.as_file_mut()?;
        file.open = file.open.saturating_sub(1);
        if file.is_reclaimable() {
            tree.nodes.remove(&ino);
            debug!("reclaimed orphan ino={}", ino);
        }
        Ok(())
    }

    pub fn stats(&self) -> TreeStats {
        let tree = self.inner.read();
        let mut stats = TreeStats {
            next_inode: tree.inodes.peek(),
            ..TreeStats::default()
        };
        for node in tree.nodes.values() {
            match node {
                Node::Directory(_) => stats.directories += 1,
                Node::Symlink(_) => stats.symlinks += 1,
                Node::File(f) => {
                    stats.files += 1;
                    stats.bytes += f.len();
                    if f.nlink == 0 {
                        stats.orphans += 1;
                    }
                }
            }
        }
        stats
    }
}

/// The guarded state. Every method assumes the caller holds the lock.
struct Tree {
    nodes: HashMap<u64, Node>,
    inodes: InodeAllocator,
}

impl Tree {
    fn node(&self, ino: u64) -> Result<&Node> {
        self.nodes.get(&ino).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(FsError::NotFound)
    }

    fn dir(&self, ino: u64) -> Result<&Directory> {
        self.node(ino)?.as_dir()
    }

    fn dir_mut(&mut self, ino: u64) -> Result<&mut Directory> {
        self.node_mut(ino)?.as_dir_mut()
    }

    fn stat(&self, ino: u64) -> Result<Stat> {
        let node = self.node(ino)?;
        let subdirs = match node {
            Node::Directory(dir) => dir
                .entries
                .values()
                .filter(|child| matches!(self.nodes.get(child), Some(Node::Directory(_))))
                .count() as u32,
            _ => 0,
        };
        Ok(stat_of(node, subdirs))
    }

    fn insert_new(
        &mut self,
        parent: u64,
        name: &OsStr,
        make: impl FnOnce(u64) -> Node,
    ) -> Result<Stat> {
        if self.dir(parent)?.contains(name) {
            return Err(FsError::AlreadyExists);
        }
        let ino = self.inodes.next();
        self.nodes.insert(ino, make(ino));
        self.dir_mut(parent)?.insert(name.to_os_string(), ino);
        self.stat(ino)
    }

    fn remove_where(
        &mut self,
        parent: u64,
        name: &OsStr,
        check: impl FnOnce(&Node) -> Result<()>,
    ) -> Result<()> {
        let ino = self.dir(parent)?.get(name).ok_or(FsError::NotFound)?;
        let node = self.node(ino)?;
        check(node)?;
        if let Node::Directory(dir) = node {
            if !dir.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        self.dir_mut(parent)?.remove(name);
        self.drop_ref(ino);
        Ok(())
    }

    fn rename(&mut self, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr) -> Result<()> {
        let ino = self.dir(parent)?.get(name).ok_or(FsError::NotFound)?;
        let replaced = self.dir(newparent)?.get(newname);
        if replaced == Some(ino) {
            return Ok(());
        }

        // Neither a directory moved under itself nor a replaced directory
        // holding the source may end up detached from the root.
        if matches!(self.node(ino)?, Node::Directory(_)) && self.is_ancestor(ino, newparent)? {
            return Err(FsError::InvalidTarget);
        }
        if let Some(old) = replaced {
            if matches!(self.node(old)?, Node::Directory(_)) && self.is_ancestor(old, parent)? {
                return Err(FsError::InvalidTarget);
            }
        }

        self.dir_mut(parent)?.remove(name);
        self.dir_mut(newparent)?.insert(newname.to_os_string(), ino);
        if let Node::Directory(dir) = self.node_mut(ino)? {
            dir.parent = newparent;
        }
        if let Some(old) = replaced {
            debug!("rename replaced ino={} at {:?}", old, newname);
            self.drop_ref(old);
        }
        Ok(())
    }

    /// Whether directory `ancestor` is `dir` or lies on its path to the root.
    fn is_ancestor(&self, ancestor: u64, dir: u64) -> Result<bool> {
        let mut cur = dir;
        loop {
            if cur == ancestor {
                return Ok(true);
            }
            if cur == ROOT_INO {
                return Ok(false);
            }
            cur = self.dir(cur)?.parent;
        }
    }

    /// Drop the reference a removed entry held on `ino`, reclaiming whatever
    /// becomes unreachable.
    fn drop_ref(&mut self, ino: u64) {
        let mut pending = vec![ino];
        while let Some(ino) = pending.pop() {
            let reclaim = match self.nodes.get_mut(&ino) {
                Some(Node::File(file)) => {
                    file.nlink = file.nlink.saturating_sub(1);
                    file.is_reclaimable()
                }
                Some(_) => true,
                None => false,
            };
            if !reclaim {
                continue;
            }
            if let Some(Node::Directory(dir)) = self.nodes.remove(&ino) {
                pending.extend(dir.entries.into_values());
            }
            debug!("reclaimed ino={}", ino);
        }
    }

    fn setattr(&mut self, ino: u64, req: &SetAttr) -> Result<Stat> {
        let node = self.node_mut(ino)?;
        let (handled, ignored) = match node {
            Node::File(_) => (FILE_HANDLED, FILE_IGNORED),
            Node::Directory(_) | Node::Symlink(_) => (DIR_HANDLED, DIR_IGNORED),
        };
        let unsupported = req.unsupported(handled, ignored);
        if !unsupported.is_empty() {
            return Err(FsError::UnsupportedAttribute(unsupported));
        }

        if let Some(size) = req.size {
            node.as_file_mut()?.truncate(size)?;
            node.attr_mut().touch();
        }
        if let Some(mode) = req.mode {
            node.attr_mut().set_perm(mode);
        }
        if let Some(mtime) = req.mtime {
            node.attr_mut().mtime = mtime;
        }
        self.stat(ino)
    }
}
