use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

/// Permission bits kept by setattr; the type bits are fixed at creation.
pub const PERM_MASK: u32 = 0o7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
}

impl NodeKind {
    /// The `S_IF*` bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            NodeKind::Directory => libc::S_IFDIR as u32,
            NodeKind::File => libc::S_IFREG as u32,
            NodeKind::Symlink => libc::S_IFLNK as u32,
        }
    }
}

/// Metadata stored on every node.
#[derive(Debug, Clone)]
pub struct Attr {
    pub ino: u64,
    /// Type and permission bits.
    pub mode: u32,
    pub crtime: SystemTime,
    pub mtime: SystemTime,
}

impl Attr {
    pub fn new(ino: u64, kind: NodeKind, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            mode: kind.type_bits() | (perm & PERM_MASK),
            crtime: now,
            mtime: now,
        }
    }

    pub fn perm(&self) -> u32 {
        self.mode & PERM_MASK
    }

    pub fn set_perm(&mut self, mode: u32) {
        self.mode = (self.mode & !PERM_MASK) | (mode & PERM_MASK);
    }

    pub fn touch(&mut self) {
        self.mtime = SystemTime::now();
    }
}

/// Point-in-time view of a node handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub kind: NodeKind,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub crtime: SystemTime,
    pub mtime: SystemTime,
}

impl Stat {
    pub fn perm(&self) -> u32 {
        self.mode & PERM_MASK
    }
}

/// Fields a setattr request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrField {
    Size,
    Mode,
    Uid,
    Gid,
    Atime,
    Mtime,
    Ctime,
    Crtime,
    Chgtime,
    Bkuptime,
    Flags,
    Handle,
}

impl fmt::Display for AttrField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrField::Size => "size",
            AttrField::Mode => "mode",
            AttrField::Uid => "uid",
            AttrField::Gid => "gid",
            AttrField::Atime => "atime",
            AttrField::Mtime => "mtime",
            AttrField::Ctime => "ctime",
            AttrField::Crtime => "crtime",
            AttrField::Chgtime => "chgtime",
            AttrField::Bkuptime => "bkuptime",
            AttrField::Flags => "flags",
            AttrField::Handle => "handle",
        };
        f.write_str(name)
    }
}

/// Fields a directory or symlink applies.
pub const DIR_HANDLED: &[AttrField] = &[AttrField::Mode, AttrField::Mtime];
/// Fields a directory or symlink accepts without applying.
pub const DIR_IGNORED: &[AttrField] = &[AttrField::Atime, AttrField::Handle, AttrField::Ctime];

pub const FILE_HANDLED: &[AttrField] = &[AttrField::Size, AttrField::Mode, AttrField::Mtime];
pub const FILE_IGNORED: &[AttrField] = &[
    AttrField::Atime,
    AttrField::Handle,
    AttrField::Ctime,
    AttrField::Uid,
    AttrField::Gid,
    AttrField::Flags,
];

/// An attribute update. Only the `Some` fields are requested.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub crtime: Option<SystemTime>,
    pub chgtime: Option<SystemTime>,
    pub bkuptime: Option<SystemTime>,
    pub flags: Option<u32>,
    pub handle: Option<u64>,
}

impl SetAttr {
    pub fn requested(&self) -> Vec<AttrField> {
        let mut fields = Vec::new();
        let mut push = |set: bool, field| {
            if set {
                fields.push(field);
            }
        };
        push(self.size.is_some(), AttrField::Size);
        push(self.mode.is_some(), AttrField::Mode);
        push(self.uid.is_some(), AttrField::Uid);
        push(self.gid.is_some(), AttrField::Gid);
        push(self.atime.is_some(), AttrField::Atime);
        push(self.mtime.is_some(), AttrField::Mtime);
        push(self.ctime.is_some(), AttrField::Ctime);
        push(self.crtime.is_some(), AttrField::Crtime);
        push(self.chgtime.is_some(), AttrField::Chgtime);
        push(self.bkuptime.is_some(), AttrField::Bkuptime);
        push(self.flags.is_some(), AttrField::Flags);
        push(self.handle.is_some(), AttrField::Handle);
        fields
    }

    /// Requested fields outside `handled` and `ignored`.
    pub fn unsupported(&self, handled: &[AttrField], ignored: &[AttrField]) -> Vec<AttrField> {
        self.requested()
            .into_iter()
            .filter(|f| !handled.contains(f) && !ignored.contains(f))
            .collect()
    }
}
