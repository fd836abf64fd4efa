/// Conversions between tree types and FUSE types.
use std::io;
use std::time::SystemTime;

use fuser::{Errno, FileAttr, FileType, INodeNo, TimeOrNow};

use crate::error::FsError;
use crate::tree::{NodeKind, Stat};

pub const BLOCK_SIZE: u32 = 512;

/// Convert a tree stat to fuser::FileAttr, owned by `uid`/`gid`.
pub fn stat_to_file_attr(st: &Stat, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: INodeNo(st.ino),
        size: st.size,
        blocks: st.size.div_ceil(BLOCK_SIZE as u64),
        atime: st.mtime,
        mtime: st.mtime,
        ctime: st.mtime,
        crtime: st.crtime,
        kind: kind_to_filetype(st.kind),
        perm: st.perm() as u16,
        nlink: st.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn kind_to_filetype(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
        NodeKind::Symlink => FileType::Symlink,
    }
}

pub fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => Errno::ENOENT,
            FsError::AlreadyExists => Errno::EEXIST,
            FsError::NotEmpty => Errno::ENOTEMPTY,
            FsError::NotADirectory => Errno::ENOTDIR,
            FsError::IsADirectory => Errno::EISDIR,
            FsError::InvalidTarget => Errno::from(io::Error::from_raw_os_error(libc::EPERM)),
            FsError::InvalidRange { .. } => Errno::EINVAL,
            FsError::FileTooLarge { .. } => Errno::from(io::Error::from_raw_os_error(libc::EFBIG)),
            FsError::UnsupportedAttribute(_) => Errno::ENOTSUP,
        }
    }
}
