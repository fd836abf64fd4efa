pub mod convert;
pub mod handles;

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fuser::{
    AccessFlags, BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags,
    Generation, INodeNo, KernelConfig, LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, RenameFlags,
    Request, TimeOrNow, WriteFlags,
};
use tracing::{debug, info, warn};

use self::convert::*;
use self::handles::HandleTable;
use crate::config::MemfsConfig;
use crate::error::{FsError, Result};
use crate::seed;
use crate::tree::{MemTree, SetAttr, Stat};

const TTL: Duration = Duration::from_secs(1);

/// Capacity advertised by statfs, in blocks of BLOCK_SIZE.
const TOTAL_BLOCKS: u64 = 1 << 24;
const TOTAL_INODES: u64 = u32::MAX as u64;
const MAX_NAME_LEN: u32 = 255;

pub struct MemFs {
    pub config: MemfsConfig,
    /// The node tree served at the mount point.
    pub tree: Arc<MemTree>,
    /// File handle table.
    pub file_handles: Arc<HandleTable>,
    /// Start time for uptime reporting.
    pub started_at: DateTime<Utc>,
    uid: u32,
    gid: u32,
}

impl MemFs {
    pub fn new(config: MemfsConfig) -> Self {
        let tree = Arc::new(MemTree::new(config.root_mode));
        if config.demo {
            if let Err(e) = seed::populate_demo(&tree) {
                warn!("Failed to populate demo tree: {}", e);
            }
        }

        Self {
            config,
            tree,
            file_handles: Arc::new(HandleTable::new()),
            started_at: Utc::now(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn file_attr(&self, st: &Stat) -> FileAttr {
        stat_to_file_attr(st, self.uid, self.gid)
    }

    fn reply_entry(&self, reply: ReplyEntry, res: Result<Stat>) {
        match res {
            Ok(st) => reply.entry(&TTL, &self.file_attr(&st), Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn reply_empty(reply: ReplyEmpty, res: Result<()>) {
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    /// Generate status JSON.
    pub fn status_json(&self) -> String {
        let uptime = (Utc::now() - self.started_at).num_seconds();
        serde_json::json!({
            "fs_name": self.config.fs_name,
            "mountpoint": self.config.mountpoint.display().to_string(),
            "started_at": self.started_at.to_rfc3339(),
            "uptime_seconds": uptime,
            "open_handles": self.file_handles.list_open(),
            "tree": self.tree.stats(),
        })
        .to_string()
    }
}

impl Filesystem for MemFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::io::Result<()> {
        info!(
            "memfs initialized, root mode={:#o}, nodes={}",
            self.config.root_mode,
            self.tree.stats().nodes()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("memfs shutting down: {}", self.status_json());
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let parent = u64::from(parent);
        debug!("lookup(parent={}, name={:?})", parent, name);
        self.reply_entry(reply, self.tree.lookup(parent, name));
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let ino = u64::from(ino);
        debug!("getattr(ino={})", ino);

        match self.tree.getattr(ino) {
            Ok(st) => reply.attr(&TTL, &self.file_attr(&st)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let ino = u64::from(ino);
        debug!("setattr(ino={}, size={:?}, mode={:?})", ino, size, mode);

        let update = SetAttr {
            size,
            mode,
            uid,
            gid,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            ctime,
            crtime,
            chgtime,
            bkuptime,
            flags: flags.map(|f| f.bits()),
            handle: fh.map(u64::from),
        };

        match self.tree.setattr(ino, &update) {
            Ok(st) => reply.attr(&TTL, &self.file_attr(&st)),
            Err(e) => {
                if let FsError::UnsupportedAttribute(_) = e {
                    warn!("setattr(ino={}) rejected: {}", ino, e);
                }
                reply.error(Errno::from(e));
            }
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let ino = u64::from(ino);
        let raw_flags = flags.0;
        debug!("open(ino={}, flags={})", ino, raw_flags);

        match self.tree.open(ino) {
            Ok(()) => {
                let fh = self.file_handles.alloc(ino, raw_flags, req.pid());
                reply.opened(FileHandle(fh), FopenFlags::empty());
            }
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.tree.read(ino, offset, size as usize) {
            Ok(data) => reply.data(&data),
            // Past end of file: the kernel expects a short (empty) read.
            Err(FsError::InvalidRange { .. }) => reply.data(&[]),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("write(ino={}, fh={}, offset={}, size={})", ino, fh, offset, data.len());

        match self.tree.write(ino, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => {
                warn!("write(ino={}, offset={}) failed: {}", ino, offset, e);
                reply.error(Errno::from(e));
            }
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fh = u64::from(fh);
        debug!("release(fh={})", fh);

        if let Some(handle) = self.file_handles.remove(fh) {
            if let Err(e) = self.tree.release(handle.ino) {
                debug!("release(fh={}, ino={}): {}", fh, handle.ino, e);
            }
        }
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let ino = u64::from(ino);
        debug!("readdir(ino={}, offset={})", ino, offset);

        let listing = self
            .tree
            .parent(ino)
            .and_then(|parent| self.tree.list(ino).map(|entries| (parent, entries)));
        let (parent, mut children) = match listing {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(Errno::from(e));
                return;
            }
        };

        // Entries come back unordered; sort so offsets stay stable across
        // the kernel's paginated calls.
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let mut all_entries: Vec<(u64, FileType, OsString)> = Vec::with_capacity(children.len() + 2);
        all_entries.push((ino, FileType::Directory, OsString::from(".")));
        all_entries.push((parent, FileType::Directory, OsString::from("..")));
        all_entries.extend(
            children
                .into_iter()
                .map(|e| (e.ino, kind_to_filetype(e.kind), e.name)),
        );

        for (i, (entry_ino, kind, name)) in all_entries.iter().enumerate().skip(offset as usize) {
            if reply.add(INodeNo(*entry_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent = u64::from(parent);
        debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);

        let st = match self.tree.create_open(parent, name, mode) {
            Ok(st) => st,
            Err(e) => {
                reply.error(Errno::from(e));
                return;
            }
        };

        let fh = self.file_handles.alloc(st.ino, flags, req.pid());
        reply.created(&TTL, &self.file_attr(&st), Generation(0), FileHandle(fh), FopenFlags::empty());
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        self.reply_entry(reply, self.tree.mkdir(parent, name, mode));
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("unlink(parent={}, name={:?})", parent, name);
        Self::reply_empty(reply, self.tree.unlink(parent, name));
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("rmdir(parent={}, name={:?})", parent, name);
        Self::reply_empty(reply, self.tree.rmdir(parent, name));
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let parent = u64::from(parent);
        let newparent = u64::from(newparent);
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        Self::reply_empty(reply, self.tree.rename(parent, name, newparent, newname));
    }

    fn symlink(
        &self,
        _req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        self.reply_entry(reply, self.tree.symlink(parent, link_name, target));
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let ino = u64::from(ino);
        debug!("readlink(ino={})", ino);

        match self.tree.readlink(ino) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let ino = u64::from(ino);
        let newparent = u64::from(newparent);
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        self.reply_entry(reply, self.tree.link(ino, newparent, newname));
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let stats = self.tree.stats();
        let used = stats.bytes.div_ceil(BLOCK_SIZE as u64);
        let free = TOTAL_BLOCKS.saturating_sub(used);
        reply.statfs(
            TOTAL_BLOCKS,
            free,
            free,
            TOTAL_INODES,
            TOTAL_INODES.saturating_sub(stats.nodes()),
            BLOCK_SIZE,
            MAX_NAME_LEN,
            BLOCK_SIZE,
        );
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        debug!("access(ino={}, mask={:?})", ino, mask);
        Self::reply_empty(reply, self.tree.getattr(ino).map(|_| ()));
    }
}
