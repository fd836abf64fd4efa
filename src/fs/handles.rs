use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize)]
pub struct HandleState {
    /// The file handle ID handed to the kernel.
    pub fh: u64,
    /// Inode of the open file.
    pub ino: u64,
    /// Open flags.
    pub flags: i32,
    /// PID of the process that opened this handle.
    pub pid: u32,
}

pub struct HandleTable {
    handles: DashMap<u64, HandleState>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, ino: u64, flags: i32, pid: u32) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, HandleState { fh, ino, flags, pid });
        fh
    }

    /// Snapshot of all open handles, ordered by handle ID.
    pub fn list_open(&self) -> Vec<HandleState> {
        let mut open: Vec<HandleState> = self.handles.iter().map(|e| e.value().clone()).collect();
        open.sort_by_key(|h| h.fh);
        open
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
