/// Inode of the root directory.
pub const ROOT_INO: u64 = 1;

/// Hands out inode numbers. Lives inside the guarded tree, so callers
/// already hold the write lock when they allocate.
#[derive(Debug)]
pub struct InodeAllocator {
    next: u64,
}

impl InodeAllocator {
    pub fn new() -> Self {
        Self { next: ROOT_INO + 1 }
    }

    /// Allocate a fresh inode. Freed inodes are never handed out again.
    pub fn next(&mut self) -> u64 {
        let ino = self.next;
        self.next += 1;
        ino
    }

    /// The inode the next allocation will return.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for InodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}
