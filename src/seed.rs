use tracing::info;

use crate::error::Result;
use crate::tree::MemTree;

pub const HELLO_CONTENT: &[u8] = b"hello from fuse\n";
pub const BURRIED_CONTENT: &[u8] = b"nothing to see here\n";

/// Populate a fresh tree with the demo layout:
///
/// ```text
/// /bar/          (inode 2)
/// /hello         (inode 3)
/// /bar/burried   (inode 4)
/// ```
pub fn populate_demo(tree: &MemTree) -> Result<()> {
    let root = tree.root();
    let bar = tree.mkdir(root, "bar", 0o777)?;
    let hello = tree.create(root, "hello", 0o666)?;
    tree.write(hello.ino, 0, HELLO_CONTENT)?;
    let burried = tree.create(bar.ino, "burried", 0o666)?;
    tree.write(burried.ino, 0, BURRIED_CONTENT)?;
    info!("demo tree populated");
    Ok(())
}
