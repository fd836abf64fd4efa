use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memfs", about = "Volatile in-memory FUSE filesystem")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount an empty in-memory filesystem
    Mount {
        /// Path to the mount point
        mountpoint: PathBuf,

        /// Permission bits of the root directory, in octal
        #[arg(long, default_value = "777", value_parser = parse_mode)]
        mode: u32,

        /// Filesystem name shown in mount listings
        #[arg(long, default_value = "memfs")]
        fs_name: String,

        /// Log file path
        #[arg(long, default_value = "/tmp/memfs.log")]
        log_file: PathBuf,

        /// Start with the demo tree (/hello, /bar/burried)
        #[arg(long)]
        demo: bool,
    },
    /// Unmount a memfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct MemfsConfig {
    pub mountpoint: PathBuf,
    pub root_mode: u32,
    pub fs_name: String,
    pub log_file: PathBuf,
    pub demo: bool,
}

/// Parse an octal permission string such as `755` or `0o755`.
pub fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8).map_err(|e| format!("invalid mode {:?}: {}", s, e))?;
    if mode > 0o7777 {
        return Err(format!("mode {:o} has bits outside 7777", mode));
    }
    Ok(mode)
}
