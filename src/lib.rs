pub mod config;
pub mod error;
pub mod fs;
pub mod seed;
pub mod tree;
