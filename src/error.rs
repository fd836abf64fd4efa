use thiserror::Error;

use crate::tree::attr::AttrField;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,

    #[error("entry exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("invalid target for this operation")]
    InvalidTarget,

    #[error("offset {offset} is out of range for length {len}")]
    InvalidRange { offset: u64, len: u64 },

    #[error("file size {size} exceeds the limit")]
    FileTooLarge { size: u64 },

    #[error("unsupported attribute update: {}", field_list(.0))]
    UnsupportedAttribute(Vec<AttrField>),
}

fn field_list(fields: &[AttrField]) -> String {
    fields
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, FsError>;
