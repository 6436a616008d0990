use std::fmt;

use crate::base::Key;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Underlying file or mmap failure, surfaced verbatim.
    Io(std::io::Error),
    /// Header carries a format version this build does not understand.
    UnsupportedVersion(u32),
    /// Header offsets or block contents do not describe a well-formed file.
    CorruptLayout(String),
    /// Metadata or groups directory is not valid JSON.
    MetadataParse(serde_json::Error),
    /// Key out of range, tombstoned, or excluded by the open-time restriction.
    UnknownKey(Key),
    /// Group name not present in the directory.
    UnknownGroup(String),
    /// Group references a key that is not live in the lookup table.
    DanglingKey { group: String, key: Key },
    /// Key space exhausted (keys are u32).
    OutOfKeys,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::UnsupportedVersion(v) => write!(f, "Unsupported format version: {}", v),
            Error::CorruptLayout(msg) => write!(f, "Corrupt layout: {}", msg),
            Error::MetadataParse(e) => write!(f, "Metadata parse error: {}", e),
            Error::UnknownKey(key) => write!(f, "Unknown key: {}", key),
            Error::UnknownGroup(name) => write!(f, "Unknown group: {}", name),
            Error::DanglingKey { group, key } => {
                write!(f, "Group {:?} references nonexistent key {}", group, key)
            }
            Error::OutOfKeys => write!(f, "Key space exhausted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MetadataParse(err)
    }
}
