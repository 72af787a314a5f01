use std::error::Error as StdError;
use std::fmt::{self, Display};

/// Typed errors for index files and the docid map. Anything else propagates
/// as `anyhow::Error` with context attached at the call site.
#[derive(Debug)]
pub enum Error {
    /// Magic, version or trailer checksum mismatch on open.
    BadHeader(String),
    /// Structurally invalid index data (truncated varint, unsorted
    /// directory, non-ascending posting list, offset out of bounds).
    Corrupt(String),
    /// Docid lookup past the end of the docid map.
    OutOfRange(u32),
    /// Append to a docid map that has already been serialized.
    AlreadyFrozen,
    /// A shard merge is already running.
    MergeInProgress,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadHeader(s) => write!(f, "bad index header: {}", s),
            Error::Corrupt(s) => write!(f, "corrupt index: {}", s),
            Error::OutOfRange(docid) => write!(f, "docid {} out of range", docid),
            Error::AlreadyFrozen => write!(f, "docid map already frozen"),
            Error::MergeInProgress => write!(f, "merge already in progress, try again later"),
        }
    }
}

impl StdError for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Corrupt(e.to_string())
    }
}
