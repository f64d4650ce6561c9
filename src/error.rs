//! Error types for decafdb

use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for decafdb operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// Key not found
    #[error("Key not found")]
    NotFound,

    /// Key already exists and overwrite is not permitted
    #[error("Key already exists")]
    KeyExists,

    /// Write attempted against a read-only environment
    #[error("Environment is read-only")]
    ReadOnly,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Map size exhausted; no page can be allocated
    #[error("Map full: map size exhausted")]
    MapFull,

    /// Database corruption detected
    #[error("Corruption detected: {details}")]
    Corruption {
        /// Description of the corruption
        details: String,
    },

    /// On-disk format version mismatch
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version
        expected: u32,
        /// Found version
        found: u32,
    },

    /// Another holder owns the exclusive lock
    #[error("Resource busy: exclusive lock held elsewhere")]
    Busy,

    /// Reader table full
    #[error("Reader table full")]
    ReadersFull,
}

/// Page number; the page lives at byte offset `pgno * PAGE_SIZE` in the file.
///
/// Pages 0 and 1 are the meta pages. Page 0 is reserved and never freed,
/// which lets pgno 0 double as "no page" in tree roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pgno(pub u64);

impl fmt::Display for Pgno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier; strictly increases with each successful commit.
///
/// `TxnId(0)` never names a committed transaction. It is the "free" marker
/// in reader slots and means "no readers" from the oldest-reader scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for decafdb operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
