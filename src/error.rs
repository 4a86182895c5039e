//! Error taxonomy for docpane
//!
//! One crate-wide error enum. Protocol errors (`StaleBase`, `VersionTooOld`)
//! are recoverable by the client resyncing; `MalformedTree` is recoverable by
//! dropping the offending window; I/O errors abort the operation with
//! in-memory state unchanged.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Path not tracked by authority or tree: {0}")]
    NotFound(PathBuf),

    #[error("No such node in layout tree: {0}")]
    NodeNotFound(u64),

    #[error("No such window: {0}")]
    WindowNotFound(String),

    #[error("Malformed layout tree: {0}")]
    MalformedTree(String),

    #[error("Stale base version {submitted}, authority is at {current}")]
    StaleBase { submitted: u64, current: u64 },

    #[error("Version {requested} predates retained update history (oldest is {oldest})")]
    VersionTooOld { requested: u64, oldest: u64 },

    #[error("Update edit range {from}..{to} outside document of length {len}")]
    InvalidUpdate { from: usize, to: usize, len: usize },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("I/O failure: {0}")]
    Io(#[source] io::Error),

    #[error("Document service is shut down")]
    ServiceClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an I/O error against the path that produced it.
    pub fn from_io(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_path_buf()),
            _ => Error::Io(err),
        }
    }

    /// True if the client can recover by re-fetching the document and
    /// resubmitting (protocol misuse by a stale client, not a hard failure).
    pub fn is_resyncable(&self) -> bool {
        matches!(self, Error::StaleBase { .. } | Error::VersionTooOld { .. })
    }
}
