//! Library-wide error and result types.

use std::io;

use thiserror::Error;

/// Result alias used throughout ctrkit.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Format errors are raised while a container is being opened and are never
/// repaired. Integrity errors are security relevant: the bytes that failed
/// are never handed to the caller and the failure is never retried.
#[derive(Debug, Error)]
pub enum Error {
    /// A magic/signature field did not match the expected value.
    #[error("bad magic value")]
    BadMagic,
    /// A format version is present in the data but not supported by this
    /// parser.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
    /// The stream ended before all expected bytes could be read.
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// A name field could not be decoded (bad UTF-16, or longer than its
    /// record).
    #[error("invalid entry name")]
    InvalidName,
    /// An offset or size field would read outside the valid region.
    #[error("invalid offset or size")]
    InvalidRange,
    /// A caller-supplied argument (key, IV, buffer, size) was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A structural constraint was violated (message describes which one).
    #[error("parse error: {0}")]
    Parse(&'static str),
    /// A hash-tree block or a section digest did not match its stored hash.
    #[error("integrity check failed for {what} {index}")]
    Integrity {
        /// What was being verified (`"block"`, `"exefs section"`, ...).
        what: &'static str,
        /// Block or section index within its table.
        index: u64,
    },
    /// No file or directory at this path in a mounted file system.
    #[error("not found: {0}")]
    NotFound(String),
    /// The key set has no key for the requested slot.
    #[error("missing key: {0}")]
    MissingKey(String),
    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Error::UnexpectedEof;
        }
        // Errors that crossed a `std::io` adapter come back as themselves.
        if !e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(e);
        }
        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Error::Io(kind.into()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            Error::UnexpectedEof => io::Error::from(io::ErrorKind::UnexpectedEof),
            other => io::Error::other(other),
        }
    }
}
