//! Declare an error type for the veil-dirmgr crate.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::docs::Flavor;

/// An error produced by the external document parser.
///
/// The parser is outside this crate; we treat its failures as opaque
/// strings and never try to recover structure from them.
#[derive(Error, Debug, Clone)]
#[error("{msg}")]
pub struct ParseError {
    /// The parser's own description of what went wrong.
    msg: String,
}

impl ParseError {
    /// Construct a new `ParseError` from a message.
    pub fn new<S: Into<String>>(msg: S) -> Self {
        ParseError { msg: msg.into() }
    }
}

/// An error originated by the directory manager code.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A document could not be parsed at all.
    #[error("Unparseable directory document")]
    BadParse(#[source] ParseError),
    /// A consensus had a different flavor than the one we required.
    #[error("Got a {got} consensus where a {want} consensus was required")]
    WrongFlavor {
        /// The flavor the caller insisted on.
        want: Flavor,
        /// The flavor the document actually had.
        got: Flavor,
    },
    /// A consensus was byte-identical to the one we already have.
    #[error("Consensus duplicates the one we already have")]
    DuplicateConsensus,
    /// A consensus was not newer than the one we already have.
    #[error("Consensus is not newer than the one we already have")]
    StaleConsensus,
    /// A document claimed to be published further in the future than our
    /// clock-skew tolerance allows.
    #[error("Document timestamps are too far in the future; is our clock wrong?")]
    ClockSkew,
    /// A cached consensus was too old to be worth loading.
    #[error("Cached consensus is too old to use")]
    ObsoleteConsensus,
    /// A consensus did not carry enough good signatures from recognized
    /// authorities, even counting certificates we might still fetch.
    #[error("Not enough recognized signatures on consensus: {0}")]
    InsufficientSignatures(String),
    /// A consensus is parked waiting for certificates and cannot be
    /// installed yet.
    #[error("Consensus is still waiting for authority certificates")]
    NeedCerts,
    /// We received a document we didn't want at all.
    #[error("Received an object we didn't ask for: {0}")]
    Unwanted(&'static str),
    /// We couldn't read something from disk that we should have been
    /// able to read.
    #[error("Corrupt cache: {0}")]
    CacheCorruption(&'static str),
    /// Error while accessing a file in the store.
    #[error("Error while {action} cache file {}", fname.display())]
    CacheFile {
        /// What we were doing when we encountered the error.
        action: &'static str,
        /// The file that we were trying to access.
        fname: PathBuf,
        /// The underlying IO error.
        #[source]
        error: Arc<std::io::Error>,
    },
    /// A problem accessing our data directory (for example, no such
    /// directory, or bad permissions on it).
    #[error("Problem accessing data directory")]
    CacheAccess(#[from] fs_mistrust::Error),
    /// User requested an operation that required an installed consensus,
    /// but we didn't have one.
    #[error("Directory not present or not up-to-date")]
    DirectoryNotPresent,
}

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Return true if this error should advance the download-failure
    /// counter for the resource that produced it.
    ///
    /// Mild rejections (duplicate, stale, obsolete, not-wanted) mean the
    /// fetch itself worked, so retrying on the normal cadence is fine.
    /// Hard failures mean the server fed us something unusable.
    pub fn counts_as_download_failure(&self) -> bool {
        match self {
            Error::BadParse(_)
            | Error::InsufficientSignatures(_)
            | Error::ClockSkew
            | Error::Unwanted(_) => true,

            Error::WrongFlavor { .. }
            | Error::DuplicateConsensus
            | Error::StaleConsensus
            | Error::ObsoleteConsensus
            | Error::NeedCerts
            | Error::CacheCorruption(_)
            | Error::CacheFile { .. }
            | Error::CacheAccess(_)
            | Error::DirectoryNotPresent => false,
        }
    }

    /// Construct a new `Error` from `std::io::Error` for an error that
    /// occurred while accessing a file in the store.
    pub(crate) fn from_io(action: &'static str, fname: PathBuf, error: std::io::Error) -> Error {
        Error::CacheFile {
            action,
            fname,
            error: Arc::new(error),
        }
    }
}
