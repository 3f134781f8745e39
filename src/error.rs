//! Error types for the migration pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the migration library.
#[derive(Error, Debug)]
pub enum Error {
    /// An attachment byte source failed mid-read.
    #[error("cannot read attachment '{name}': {source}")]
    StreamRead {
        name: String,
        source: std::io::Error,
    },

    /// The mail document could not be serialized.
    #[error("cannot encode message {descriptor_id}: {source}")]
    Encoding {
        descriptor_id: u64,
        source: std::io::Error,
    },

    /// The delivery sink rejected or failed to store a message.
    #[error("cannot deliver '{path}': {reason}")]
    Delivery { path: String, reason: String },

    /// The dedup oracle could not decide which messages were migrated.
    #[error("cannot classify batch: {0}")]
    Classification(#[source] Box<Error>),

    /// The persisted dedup cache could not be read or appended to.
    #[error("dedup cache I/O error on '{path}': {source}")]
    CacheIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The archive reader failed to enumerate folders or messages.
    #[error("archive error at '{path}': {reason}")]
    Archive { path: PathBuf, reason: String },

    /// The remote index answered with an error payload.
    #[error("remote index error: {0}")]
    Index(String),

    /// The service token could not be obtained or decoded.
    #[error("cannot obtain service token: {0}")]
    Token(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The configuration is incomplete or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an `Archive` variant.
    pub fn archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Archive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap any error raised while classifying a batch.
    pub fn classification(source: Error) -> Self {
        match source {
            err @ Self::Classification(_) => err,
            err => Self::Classification(Box::new(err)),
        }
    }
}
