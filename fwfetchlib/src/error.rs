use std::{
    fmt,
    io,
};

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which of the integrity checks failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChecksumKind {
    Crc32,
    Md5,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => f.write_str("CRC32"),
            Self::Md5 => f.write_str("MD5"),
        }
    }
}

/// Failure of any stage of the acquisition pipeline. Stages never retry on
/// their own, so every variant is terminal for the job that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication with the firmware service failed: {0}")]
    Authentication(#[source] BoxError),
    #[error("Network error: {0}")]
    Network(#[source] BoxError),
    #[error("No matching firmware found: {0}")]
    NotFound(String),
    #[error("Unexpected response from the firmware service: {0}")]
    Protocol(#[source] BoxError),
    #[error("Expected {expected} bytes, but received at least {received} bytes")]
    SizeMismatch {
        expected: u64,
        received: u64,
    },
    #[error("{0} checksum does not match the expected value")]
    ChecksumMismatch(ChecksumKind),
    #[error("Unsupported encryption scheme for file: {0}")]
    UnsupportedScheme(String),
    #[error("Decryption failed: {0}")]
    Decryption(#[source] BoxError),
    #[error("Storage error: {0}")]
    Storage(#[source] io::Error),
    #[error("{0} already exists")]
    AlreadyExists(String),
}

/// Payload-free view of [`Error`] for matching on the failure category.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Authentication,
    Network,
    NotFound,
    Protocol,
    SizeMismatch,
    ChecksumMismatch(ChecksumKind),
    UnsupportedScheme,
    Decryption,
    Storage,
    AlreadyExists,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Network(_) => ErrorKind::Network,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::ChecksumMismatch(k) => ErrorKind::ChecksumMismatch(*k),
            Self::UnsupportedScheme(_) => ErrorKind::UnsupportedScheme,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::Storage(_) => ErrorKind::Storage,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
        }
    }

    /// Whether the partially produced files are unsafe to reuse and should be
    /// deleted before trying again.
    pub fn requires_cleanup(&self) -> bool {
        matches!(self, Self::ChecksumMismatch(_) | Self::Decryption(_))
    }
}

/// Result of a stage that may be interrupted by cancellation. Cancellation is
/// not an error: it short-circuits the pipeline without a failure message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(v) => Outcome::Completed(f(v)),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}
