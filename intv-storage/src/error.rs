//! Error taxonomy for the storage layer.

use std::io;
use thiserror::Error;

use crate::archive::{ArchiveAccessMode, ArchiveFormat, ArchiveImplementation};

/// Broad classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Misuse detected at the point of configuration (bad registration, bad mode).
    Configuration,
    /// A path or factory could not be resolved.
    Resolution,
    /// Underlying I/O or codec failure.
    Io,
    /// The backend does not offer the requested operation.
    NotSupported,
    /// A programmer error in the arguments supplied.
    InvalidArgument,
    /// The operation is not valid for the current object state.
    InvalidOperation,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A storage provider of type {0} is already registered")]
    AlreadyRegistered(&'static str),

    #[error("No default storage provider is registered")]
    NotConfigured,

    #[error("Location is invalid: {0}")]
    InvalidLocation(String),

    #[error("Unsupported archive format {format:?} (requested {requested:?}, have {available:?})")]
    UnsupportedFormat {
        format: ArchiveFormat,
        requested: ArchiveImplementation,
        available: Vec<ArchiveImplementation>,
    },

    #[error("{format:?} archives do not support {mode:?} mode")]
    UnsupportedMode {
        format: ArchiveFormat,
        mode: ArchiveAccessMode,
    },

    #[error("Stream does not satisfy {implementation:?} backend requirements: {reason}")]
    StreamCapability {
        implementation: ArchiveImplementation,
        reason: &'static str,
    },

    #[error("Location {path} cannot exist in archive rooted at {root}")]
    OutsideArchive { path: String, root: String },

    #[error("Cannot determine the containing archive for {0}")]
    IndeterminateRoot(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Entry already exists: {0}")]
    EntryExists(String),

    #[error("Entry {0} is a directory")]
    EntryIsDirectory(String),

    #[error("Invalid destination path: {0}")]
    InvalidDestination(String),

    #[error("Destination directory does not exist: {0}")]
    MissingDestinationDirectory(String),

    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Corrupt archive data: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl StorageError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            Self::AlreadyRegistered(_)
            | Self::UnsupportedMode { .. }
            | Self::StreamCapability { .. }
            | Self::EntryIsDirectory(_) => ErrorCategory::Configuration,
            Self::NotConfigured
            | Self::InvalidLocation(_)
            | Self::UnsupportedFormat { .. }
            | Self::OutsideArchive { .. }
            | Self::EntryNotFound(_) => ErrorCategory::Resolution,
            Self::IndeterminateRoot(_) | Self::InvalidOperation(_) | Self::EntryExists(_) => {
                ErrorCategory::InvalidOperation
            }
            Self::NotSupported(_) => ErrorCategory::NotSupported,
            Self::InvalidDestination(_)
            | Self::MissingDestinationDirectory(_)
            | Self::DestinationExists(_)
            | Self::Corrupt(_)
            | Self::Io(_)
            | Self::Zip(_) => ErrorCategory::Io,
        }
    }

    pub(crate) fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    pub(crate) fn invalid_operation(what: impl Into<String>) -> Self {
        Self::InvalidOperation(what.into())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_is_distinguishable() {
        let err = StorageError::UnsupportedMode {
            format: ArchiveFormat::Tar,
            mode: ArchiveAccessMode::Update,
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = StorageError::OutsideArchive {
            path: "/other.zip/x".into(),
            root: "/games.zip".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Resolution);
        assert!(err.to_string().contains("/games.zip"));

        let err: StorageError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err.category(), ErrorCategory::Io);
    }
}
