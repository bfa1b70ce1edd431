//! Error types for the content pack installer.
//!
//! Every stage of the pipeline reports through [`InstallerError`]. The
//! pipeline boundary classifies errors with [`InstallerError::is_retryable`]
//! and [`InstallerError::is_cancelled`] to decide between a local retry, a
//! silent clean teardown, or a surfaced error event.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::state::InstallStatus;

/// Result type for installer operations.
pub type InstallerResult<T> = Result<T, InstallerError>;

/// Errors that can occur while installing content packs.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// Transient connectivity problem or timeout during a transfer.
    #[error("network error while fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// The server answered with a status that retrying will not fix.
    #[error("download of {url} failed with HTTP status {status}")]
    Http { url: String, status: u16 },

    /// Downloaded bytes do not match the catalog digest.
    #[error("checksum mismatch for {pack_id}: expected {expected}, got {actual}")]
    Checksum {
        pack_id: String,
        expected: String,
        actual: String,
    },

    /// Signature validation of an artifact or manifest failed.
    #[error("signature verification failed for {subject}: {reason}")]
    Signature { subject: String, reason: String },

    /// Archive is corrupt or staging promotion failed.
    #[error("failed to extract {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// Not enough free space at the target location.
    #[error("insufficient disk space at {path}: {required} bytes required, {available} available")]
    DiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// The user cancelled or paused the pipeline.
    #[error("operation cancelled for {pack_id}")]
    Cancelled { pack_id: String },

    /// No pack with this id exists in the catalog.
    #[error("unknown content pack: {0}")]
    UnknownPack(String),

    /// The pack has no artifact for the requested platform.
    #[error("content pack {pack_id} is not available for platform {platform_id}")]
    UnsupportedPlatform {
        pack_id: String,
        platform_id: String,
    },

    /// The catalog manifest failed validation.
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    /// Filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The installation state file could not be read or written.
    #[error("failed to persist installation state at {path}: {reason}")]
    StatePersistence { path: PathBuf, reason: String },

    /// A status change not permitted by the lifecycle state machine.
    #[error("invalid status transition for {pack_id}: {from} -> {to}")]
    InvalidTransition {
        pack_id: String,
        from: InstallStatus,
        to: InstallStatus,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl InstallerError {
    /// Build an I/O error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map a write failure, promoting "disk full" to [`InstallerError::DiskSpace`].
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::StorageFull {
            let available = fs2::available_space(path.parent().unwrap_or(&path)).unwrap_or(0);
            return Self::DiskSpace {
                path,
                required: 0,
                available,
            };
        }
        Self::Io { path, source }
    }

    /// Whether the error is transient and the transfer should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Whether the error is a user-initiated stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Status the installation record settles into after this failure.
    ///
    /// Transfer failures leave the pack in `download_error`; integrity and
    /// extraction failures mark it `corrupted`.
    pub fn failure_status(&self) -> InstallStatus {
        match self {
            Self::Checksum { .. } | Self::Signature { .. } | Self::Extraction { .. } => {
                InstallStatus::Corrupted
            }
            Self::Cancelled { .. } => InstallStatus::NotInstalled,
            _ => InstallStatus::DownloadError,
        }
    }
}
