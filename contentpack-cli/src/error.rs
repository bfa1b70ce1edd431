//! CLI error type.

use contentpack::InstallerError;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Installer(#[from] InstallerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install {failed} of {total} content pack(s)")]
    InstallFailed { failed: usize, total: usize },

    #[error("interrupted; downloads were paused and will resume on the next run")]
    Interrupted,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Interrupted => 130,
            CliError::Config(_) | CliError::Installer(InstallerError::Config(_)) => 78,
            CliError::Installer(InstallerError::UnknownPack(_))
            | CliError::Installer(InstallerError::UnsupportedPlatform { .. }) => 64,
            _ => 1,
        }
    }
}
