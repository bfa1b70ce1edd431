//! Installation records and the per-pack lifecycle state machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{InstallerError, InstallerResult};
use crate::integrity::{Checksum, VerificationReceipt};

/// Lifecycle status of a pack installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    NotInstalled,
    Downloading,
    Verifying,
    #[serde(rename = "signaturecheck")]
    SignatureCheck,
    Extracting,
    Installing,
    Installed,
    Corrupted,
    DownloadError,
}

impl InstallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::SignatureCheck => "signaturecheck",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Corrupted => "corrupted",
            Self::DownloadError => "download_error",
        }
    }

    /// Whether a pipeline stage is (or was, before a crash) working on the pack.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Downloading
                | Self::Verifying
                | Self::SignatureCheck
                | Self::Extracting
                | Self::Installing
        )
    }

    /// Whether the lifecycle permits moving from `self` to `to`.
    ///
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(&self, to: InstallStatus) -> bool {
        use InstallStatus::*;

        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (NotInstalled, Downloading)
                | (Downloading, Verifying)
                | (Downloading, DownloadError)
                | (Downloading, NotInstalled)
                | (Verifying, SignatureCheck)
                | (Verifying, Extracting)
                | (Verifying, Corrupted)
                | (Verifying, DownloadError)
                | (Verifying, NotInstalled)
                | (SignatureCheck, Extracting)
                | (SignatureCheck, Corrupted)
                | (SignatureCheck, DownloadError)
                | (SignatureCheck, NotInstalled)
                | (Extracting, Installing)
                | (Extracting, Corrupted)
                | (Extracting, DownloadError)
                | (Extracting, NotInstalled)
                | (Installing, Installed)
                | (Installing, Corrupted)
                | (Installing, DownloadError)
                | (DownloadError, Downloading)
                | (DownloadError, NotInstalled)
                | (Corrupted, Downloading)
                | (Corrupted, NotInstalled)
                | (Installed, Downloading)
                | (Installed, Corrupted)
        )
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one pack's installation.
///
/// Fields are read-only outside the crate; every change goes through the
/// lifecycle methods so the state machine cannot be bypassed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pack_id: String,
    #[serde(default)]
    installed_version: Option<Version>,
    status: InstallStatus,
    #[serde(default)]
    installed_at: Option<DateTime<Utc>>,
    install_path: PathBuf,
    #[serde(default)]
    installed_size: Option<u64>,
    #[serde(default)]
    checksum: Option<Checksum>,
    #[serde(default)]
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl InstallationRecord {
    /// A fresh `not_installed` record.
    pub fn new(pack_id: impl Into<String>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            pack_id: pack_id.into(),
            installed_version: None,
            status: InstallStatus::NotInstalled,
            installed_at: None,
            install_path: install_path.into(),
            installed_size: None,
            checksum: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn pack_id(&self) -> &str {
        &self.pack_id
    }

    pub fn status(&self) -> InstallStatus {
        self.status
    }

    pub fn installed_version(&self) -> Option<&Version> {
        self.installed_version.as_ref()
    }

    pub fn installed_at(&self) -> Option<DateTime<Utc>> {
        self.installed_at
    }

    pub fn install_path(&self) -> &PathBuf {
        &self.install_path
    }

    pub fn installed_size(&self) -> Option<u64> {
        self.installed_size
    }

    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Move to `to` if the lifecycle allows it.
    ///
    /// `installed` cannot be reached this way; see [`Self::mark_installed`].
    /// Leaving an error status clears `last_error`.
    pub fn transition(&mut self, to: InstallStatus) -> InstallerResult<()> {
        if to == InstallStatus::Installed && self.status != InstallStatus::Installed {
            return Err(self.invalid(to));
        }
        if !self.status.can_transition_to(to) {
            return Err(self.invalid(to));
        }

        if to == InstallStatus::Downloading || to == InstallStatus::NotInstalled {
            self.last_error = None;
        }
        if to == InstallStatus::NotInstalled {
            self.clear_install();
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    /// Move into a failure status and remember the reason.
    pub fn fail(&mut self, to: InstallStatus, message: impl Into<String>) -> InstallerResult<()> {
        self.transition(to)?;
        self.last_error = Some(message.into());
        Ok(())
    }

    /// Record a completed install. Requires a receipt for this pack.
    pub fn mark_installed(
        &mut self,
        receipt: &VerificationReceipt,
        version: Version,
        installed_size: u64,
    ) -> InstallerResult<()> {
        if receipt.pack_id() != self.pack_id
            || !self.status.can_transition_to(InstallStatus::Installed)
            || self.status == InstallStatus::Installed
        {
            return Err(self.invalid(InstallStatus::Installed));
        }

        let now = Utc::now();
        self.status = InstallStatus::Installed;
        self.installed_version = Some(version);
        self.installed_at = Some(now);
        self.installed_size = Some(installed_size);
        self.checksum = Some(receipt.checksum().clone());
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Force a status during startup reconciliation.
    ///
    /// Only non-installed targets are accepted.
    pub(crate) fn settle(&mut self, to: InstallStatus, reason: Option<String>) {
        if to == InstallStatus::Installed {
            return;
        }
        if to == InstallStatus::NotInstalled {
            self.clear_install();
        }
        self.status = to;
        self.last_error = reason;
        self.touch();
    }

    /// Return an interrupted re-download to the install it was replacing.
    ///
    /// Only possible while the record still carries that install's version
    /// and checksum.
    pub(crate) fn restore_installed(&mut self) -> bool {
        if self.installed_version.is_none() || self.checksum.is_none() {
            return false;
        }
        self.status = InstallStatus::Installed;
        self.last_error = None;
        self.touch();
        true
    }

    /// Mark a migrated legacy entry as installed, pending reconciliation.
    pub(crate) fn restore_legacy_installed(&mut self) {
        self.status = InstallStatus::Installed;
        self.touch();
    }

    pub(crate) fn set_install_path(&mut self, path: PathBuf) {
        self.install_path = path;
    }

    fn clear_install(&mut self) {
        self.installed_version = None;
        self.installed_at = None;
        self.installed_size = None;
        self.checksum = None;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: InstallStatus) -> InstallerError {
        InstallerError::InvalidTransition {
            pack_id: self.pack_id.clone(),
            from: self.status,
            to,
        }
    }
}
