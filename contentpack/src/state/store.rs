//! Durable installation state store.
//!
//! Records live in a JSON document next to the installed content:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "records": {
//!     "core-binaries": { "pack_id": "core-binaries", "status": "installed", ... }
//!   }
//! }
//! ```
//!
//! The legacy unversioned document was a flat map of pack id to status
//! (`{"core-binaries": "installed"}`) and is migrated on load.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::record::{InstallStatus, InstallationRecord};
use crate::config::InstallerConfig;
use crate::error::{InstallerError, InstallerResult};
use crate::extractor::{directory_size, InstallMarker};
use crate::integrity::VerificationReceipt;

/// Current on-disk format version.
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    format_version: u32,
    records: BTreeMap<String, InstallationRecord>,
}

/// A status change applied during startup reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileChange {
    pub pack_id: String,
    pub from: InstallStatus,
    pub to: InstallStatus,
}

/// Durable `pack_id -> InstallationRecord` mapping.
///
/// Mutations for one pack are serialized through its map entry; the file
/// write after each mutation is serialized by `write_lock` so the newest
/// snapshot always lands last.
#[derive(Debug)]
pub struct InstallationStore {
    path: PathBuf,
    records: DashMap<String, InstallationRecord>,
    write_lock: Mutex<()>,
}

impl InstallationStore {
    /// Load the store from disk. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> InstallerResult<Self> {
        let path = path.into();
        let records = DashMap::new();

        if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| InstallerError::io(&path, e))?;
            for (id, record) in parse_document(&path, &text)? {
                records.insert(id, record);
            }
            debug!(path = %path.display(), count = records.len(), "Loaded installation state");
        } else {
            debug!(path = %path.display(), "No installation state yet");
        }

        Ok(Self {
            path,
            records,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record for a pack, if one exists.
    pub fn get(&self, pack_id: &str) -> Option<InstallationRecord> {
        self.records.get(pack_id).map(|r| r.value().clone())
    }

    /// Current record for a pack, creating a `not_installed` one if absent.
    pub fn get_or_create(&self, pack_id: &str, install_path: &Path) -> InstallationRecord {
        self.records
            .entry(pack_id.to_string())
            .or_insert_with(|| InstallationRecord::new(pack_id, install_path))
            .value()
            .clone()
    }

    /// All records keyed by pack id.
    pub fn snapshot(&self) -> HashMap<String, InstallationRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Apply a lifecycle transition and persist it.
    pub fn transition(
        &self,
        pack_id: &str,
        install_path: &Path,
        to: InstallStatus,
    ) -> InstallerResult<InstallationRecord> {
        self.update(pack_id, install_path, |record| record.transition(to))
    }

    /// Move into a failure status with a reason and persist it.
    pub fn fail(
        &self,
        pack_id: &str,
        install_path: &Path,
        to: InstallStatus,
        message: &str,
    ) -> InstallerResult<InstallationRecord> {
        self.update(pack_id, install_path, |record| record.fail(to, message))
    }

    /// Mark a pack installed. Only reachable with a verification receipt.
    pub fn mark_installed(
        &self,
        receipt: &VerificationReceipt,
        install_path: &Path,
        version: Version,
        installed_size: u64,
    ) -> InstallerResult<InstallationRecord> {
        self.update(receipt.pack_id(), install_path, |record| {
            record.mark_installed(receipt, version, installed_size)
        })
    }

    /// Put back a previously persisted record.
    ///
    /// Used when an aborted re-download leaves the old install untouched.
    pub(crate) fn restore(&self, record: InstallationRecord) -> InstallerResult<()> {
        self.records.insert(record.pack_id().to_string(), record);
        self.persist()
    }

    fn update(
        &self,
        pack_id: &str,
        install_path: &Path,
        apply: impl FnOnce(&mut InstallationRecord) -> InstallerResult<()>,
    ) -> InstallerResult<InstallationRecord> {
        let updated = {
            let mut entry = self
                .records
                .entry(pack_id.to_string())
                .or_insert_with(|| InstallationRecord::new(pack_id, install_path));
            let record = entry.value_mut();

            let mut candidate = record.clone();
            apply(&mut candidate)?;
            *record = candidate.clone();
            candidate
        };

        self.persist()?;
        Ok(updated)
    }

    /// Re-verify every record against the filesystem.
    ///
    /// - `installed` records whose directory, marker, or size disagree with
    ///   the record become `corrupted`.
    /// - In-flight records of a re-download go back to `installed` when the
    ///   install they were replacing still verifies.
    /// - Other in-flight records become `downloading` when a partial artifact
    ///   survives (the pack can resume) and `not_installed` otherwise.
    pub fn reconcile(&self, config: &InstallerConfig) -> InstallerResult<Vec<ReconcileChange>> {
        let mut changes = Vec::new();

        for mut entry in self.records.iter_mut() {
            let pack_id = entry.key().clone();
            let record = entry.value_mut();
            let expected_path = config.install_path(&pack_id);
            if record.install_path() != &expected_path {
                record.set_install_path(expected_path);
            }
            let from = record.status();

            let settled = match from {
                InstallStatus::Installed => verify_installed(record)
                    .err()
                    .map(|reason| (InstallStatus::Corrupted, Some(reason))),
                status
                    if status.is_in_flight()
                        && record.installed_version().is_some()
                        && verify_installed(record).is_ok() =>
                {
                    Some((InstallStatus::Installed, None))
                }
                status if status.is_in_flight() => {
                    let partial = config.partial_path(&pack_id);
                    if partial.exists() {
                        if status == InstallStatus::Downloading {
                            None
                        } else {
                            Some((InstallStatus::Downloading, None))
                        }
                    } else {
                        Some((InstallStatus::NotInstalled, None))
                    }
                }
                _ => None,
            };

            if let Some((to, reason)) = settled {
                match &reason {
                    Some(reason) => {
                        warn!(pack_id = %pack_id, from = %from, to = %to, reason = %reason, "Reconciled installation record")
                    }
                    None => info!(pack_id = %pack_id, from = %from, to = %to, "Reconciled installation record"),
                }
                if to == InstallStatus::Installed {
                    record.restore_installed();
                } else {
                    record.settle(to, reason);
                }
                changes.push(ReconcileChange { pack_id, from, to });
            }
        }

        self.persist()?;
        Ok(changes)
    }

    /// Write the current state to disk.
    pub fn flush(&self) -> InstallerResult<()> {
        self.persist()
    }

    fn persist(&self) -> InstallerResult<()> {
        let _guard = self.write_lock.lock();

        let document = StateDocument {
            format_version: STATE_FORMAT_VERSION,
            records: self
                .records
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&document).map_err(|e| {
            InstallerError::StatePersistence {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| InstallerError::io(parent, e))?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &json).map_err(|e| InstallerError::write(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| InstallerError::io(&self.path, e))?;
        Ok(())
    }
}

/// Check that an installed record still matches the install directory.
fn verify_installed(record: &InstallationRecord) -> Result<(), String> {
    let path = record.install_path();
    if !path.is_dir() {
        return Err(format!("install directory {} is missing", path.display()));
    }

    let marker = InstallMarker::read(path)
        .map_err(|e| format!("install marker unreadable: {}", e))?;
    if Some(&marker.version) != record.installed_version() {
        return Err(format!(
            "installed version {} does not match recorded version",
            marker.version
        ));
    }
    match record.checksum() {
        Some(checksum) if checksum.matches(&marker.checksum) => {}
        _ => return Err("install marker checksum does not match record".to_string()),
    }
    if let Some(expected) = record.installed_size() {
        let actual = directory_size(path).map_err(|e| e.to_string())?;
        if actual != expected {
            return Err(format!(
                "installed size {} does not match recorded size {}",
                actual, expected
            ));
        }
    }
    Ok(())
}

/// Legacy per-pack status values.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LegacyStatus {
    Installed,
    NotInstalled,
    Downloading,
    Failed,
    Installing,
    Corrupted,
}

fn parse_document(
    path: &Path,
    text: &str,
) -> InstallerResult<BTreeMap<String, InstallationRecord>> {
    let corrupt = |e: serde_json::Error| InstallerError::StatePersistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let value: serde_json::Value = serde_json::from_str(text).map_err(corrupt)?;
    match value.get("format_version").and_then(|v| v.as_u64()) {
        Some(version) if version == u64::from(STATE_FORMAT_VERSION) => {
            let document: StateDocument = serde_json::from_value(value).map_err(corrupt)?;
            Ok(document.records)
        }
        Some(version) => Err(InstallerError::StatePersistence {
            path: path.to_path_buf(),
            reason: format!("unsupported state format version {}", version),
        }),
        None => {
            let legacy: BTreeMap<String, LegacyStatus> =
                serde_json::from_value(value).map_err(corrupt)?;
            info!(path = %path.display(), count = legacy.len(), "Migrating legacy installation state");
            Ok(migrate_legacy(path, legacy))
        }
    }
}

/// Convert the flat legacy map into records.
///
/// Legacy records carry no version or checksum, so an `installed` entry is
/// kept as `installed` only to let reconciliation check it against the
/// install marker.
fn migrate_legacy(
    path: &Path,
    legacy: BTreeMap<String, LegacyStatus>,
) -> BTreeMap<String, InstallationRecord> {
    let content_dir = path.parent().unwrap_or(Path::new("."));

    legacy
        .into_iter()
        .map(|(pack_id, status)| {
            let mut record = InstallationRecord::new(pack_id.as_str(), content_dir.join(&pack_id));
            let status = match status {
                LegacyStatus::Installed => InstallStatus::Installed,
                LegacyStatus::NotInstalled => InstallStatus::NotInstalled,
                LegacyStatus::Downloading => InstallStatus::Downloading,
                LegacyStatus::Installing => InstallStatus::Installing,
                LegacyStatus::Failed => InstallStatus::DownloadError,
                LegacyStatus::Corrupted => InstallStatus::Corrupted,
            };
            if status == InstallStatus::Installed {
                record.restore_legacy_installed();
            } else {
                record.settle(status, None);
            }
            (pack_id, record)
        })
        .collect()
}
