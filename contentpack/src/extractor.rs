//! Archive extraction and atomic promotion into the install directory.
//!
//! Extraction never touches the install path. A verified archive is unpacked
//! into its own directory under the staging root, checked against the pack's
//! file list, and only then swapped into place:
//!
//! 1. the current install (if any) is renamed to `<staging>/<id>.previous`
//! 2. the staged tree is renamed to the install path
//! 3. the previous install is deleted
//!
//! If step 2 fails the previous install is renamed back. A crash between the
//! steps is repaired by [`recover_staging`] on the next start.
//!
//! The swap is two renames, not one exchange, so the install path is absent
//! between steps 1 and 2. Nothing hands out paths into it meanwhile: the
//! record is `installing` for the whole promotion and binary paths are only
//! resolved for `installed` packs.
//!
//! All functions here block; the pipeline runs them on the blocking pool.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{executable_suffix, ArchiveFormat, ContentPack};
use crate::error::{InstallerError, InstallerResult};
use crate::integrity::{hash_file, Checksum};

/// Marker written at the root of every installed pack.
pub const MARKER_FILE_NAME: &str = ".contentpack-install.json";

const PREVIOUS_SUFFIX: &str = ".previous";

/// Install marker recording what is installed in a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallMarker {
    pub pack_id: String,
    pub version: Version,
    pub checksum: Checksum,
    pub installed_at: DateTime<Utc>,
}

impl InstallMarker {
    pub fn new(pack_id: impl Into<String>, version: Version, checksum: Checksum) -> Self {
        Self {
            pack_id: pack_id.into(),
            version,
            checksum,
            installed_at: Utc::now(),
        }
    }

    /// Read the marker of an install directory.
    pub fn read(dir: &Path) -> InstallerResult<Self> {
        let path = dir.join(MARKER_FILE_NAME);
        let text = fs::read_to_string(&path).map_err(|e| InstallerError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|e| InstallerError::Extraction {
            path,
            reason: format!("malformed install marker: {}", e),
        })
    }

    /// Write the marker into a directory.
    pub fn write(&self, dir: &Path) -> InstallerResult<()> {
        let path = dir.join(MARKER_FILE_NAME);
        let json = serde_json::to_vec_pretty(self).map_err(|e| InstallerError::Extraction {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json).map_err(|e| InstallerError::write(&path, e))
    }
}

/// Unpacks archives into staging directories.
#[derive(Debug, Clone)]
pub struct Extractor {
    staging_root: PathBuf,
    platform_id: String,
}

impl Extractor {
    pub fn new(staging_root: impl Into<PathBuf>, platform_id: impl Into<String>) -> Self {
        Self {
            staging_root: staging_root.into(),
            platform_id: platform_id.into(),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Unpack `archive` into a fresh staging directory and check its contents.
    ///
    /// `on_progress` receives archive bytes consumed and the archive size.
    pub fn stage(
        &self,
        pack: &ContentPack,
        format: ArchiveFormat,
        archive: &Path,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(u64, u64),
    ) -> InstallerResult<StagedInstall> {
        let dir = self
            .staging_root
            .join(format!("{}-{}", pack.id, Uuid::new_v4()));
        fs::create_dir_all(&dir).map_err(|e| InstallerError::write(&dir, e))?;

        // From here on the guard removes the directory on any early return.
        let mut staged = StagedInstall {
            pack_id: pack.id.clone(),
            root: dir.clone(),
            dir,
            staging_root: self.staging_root.clone(),
            promoted: false,
        };

        let total = fs::metadata(archive)
            .map_err(|e| InstallerError::io(archive, e))?
            .len();
        let file = File::open(archive).map_err(|e| InstallerError::io(archive, e))?;
        let counter = Arc::new(AtomicU64::new(0));
        let reader = CountingReader {
            inner: file,
            count: Arc::clone(&counter),
        };
        let mut report = || on_progress(counter.load(Ordering::Relaxed), total);

        let entries = match format {
            ArchiveFormat::TarGz => {
                unpack_tar_gz(&pack.id, reader, archive, &staged.dir, cancel, &mut report)?
            }
            ArchiveFormat::Zip => {
                unpack_zip(&pack.id, reader, archive, &staged.dir, cancel, &mut report)?
            }
        };
        on_progress(total, total);

        staged.root = single_top_level_dir(&staged.dir)?.unwrap_or_else(|| staged.dir.clone());
        debug!(pack_id = %pack.id, entries, root = %staged.root.display(), "Archive staged");

        self.check_files(pack, &staged.root, cancel)?;
        Ok(staged)
    }

    /// Verify listed files and make executables runnable.
    fn check_files(
        &self,
        pack: &ContentPack,
        root: &Path,
        cancel: &CancellationToken,
    ) -> InstallerResult<()> {
        for file in &pack.files {
            let mut path = root.join(&file.path);
            if !path.exists() && file.executable {
                let suffixed =
                    root.join(format!("{}{}", file.path, executable_suffix(&self.platform_id)));
                if suffixed.exists() {
                    path = suffixed;
                }
            }

            let metadata = fs::metadata(&path).map_err(|_| InstallerError::Extraction {
                path: path.clone(),
                reason: format!("expected file '{}' is missing from the archive", file.path),
            })?;
            if file.size > 0 && metadata.len() != file.size {
                return Err(InstallerError::Extraction {
                    path,
                    reason: format!(
                        "file '{}' is {} bytes, expected {}",
                        file.path,
                        metadata.len(),
                        file.size
                    ),
                });
            }
            if let Some(expected) = &file.sha256 {
                let actual = hash_file(&path, expected.algorithm(), &pack.id, cancel, |_| {})?;
                if !actual.matches(expected) {
                    return Err(InstallerError::Extraction {
                        path,
                        reason: format!("file '{}' has checksum {}, expected {}", file.path, actual, expected),
                    });
                }
            }
            if file.executable {
                make_executable(&path)?;
            }
        }
        Ok(())
    }
}

/// An unpacked archive waiting to be promoted.
///
/// Dropping it without promoting removes the staging directory.
#[derive(Debug)]
pub struct StagedInstall {
    pack_id: String,
    dir: PathBuf,
    root: PathBuf,
    staging_root: PathBuf,
    promoted: bool,
}

impl StagedInstall {
    /// Root of the staged tree (the single top-level directory, if any).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Swap the staged tree into `install_path`, replacing any previous install.
    ///
    /// Returns the installed size, excluding the marker.
    pub fn promote(mut self, install_path: &Path, marker: &InstallMarker) -> InstallerResult<u64> {
        marker.write(&self.root)?;
        let size = directory_size(&self.root).map_err(|e| InstallerError::io(&self.root, e))?;

        if let Some(parent) = install_path.parent() {
            fs::create_dir_all(parent).map_err(|e| InstallerError::write(parent, e))?;
        }

        let backup = self
            .staging_root
            .join(format!("{}{}", self.pack_id, PREVIOUS_SUFFIX));
        remove_path(&backup).map_err(|e| InstallerError::io(&backup, e))?;

        let had_previous = install_path.exists();
        if had_previous {
            fs::rename(install_path, &backup).map_err(|e| InstallerError::Extraction {
                path: install_path.to_path_buf(),
                reason: format!("cannot move previous install aside: {}", e),
            })?;
        }

        if let Err(e) = fs::rename(&self.root, install_path) {
            if had_previous {
                if let Err(restore) = fs::rename(&backup, install_path) {
                    warn!(pack_id = %self.pack_id, error = %restore, "Failed to restore previous install");
                }
            }
            return Err(InstallerError::Extraction {
                path: install_path.to_path_buf(),
                reason: format!("cannot promote staged install: {}", e),
            });
        }
        self.promoted = true;

        if had_previous {
            if let Err(e) = remove_path(&backup) {
                warn!(pack_id = %self.pack_id, path = %backup.display(), error = %e, "Failed to remove previous install");
            }
        }
        if self.dir != self.root {
            remove_path(&self.dir).ok();
        }

        info!(pack_id = %self.pack_id, path = %install_path.display(), size, "Install promoted");
        Ok(size)
    }

    /// Remove the staging directory.
    pub fn discard(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.promoted {
            return;
        }
        self.promoted = true;
        if let Err(e) = remove_path(&self.dir) {
            warn!(pack_id = %self.pack_id, path = %self.dir.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

impl Drop for StagedInstall {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Repair interrupted promotions and purge leftover staging data.
///
/// A `<id>.previous` directory whose install path is missing is moved back
/// into place; everything else under the staging root is deleted.
pub fn recover_staging(staging_root: &Path, content_dir: &Path) -> InstallerResult<Vec<String>> {
    let mut restored = Vec::new();
    if !staging_root.exists() {
        return Ok(restored);
    }

    let entries =
        fs::read_dir(staging_root).map_err(|e| InstallerError::io(staging_root, e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if let Some(pack_id) = name.strip_suffix(PREVIOUS_SUFFIX) {
            let install_path = content_dir.join(pack_id);
            if !install_path.exists() && fs::rename(&path, &install_path).is_ok() {
                info!(pack_id = %pack_id, "Restored install from interrupted promotion");
                restored.push(pack_id.to_string());
                continue;
            }
        }

        debug!(path = %path.display(), "Removing leftover staging data");
        if let Err(e) = remove_path(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove staging data");
        }
    }
    Ok(restored)
}

/// Total size of the files under `dir`, excluding the install marker.
///
/// Symlinks are counted by their own size and not followed.
pub fn directory_size(dir: &Path) -> io::Result<u64> {
    fn walk(dir: &Path, top: bool) -> io::Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if top && entry.file_name() == MARKER_FILE_NAME {
                continue;
            }
            let metadata = entry.path().symlink_metadata()?;
            if metadata.is_dir() {
                total += walk(&entry.path(), false)?;
            } else {
                total += metadata.len();
            }
        }
        Ok(total)
    }
    walk(dir, true)
}

/// Remove a file or directory tree; absent paths are fine.
fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Normalize an archive entry path, rejecting anything that could escape.
fn sanitize_entry_path(archive: &Path, raw: &Path) -> InstallerResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(InstallerError::Extraction {
                    path: archive.to_path_buf(),
                    reason: format!("unsafe entry path '{}'", raw.display()),
                });
            }
        }
    }
    Ok(clean)
}

fn unpack_tar_gz<R: Read>(
    pack_id: &str,
    reader: R,
    archive_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    report: &mut impl FnMut(),
) -> InstallerResult<usize> {
    let corrupt = |e: io::Error| InstallerError::Extraction {
        path: archive_path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    let mut count = 0;

    for entry in archive.entries().map_err(corrupt)? {
        if cancel.is_cancelled() {
            return Err(InstallerError::Cancelled {
                pack_id: pack_id.to_string(),
            });
        }

        let mut entry = entry.map_err(corrupt)?;
        let raw = entry.path().map_err(corrupt)?.into_owned();
        let relative = sanitize_entry_path(archive_path, &raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            if let Some(target) = entry.link_name().map_err(corrupt)? {
                sanitize_entry_path(archive_path, &target)?;
            }
        }

        entry.unpack_in(dest).map_err(corrupt)?;
        count += 1;
        report();
    }

    Ok(count)
}

fn unpack_zip<R: Read + Seek>(
    pack_id: &str,
    reader: R,
    archive_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    report: &mut impl FnMut(),
) -> InstallerResult<usize> {
    let corrupt = |reason: String| InstallerError::Extraction {
        path: archive_path.to_path_buf(),
        reason,
    };

    let mut archive = zip::ZipArchive::new(reader).map_err(|e| corrupt(e.to_string()))?;
    let mut count = 0;

    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(InstallerError::Cancelled {
                pack_id: pack_id.to_string(),
            });
        }

        let mut file = archive
            .by_index(index)
            .map_err(|e| corrupt(e.to_string()))?;
        let relative = sanitize_entry_path(archive_path, Path::new(file.name()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        if file.is_dir() {
            fs::create_dir_all(&target).map_err(|e| InstallerError::write(&target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| InstallerError::write(parent, e))?;
            }
            let mut out = File::create(&target).map_err(|e| InstallerError::write(&target, e))?;
            io::copy(&mut file, &mut out).map_err(|e| match e.kind() {
                io::ErrorKind::StorageFull => InstallerError::write(&target, e),
                _ => corrupt(e.to_string()),
            })?;

            #[cfg(unix)]
            if let Some(mode) = file.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                    .map_err(|e| InstallerError::io(&target, e))?;
            }
        }

        count += 1;
        report();
    }

    Ok(count)
}

/// The single directory at the top of `dir`, if that is all it contains.
fn single_top_level_dir(dir: &Path) -> InstallerResult<Option<PathBuf>> {
    let entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| InstallerError::io(dir, e))?
        .filter_map(|e| e.ok())
        .collect();

    if entries.len() == 1 && entries[0].path().is_dir() {
        Ok(Some(entries[0].path()))
    } else {
        Ok(None)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> InstallerResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(|e| InstallerError::io(path, e))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions).map_err(|e| InstallerError::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> InstallerResult<()> {
    Ok(())
}

/// Reader that counts the bytes consumed from the archive file.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<R: Seek> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}
