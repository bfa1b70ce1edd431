//! Locations of the bundled executables.
//!
//! The media tooling that drives downloads only needs three paths. They live
//! in the install directory of the required core pack, so they appear (and
//! change) atomically with it.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::catalog::executable_suffix;
use crate::error::{InstallerError, InstallerResult};

/// Id of the pack that carries the executables.
pub const CORE_PACK_ID: &str = "core-binaries";

/// Paths of the bundled tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryPaths {
    pub yt_dlp: PathBuf,
    pub aria2c: PathBuf,
    pub ffmpeg: PathBuf,
}

impl BinaryPaths {
    /// Paths inside an install directory for a platform.
    pub fn resolve(install_dir: &Path, platform_id: &str) -> Self {
        let suffix = executable_suffix(platform_id);
        let bin = |name: &str| install_dir.join(format!("{}{}", name, suffix));
        Self {
            yt_dlp: bin("yt-dlp"),
            aria2c: bin("aria2c"),
            ffmpeg: bin("ffmpeg"),
        }
    }

    /// Tool names paired with their paths.
    pub fn entries(&self) -> [(&'static str, &Path); 3] {
        [
            ("yt-dlp", self.yt_dlp.as_path()),
            ("aria2c", self.aria2c.as_path()),
            ("ffmpeg", self.ffmpeg.as_path()),
        ]
    }

    /// Tools whose file does not exist.
    pub fn missing(&self) -> Vec<&'static str> {
        self.entries()
            .into_iter()
            .filter(|(_, path)| !path.is_file())
            .map(|(name, _)| name)
            .collect()
    }

    /// Make sure every tool exists and can be executed.
    pub fn ensure_executable(&self) -> InstallerResult<()> {
        for (name, path) in self.entries() {
            if !path.is_file() {
                return Err(InstallerError::io(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} is not installed", name),
                    ),
                ));
            }
            set_executable(path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> InstallerResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)
        .map_err(|e| InstallerError::io(path, e))?
        .permissions();
    if permissions.mode() & 0o111 != 0o111 {
        permissions.set_mode(permissions.mode() | 0o755);
        std::fs::set_permissions(path, permissions).map_err(|e| InstallerError::io(path, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> InstallerResult<()> {
    Ok(())
}
