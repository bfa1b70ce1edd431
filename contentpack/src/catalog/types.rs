//! Validated catalog types.
//!
//! These are produced from the manifest document once it passes validation
//! and stay immutable for the life of the process.

use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::{Serialize, Serializer};

use crate::error::InstallerError;
use crate::integrity::Checksum;

/// Archive format of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArchiveFormat {
    #[default]
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Zip => "zip",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = InstallerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            "zip" => Ok(Self::Zip),
            other => Err(InstallerError::InvalidCatalog(format!(
                "unsupported archive format '{}'",
                other
            ))),
        }
    }
}

impl Serialize for ArchiveFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Downloadable artifact of a pack for one platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformArtifact {
    pub platform_id: String,
    pub name: String,
    pub url: String,
    pub compressed_size: u64,
    pub checksum: Checksum,
    pub signature: Option<String>,
    pub format: ArchiveFormat,
}

/// File expected inside an installed pack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentFile {
    /// Path relative to the pack's install directory.
    pub path: String,
    pub size: u64,
    pub sha256: Option<Checksum>,
    pub executable: bool,
}

/// A content pack as described by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentPack {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: Version,
    pub required: bool,
    /// Installed size in bytes.
    pub total_size: u64,
    pub platforms: Vec<PlatformArtifact>,
    pub files: Vec<ContentFile>,
    pub dependencies: Vec<String>,
}

impl ContentPack {
    /// Artifact for a platform, if the pack supports it.
    pub fn artifact_for(&self, platform_id: &str) -> Option<&PlatformArtifact> {
        self.platforms.iter().find(|p| p.platform_id == platform_id)
    }

    pub fn supports(&self, platform_id: &str) -> bool {
        self.artifact_for(platform_id).is_some()
    }

    /// Files marked executable.
    pub fn executables(&self) -> impl Iterator<Item = &ContentFile> {
        self.files.iter().filter(|f| f.executable)
    }
}
