//! Manifest document format and load-time validation.
//!
//! The manifest is the JSON document published alongside the artifacts:
//!
//! ```json
//! {
//!   "version": "1.0.0",
//!   "generated_at": "2025-01-01T00:00:00Z",
//!   "app_version": "0.1.0",
//!   "content_packs": [
//!     {
//!       "id": "core-binaries",
//!       "name": "Core Binaries",
//!       "version": "1.0.0",
//!       "platforms": [
//!         {
//!           "id": "linux-x64",
//!           "download_url": "https://example.com/core-linux-x64.tar.gz",
//!           "compressed_size": 1048576,
//!           "checksum": "sha256:...",
//!           "format": "tar.gz"
//!         }
//!       ]
//!     }
//!   ],
//!   "signature": null
//! }
//! ```
//!
//! `checksum` also accepts the older `sha256` key holding a bare digest.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use super::types::{ArchiveFormat, ContentFile, ContentPack, PlatformArtifact};
use crate::error::{InstallerError, InstallerResult};
use crate::integrity::Checksum;

/// Raw manifest document as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub version: String,
    pub generated_at: String,
    pub app_version: String,
    pub content_packs: Vec<RawPack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub platforms: Vec<RawPlatform>,
    #[serde(default)]
    pub files: Vec<RawFile>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlatform {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub download_url: String,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default, alias = "sha256")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub executable: bool,
}

impl ManifestDocument {
    pub fn from_json(text: &str) -> InstallerResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| InstallerError::InvalidCatalog(format!("malformed manifest: {}", e)))
    }

    pub fn to_json(&self) -> InstallerResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| InstallerError::InvalidCatalog(format!("cannot serialize manifest: {}", e)))
    }

    /// Bytes covered by the manifest signature: the document without it.
    pub fn signing_bytes(&self) -> InstallerResult<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        serde_json::to_vec(&unsigned)
            .map_err(|e| InstallerError::InvalidCatalog(format!("cannot serialize manifest: {}", e)))
    }

    /// Generation timestamp, if it parses as RFC 3339.
    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.generated_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Validate every pack and convert into catalog types.
    pub fn validate(&self) -> InstallerResult<Vec<ContentPack>> {
        let mut ids = HashSet::new();
        let mut packs = Vec::with_capacity(self.content_packs.len());

        for raw in &self.content_packs {
            if raw.id.trim().is_empty() {
                return Err(InstallerError::InvalidCatalog(
                    "content pack with empty id".to_string(),
                ));
            }
            if !ids.insert(raw.id.as_str()) {
                return Err(InstallerError::InvalidCatalog(format!(
                    "duplicate content pack id '{}'",
                    raw.id
                )));
            }
            packs.push(validate_pack(raw)?);
        }

        for pack in &packs {
            for dependency in &pack.dependencies {
                if !ids.contains(dependency.as_str()) {
                    return Err(InstallerError::InvalidCatalog(format!(
                        "pack '{}' depends on unknown pack '{}'",
                        pack.id, dependency
                    )));
                }
            }
        }

        Ok(packs)
    }
}

fn validate_pack(raw: &RawPack) -> InstallerResult<ContentPack> {
    let invalid = |msg: String| InstallerError::InvalidCatalog(format!("pack '{}': {}", raw.id, msg));

    if raw.id.contains(['/', '\\']) || raw.id == "." || raw.id == ".." || raw.id.starts_with('.') {
        return Err(invalid("id must be a plain directory name".to_string()));
    }

    let version = Version::parse(&raw.version)
        .map_err(|e| invalid(format!("invalid version '{}': {}", raw.version, e)))?;

    let mut platform_ids = HashSet::new();
    let mut platforms = Vec::with_capacity(raw.platforms.len());
    for platform in &raw.platforms {
        if !platform_ids.insert(platform.id.as_str()) {
            return Err(invalid(format!("duplicate platform '{}'", platform.id)));
        }

        let checksum: Checksum = platform
            .checksum
            .as_deref()
            .ok_or_else(|| invalid(format!("platform '{}' has no checksum", platform.id)))?
            .parse()
            .map_err(|e: InstallerError| invalid(format!("platform '{}': {}", platform.id, e)))?;

        let url = reqwest::Url::parse(&platform.download_url).map_err(|e| {
            invalid(format!(
                "platform '{}' has invalid url '{}': {}",
                platform.id, platform.download_url, e
            ))
        })?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(invalid(format!(
                "platform '{}' url must be http or https",
                platform.id
            )));
        }

        let format = match &platform.format {
            Some(f) => f.parse()?,
            None => ArchiveFormat::default(),
        };

        platforms.push(PlatformArtifact {
            platform_id: platform.id.clone(),
            name: if platform.name.is_empty() {
                platform.id.clone()
            } else {
                platform.name.clone()
            },
            url: platform.download_url.clone(),
            compressed_size: platform.compressed_size,
            checksum,
            signature: platform.signature.clone().filter(|s| !s.trim().is_empty()),
            format,
        });
    }

    let mut files = Vec::with_capacity(raw.files.len());
    for file in &raw.files {
        let relative = std::path::Path::new(&file.path);
        if file.path.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(invalid(format!("file path '{}' escapes the pack", file.path)));
        }
        let sha256 = match file.sha256.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse()?),
            None => None,
        };
        files.push(ContentFile {
            path: file.path.clone(),
            size: file.size,
            sha256,
            executable: file.executable,
        });
    }

    Ok(ContentPack {
        id: raw.id.clone(),
        name: raw.name.clone(),
        description: raw.description.clone(),
        version,
        required: raw.required,
        total_size: raw.total_size,
        platforms,
        files,
        dependencies: raw.dependencies.clone(),
    })
}
