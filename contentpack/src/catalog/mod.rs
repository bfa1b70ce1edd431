//! Content catalog: the registry of available packs and their artifacts.
//!
//! The catalog is loaded once (embedded, file, or remote manifest), validated,
//! and then read-only. It is the only source of URLs the download engine
//! fetches.

mod manifest;
mod platform;
mod source;
mod types;

pub use manifest::{ManifestDocument, RawFile, RawPack, RawPlatform};
pub use platform::{current_platform, executable_suffix, KNOWN_PLATFORMS};
pub use source::{CatalogOrigin, CACHE_FILE_NAME, EMBEDDED_MANIFEST, MANIFEST_MAX_AGE};
pub use types::{ArchiveFormat, ContentFile, ContentPack, PlatformArtifact};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{InstallerError, InstallerResult};

/// Validated, immutable set of content packs.
#[derive(Debug, Clone)]
pub struct Catalog {
    manifest_version: String,
    generated_at: Option<DateTime<Utc>>,
    app_version: String,
    packs: Vec<ContentPack>,
    index: HashMap<String, usize>,
}

impl Catalog {
    fn new(
        manifest_version: String,
        generated_at: Option<DateTime<Utc>>,
        app_version: String,
        packs: Vec<ContentPack>,
    ) -> Self {
        let index = packs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self {
            manifest_version,
            generated_at,
            app_version,
            packs,
            index,
        }
    }

    pub fn manifest_version(&self) -> &str {
        &self.manifest_version
    }

    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        self.generated_at
    }

    /// App version the manifest was published for.
    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    /// Every pack, in manifest order.
    pub fn packs(&self) -> &[ContentPack] {
        &self.packs
    }

    /// Packs with an artifact for `platform_id`, in manifest order.
    pub fn compatible_packs(&self, platform_id: &str) -> Vec<&ContentPack> {
        self.packs
            .iter()
            .filter(|p| p.supports(platform_id))
            .collect()
    }

    /// Look up a pack by id.
    pub fn describe(&self, pack_id: &str) -> InstallerResult<&ContentPack> {
        self.index
            .get(pack_id)
            .map(|&i| &self.packs[i])
            .ok_or_else(|| InstallerError::UnknownPack(pack_id.to_string()))
    }

    /// Look up the artifact of a pack for a platform.
    pub fn artifact(
        &self,
        pack_id: &str,
        platform_id: &str,
    ) -> InstallerResult<(&ContentPack, &PlatformArtifact)> {
        let pack = self.describe(pack_id)?;
        let artifact =
            pack.artifact_for(platform_id)
                .ok_or_else(|| InstallerError::UnsupportedPlatform {
                    pack_id: pack_id.to_string(),
                    platform_id: platform_id.to_string(),
                })?;
        Ok((pack, artifact))
    }
}
