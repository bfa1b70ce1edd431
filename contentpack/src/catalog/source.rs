//! Manifest sources: embedded, local file, and remote with an on-disk cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::manifest::ManifestDocument;
use super::Catalog;
use crate::download::ArtifactTransport;
use crate::error::{InstallerError, InstallerResult};
use crate::integrity::SignatureVerifier;

/// Manifest compiled into the crate, used when no remote source is available.
pub const EMBEDDED_MANIFEST: &str = include_str!("../../assets/content_manifest.json");

/// How long a cached manifest is reused after its `generated_at` time.
pub const MANIFEST_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// File name of the cached remote manifest.
pub const CACHE_FILE_NAME: &str = "content_manifest.json";

/// Where a catalog was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOrigin {
    Embedded,
    File(PathBuf),
    Remote(String),
    /// Cached copy of a remote manifest.
    Cache { path: PathBuf, stale: bool },
}

impl Catalog {
    /// Validate a manifest document, checking its signature if it has one.
    pub fn from_document(
        document: ManifestDocument,
        verifier: &dyn SignatureVerifier,
    ) -> InstallerResult<Self> {
        if let Some(signature) = &document.signature {
            verifier.verify_bytes("manifest", &document.signing_bytes()?, signature)?;
        }
        let packs = document.validate()?;
        Ok(Self::new(
            document.version.clone(),
            document.generated_at(),
            document.app_version.clone(),
            packs,
        ))
    }

    /// Parse and validate manifest JSON.
    pub fn from_json(text: &str, verifier: &dyn SignatureVerifier) -> InstallerResult<Self> {
        Self::from_document(ManifestDocument::from_json(text)?, verifier)
    }

    /// The manifest shipped with the crate.
    pub fn embedded(verifier: &dyn SignatureVerifier) -> InstallerResult<Self> {
        Self::from_json(EMBEDDED_MANIFEST, verifier)
    }

    /// Load a manifest from a local file.
    pub fn from_file(path: &Path, verifier: &dyn SignatureVerifier) -> InstallerResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| InstallerError::io(path, e))?;
        Self::from_json(&text, verifier)
    }

    /// Load a remote manifest, preferring a fresh cache.
    ///
    /// Fallback order when the fetch fails: stale cache, then the embedded
    /// manifest.
    pub async fn load_remote(
        url: &str,
        cache_dir: &Path,
        transport: &dyn ArtifactTransport,
        verifier: &dyn SignatureVerifier,
    ) -> InstallerResult<(Self, CatalogOrigin)> {
        let cache_path = cache_dir.join(CACHE_FILE_NAME);

        let cached = match read_cache(&cache_path, verifier) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(path = %cache_path.display(), error = %e, "Ignoring unreadable manifest cache");
                None
            }
        };
        if let Some(catalog) = &cached {
            if catalog.is_fresh(MANIFEST_MAX_AGE) {
                debug!(path = %cache_path.display(), "Using cached manifest");
                return Ok((
                    catalog.clone(),
                    CatalogOrigin::Cache {
                        path: cache_path,
                        stale: false,
                    },
                ));
            }
        }

        match fetch(url, transport, verifier).await {
            Ok((catalog, text)) => {
                if let Err(e) = write_cache(&cache_path, &text) {
                    warn!(path = %cache_path.display(), error = %e, "Failed to cache manifest");
                }
                info!(url = %url, packs = catalog.packs().len(), "Fetched content manifest");
                Ok((catalog, CatalogOrigin::Remote(url.to_string())))
            }
            Err(e) => {
                if let Some(catalog) = cached {
                    warn!(url = %url, error = %e, "Manifest fetch failed, using stale cache");
                    return Ok((
                        catalog,
                        CatalogOrigin::Cache {
                            path: cache_path,
                            stale: true,
                        },
                    ));
                }
                warn!(url = %url, error = %e, "Manifest fetch failed, using embedded manifest");
                Ok((Self::embedded(verifier)?, CatalogOrigin::Embedded))
            }
        }
    }

    /// Whether the manifest was generated within `max_age` of now.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        let Some(generated_at) = self.generated_at() else {
            return false;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return true;
        };
        Utc::now().signed_duration_since(generated_at) < max_age
    }
}

async fn fetch(
    url: &str,
    transport: &dyn ArtifactTransport,
    verifier: &dyn SignatureVerifier,
) -> InstallerResult<(Catalog, String)> {
    let bytes = transport.fetch_bytes(url).await?;
    let text = String::from_utf8(bytes)
        .map_err(|e| InstallerError::InvalidCatalog(format!("manifest is not UTF-8: {}", e)))?;
    let catalog = Catalog::from_json(&text, verifier)?;
    Ok((catalog, text))
}

fn read_cache(path: &Path, verifier: &dyn SignatureVerifier) -> InstallerResult<Option<Catalog>> {
    if !path.exists() {
        return Ok(None);
    }
    Catalog::from_file(path, verifier).map(Some)
}

fn write_cache(path: &Path, text: &str) -> InstallerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| InstallerError::io(parent, e))?;
    }
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, text).map_err(|e| InstallerError::write(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| InstallerError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::mock::MemoryTransport;
    use crate::integrity::HmacVerifier;
    use tempfile::TempDir;

    const URL: &str = "https://example.com/content_manifest.json";

    fn manifest(generated_at: &str, pack_id: &str) -> String {
        serde_json::json!({
            "version": "1.0.0",
            "generated_at": generated_at,
            "app_version": "0.1.0",
            "content_packs": [{
                "id": pack_id,
                "name": "Pack",
                "version": "1.0.0",
                "platforms": [{
                    "id": "linux-x64",
                    "download_url": "https://example.com/a.tar.gz",
                    "checksum": "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                }]
            }]
        })
        .to_string()
    }

    #[test]
    fn test_embedded_manifest_is_valid() {
        let catalog = Catalog::embedded(&HmacVerifier::default()).unwrap();
        let core = catalog.describe("core-binaries").unwrap();
        assert!(core.required);
        for platform in crate::catalog::KNOWN_PLATFORMS {
            assert!(core.supports(platform), "missing {}", platform);
        }
    }

    #[tokio::test]
    async fn test_remote_fetch_populates_cache() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.serve(URL, manifest(&Utc::now().to_rfc3339(), "remote").into_bytes());

        let (catalog, origin) =
            Catalog::load_remote(URL, temp.path(), &transport, &HmacVerifier::default())
                .await
                .unwrap();

        assert_eq!(origin, CatalogOrigin::Remote(URL.to_string()));
        assert!(catalog.describe("remote").is_ok());
        assert!(temp.path().join(CACHE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_network() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(CACHE_FILE_NAME),
            manifest(&Utc::now().to_rfc3339(), "cached"),
        )
        .unwrap();
        let transport = MemoryTransport::new();

        let (catalog, origin) =
            Catalog::load_remote(URL, temp.path(), &transport, &HmacVerifier::default())
                .await
                .unwrap();

        assert!(matches!(origin, CatalogOrigin::Cache { stale: false, .. }));
        assert!(catalog.describe("cached").is_ok());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stale_cache_used_when_fetch_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(CACHE_FILE_NAME),
            manifest("2020-01-01T00:00:00Z", "stale"),
        )
        .unwrap();
        let transport = MemoryTransport::new();

        let (catalog, origin) =
            Catalog::load_remote(URL, temp.path(), &transport, &HmacVerifier::default())
                .await
                .unwrap();

        assert!(matches!(origin, CatalogOrigin::Cache { stale: true, .. }));
        assert!(catalog.describe("stale").is_ok());
    }

    #[tokio::test]
    async fn test_embedded_fallback() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();

        let (catalog, origin) =
            Catalog::load_remote(URL, temp.path(), &transport, &HmacVerifier::default())
                .await
                .unwrap();

        assert_eq!(origin, CatalogOrigin::Embedded);
        assert!(catalog.describe("core-binaries").is_ok());
    }

    #[test]
    fn test_signed_manifest() {
        let verifier = HmacVerifier::new(Some(b"release-key".to_vec()));
        let mut document =
            ManifestDocument::from_json(&manifest("2025-01-01T00:00:00Z", "signed")).unwrap();
        document.signature = Some(verifier.sign(&document.signing_bytes().unwrap()).unwrap());

        assert!(Catalog::from_document(document.clone(), &verifier).is_ok());

        document.content_packs[0].name = "Tampered".to_string();
        let err = Catalog::from_document(document, &verifier).unwrap_err();
        assert!(matches!(err, InstallerError::Signature { .. }));
    }
}
