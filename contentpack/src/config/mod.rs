//! Configuration for the content pack installer.
//!
//! [`InstallerConfig`] is the runtime configuration handed to
//! [`ContentInstaller`](crate::service::ContentInstaller). It can be built in
//! code with the `with_*` setters or derived from the user's INI file via
//! [`ConfigFile`].

mod file;

pub use file::{config_file_path, ConfigFile};

use std::path::PathBuf;
use std::time::Duration;

use crate::download::{RetryPolicy, ThrottleConfig};

/// Name of the directory used under the platform data/config directories.
pub const APP_DIR_NAME: &str = "contentpack";

/// Default per-chunk read timeout.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout for HTTP requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of each event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for the installer.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Directory where packs are installed, one sub-directory per pack id.
    pub content_dir: PathBuf,

    /// Path of the durable installation state file.
    pub state_file: PathBuf,

    /// Directory where fetched manifests are cached.
    pub manifest_cache_dir: PathBuf,

    /// Application version reported by status queries.
    pub app_version: String,

    /// Platform id override; detected from the build target when `None`.
    pub platform_id: Option<String>,

    /// Remote manifest location. The embedded manifest is used when `None`.
    pub manifest_url: Option<String>,

    /// Connect timeout for HTTP requests.
    pub connect_timeout: Duration,

    /// Maximum time to wait for the next chunk of a transfer.
    pub chunk_timeout: Duration,

    /// Retry policy for transient network failures.
    pub retry: RetryPolicy,

    /// Progress event throttling.
    pub throttle: ThrottleConfig,

    /// Bandwidth cap per transfer in bytes per second.
    pub max_bytes_per_sec: Option<u64>,

    /// Key used to verify artifact and manifest signatures.
    pub signing_key: Option<Vec<u8>>,

    /// Capacity of each event channel.
    pub event_capacity: usize,

    /// Whether to check free disk space before a transfer starts.
    pub check_disk_space: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME);
        Self::new(data_dir.join("content"))
    }
}

impl InstallerConfig {
    /// Create a configuration rooted at the given content directory.
    ///
    /// The state file and manifest cache are placed next to the packs.
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        let content_dir = content_dir.into();
        Self {
            state_file: content_dir.join("installations.json"),
            manifest_cache_dir: content_dir.join(".manifests"),
            content_dir,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform_id: None,
            manifest_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            retry: RetryPolicy::default(),
            throttle: ThrottleConfig::default(),
            max_bytes_per_sec: None,
            signing_key: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            check_disk_space: true,
        }
    }

    /// Directory holding partial and complete downloads.
    pub fn downloads_dir(&self) -> PathBuf {
        self.content_dir.join(".downloads")
    }

    /// Partial (or complete, not yet verified) artifact of a pack.
    pub fn partial_path(&self, pack_id: &str) -> PathBuf {
        self.downloads_dir().join(format!("{}.part", pack_id))
    }

    /// Directory holding extraction staging areas.
    ///
    /// Kept inside the content directory so promotion is a same-filesystem rename.
    pub fn staging_dir(&self) -> PathBuf {
        self.content_dir.join(".staging")
    }

    /// Final install path of a pack.
    pub fn install_path(&self, pack_id: &str) -> PathBuf {
        self.content_dir.join(pack_id)
    }

    /// Set the state file location.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = path;
        self
    }

    /// Set the manifest cache directory.
    pub fn with_manifest_cache_dir(mut self, path: PathBuf) -> Self {
        self.manifest_cache_dir = path;
        self
    }

    /// Set the reported application version.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Override platform detection.
    pub fn with_platform(mut self, platform_id: impl Into<String>) -> Self {
        self.platform_id = Some(platform_id.into());
        self
    }

    /// Set the remote manifest URL.
    pub fn with_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.manifest_url = Some(url.into());
        self
    }

    /// Set the per-chunk timeout.
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the progress throttle policy.
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Cap the transfer bandwidth.
    pub fn with_max_bytes_per_sec(mut self, limit: Option<u64>) -> Self {
        self.max_bytes_per_sec = limit.filter(|l| *l > 0);
        self
    }

    /// Set the signature verification key.
    pub fn with_signing_key(mut self, key: Vec<u8>) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Set the event channel capacity (minimum 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Enable or disable the free-space check.
    pub fn with_disk_space_check(mut self, enabled: bool) -> Self {
        self.check_disk_space = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = InstallerConfig::new("/data/content");
        assert_eq!(config.state_file, PathBuf::from("/data/content/installations.json"));
        assert_eq!(config.downloads_dir(), PathBuf::from("/data/content/.downloads"));
        assert_eq!(config.staging_dir(), PathBuf::from("/data/content/.staging"));
        assert_eq!(
            config.install_path("core-binaries"),
            PathBuf::from("/data/content/core-binaries")
        );
        assert!(config.check_disk_space);
        assert_eq!(config.chunk_timeout, DEFAULT_CHUNK_TIMEOUT);
    }

    #[test]
    fn test_builder_pattern() {
        let config = InstallerConfig::new("/content")
            .with_platform("linux-x64")
            .with_manifest_url("https://example.com/manifest.json")
            .with_chunk_timeout(Duration::from_secs(5))
            .with_max_bytes_per_sec(Some(1024))
            .with_event_capacity(0)
            .with_disk_space_check(false);

        assert_eq!(config.platform_id.as_deref(), Some("linux-x64"));
        assert_eq!(
            config.manifest_url.as_deref(),
            Some("https://example.com/manifest.json")
        );
        assert_eq!(config.chunk_timeout, Duration::from_secs(5));
        assert_eq!(config.max_bytes_per_sec, Some(1024));
        assert_eq!(config.event_capacity, 1);
        assert!(!config.check_disk_space);
    }

    #[test]
    fn test_zero_bandwidth_means_unlimited() {
        let config = InstallerConfig::new("/content").with_max_bytes_per_sec(Some(0));
        assert_eq!(config.max_bytes_per_sec, None);
    }
}
