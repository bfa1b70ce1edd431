//! INI configuration file support.
//!
//! The file lives at `<config_dir>/contentpack/config.ini`:
//!
//! ```ini
//! [content]
//! content_dir = /home/user/.local/share/contentpack/content
//! manifest_url = https://example.com/content_manifest.json
//! platform = linux-x64
//!
//! [download]
//! chunk_timeout_secs = 30
//! connect_timeout_secs = 10
//! max_attempts = 5
//! initial_backoff_ms = 500
//! max_backoff_ms = 30000
//! max_bytes_per_sec = 0
//!
//! [progress]
//! interval_ms = 250
//! min_percent_delta = 1.0
//!
//! [security]
//! signing_key_file = /etc/contentpack/signing.key
//! ```
//!
//! Every key is optional; absent keys keep the [`InstallerConfig`] defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use super::{InstallerConfig, APP_DIR_NAME};
use crate::error::{InstallerError, InstallerResult};

const CONFIG_FILE_NAME: &str = "config.ini";

/// Default location of the configuration file.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub content_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub manifest_url: Option<String>,
    pub platform: Option<String>,
    pub chunk_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub max_bytes_per_sec: Option<u64>,
    pub progress_interval_ms: Option<u64>,
    pub min_percent_delta: Option<f64>,
    pub signing_key_file: Option<PathBuf>,
}

impl ConfigFile {
    /// Load from the default location, returning defaults if the file is absent.
    pub fn load() -> InstallerResult<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load from an explicit path, returning defaults if the file is absent.
    pub fn load_from(path: &Path) -> InstallerResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| InstallerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(text: &str) -> InstallerResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| InstallerError::Config(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> InstallerResult<Self> {
        let get = |section: &str, key: &str| -> Option<String> {
            ini.section(Some(section))
                .and_then(|props| props.get(key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            content_dir: get("content", "content_dir").map(PathBuf::from),
            state_file: get("content", "state_file").map(PathBuf::from),
            manifest_url: get("content", "manifest_url"),
            platform: get("content", "platform"),
            chunk_timeout_secs: parse_opt(get("download", "chunk_timeout_secs"), "chunk_timeout_secs")?,
            connect_timeout_secs: parse_opt(
                get("download", "connect_timeout_secs"),
                "connect_timeout_secs",
            )?,
            max_attempts: parse_opt(get("download", "max_attempts"), "max_attempts")?,
            initial_backoff_ms: parse_opt(get("download", "initial_backoff_ms"), "initial_backoff_ms")?,
            max_backoff_ms: parse_opt(get("download", "max_backoff_ms"), "max_backoff_ms")?,
            max_bytes_per_sec: parse_opt(get("download", "max_bytes_per_sec"), "max_bytes_per_sec")?,
            progress_interval_ms: parse_opt(get("progress", "interval_ms"), "interval_ms")?,
            min_percent_delta: parse_opt(get("progress", "min_percent_delta"), "min_percent_delta")?,
            signing_key_file: get("security", "signing_key_file").map(PathBuf::from),
        })
    }

    /// Write the file to the default location.
    pub fn save(&self) -> InstallerResult<()> {
        self.save_to(&config_file_path())
    }

    /// Write the file to an explicit path.
    pub fn save_to(&self, path: &Path) -> InstallerResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallerError::io(parent, e))?;
        }

        let mut ini = Ini::new();
        let mut set = |section: &str, key: &str, value: Option<String>| {
            if let Some(value) = value {
                ini.with_section(Some(section)).set(key, value);
            }
        };
        let display = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

        set("content", "content_dir", display(&self.content_dir));
        set("content", "state_file", display(&self.state_file));
        set("content", "manifest_url", self.manifest_url.clone());
        set("content", "platform", self.platform.clone());
        set("download", "chunk_timeout_secs", self.chunk_timeout_secs.map(|v| v.to_string()));
        set("download", "connect_timeout_secs", self.connect_timeout_secs.map(|v| v.to_string()));
        set("download", "max_attempts", self.max_attempts.map(|v| v.to_string()));
        set("download", "initial_backoff_ms", self.initial_backoff_ms.map(|v| v.to_string()));
        set("download", "max_backoff_ms", self.max_backoff_ms.map(|v| v.to_string()));
        set("download", "max_bytes_per_sec", self.max_bytes_per_sec.map(|v| v.to_string()));
        set("progress", "interval_ms", self.progress_interval_ms.map(|v| v.to_string()));
        set("progress", "min_percent_delta", self.min_percent_delta.map(|v| v.to_string()));
        set("security", "signing_key_file", display(&self.signing_key_file));

        ini.write_to_file(path).map_err(|e| InstallerError::io(path, e))
    }

    /// Build the runtime configuration, starting from the defaults.
    pub fn to_installer_config(&self) -> InstallerResult<InstallerConfig> {
        let mut config = match &self.content_dir {
            Some(dir) => InstallerConfig::new(dir.clone()),
            None => InstallerConfig::default(),
        };

        if let Some(path) = &self.state_file {
            config = config.with_state_file(path.clone());
        }
        if let Some(url) = &self.manifest_url {
            config = config.with_manifest_url(url.clone());
        }
        if let Some(platform) = &self.platform {
            config = config.with_platform(platform.clone());
        }
        if let Some(secs) = self.chunk_timeout_secs {
            config = config.with_chunk_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.connect_timeout_secs {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = self.initial_backoff_ms {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_backoff_ms {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        config = config.with_max_bytes_per_sec(self.max_bytes_per_sec);
        if let Some(ms) = self.progress_interval_ms {
            config.throttle.min_interval = Duration::from_millis(ms);
        }
        if let Some(delta) = self.min_percent_delta {
            config.throttle.min_percent_delta = delta.max(0.0);
        }
        if let Some(path) = &self.signing_key_file {
            let key = std::fs::read(path).map_err(|e| InstallerError::io(path, e))?;
            config = config.with_signing_key(key);
        }

        Ok(config)
    }
}

fn parse_opt<T: FromStr>(value: Option<String>, key: &str) -> InstallerResult<Option<T>> {
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| InstallerError::Config(format!("invalid value for {}: '{}'", key, v)))
        })
        .transpose()
}
