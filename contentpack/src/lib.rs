//! contentpack - Content pack installer
//!
//! Delivers, verifies and installs the platform-specific binary bundles an
//! application depends on: resumable downloads, checksum and signature
//! verification, atomic extraction, and durable installation state with
//! live progress events.
//!
//! # Example
//!
//! ```no_run
//! use contentpack::config::InstallerConfig;
//! use contentpack::service::ContentInstaller;
//!
//! # async fn run() -> contentpack::error::InstallerResult<()> {
//! let installer = ContentInstaller::from_config(InstallerConfig::default()).await?;
//! let handle = installer.download_content_pack("core-binaries")?;
//! let outcome = handle.wait().await;
//! println!("{:?}", outcome);
//! installer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod binaries;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod extractor;
pub mod integrity;
pub mod pipeline;
pub mod service;
pub mod state;

pub use error::{InstallerError, InstallerResult};
pub use events::InstallerEvent;
pub use pipeline::PipelineOutcome;
pub use service::{ContentInstaller, ContentStatus, ControlOutcome, DownloadHandle};
