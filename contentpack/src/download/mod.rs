//! Artifact download engine.
//!
//! - Resumable single-artifact transfer (`engine`)
//! - Byte-range transport abstraction and the reqwest implementation (`transport`)
//! - Exponential backoff (`retry`)
//! - Progress snapshots, throttling and formatting (`progress`)
//!
//! # Architecture
//!
//! ```text
//! DownloadEngine
//!         │
//!         ├── ArtifactTransport (trait)
//!         │       └── ReqwestTransport
//!         │
//!         ├── RetryPolicy (bounded backoff)
//!         │
//!         └── partial file on disk (resume offset)
//!
//! ProgressTracker ── ProgressThrottle ── DownloadProgress events
//! ```

mod engine;
mod progress;
mod retry;
mod transport;

#[cfg(test)]
pub(crate) use transport::mock;

pub use engine::{ensure_free_space, DownloadEngine, TransferRequest, TransferSummary};
pub use progress::{
    format_eta, format_size, format_speed, DownloadPhase, DownloadProgress, DownloadStatus, ProgressThrottle,
    ProgressTracker, ThrottleConfig,
};
pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use transport::{
    status_error, ArtifactTransport, BoxFuture, ByteStream, ReqwestTransport, TransportResponse,
};
