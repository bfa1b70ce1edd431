//! Logging setup: stderr plus a daily rolling file.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "contentpack=info,contentpack_cli=info";
const LOG_FILE_PREFIX: &str = "contentpack.log";

/// Default directory for log files.
pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("contentpack")
        .join("logs")
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live until
/// the process exits. Without a usable log directory only stderr is used.
pub fn init(log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let filter = || {
        if verbose {
            EnvFilter::new("contentpack=debug,contentpack_cli=debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    };
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(stderr)
            .try_init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer().with_writer(writer).with_ansi(false);

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(stderr)
        .with(file)
        .try_init();
    Some(guard)
}
