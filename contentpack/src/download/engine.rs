//! Resumable artifact transfer.
//!
//! The engine appends to a partial file on disk and always resumes from its
//! current length, so bytes that reached the file are never fetched twice
//! unless the server refuses range requests.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::transport::{status_error, ArtifactTransport};
use crate::error::{InstallerError, InstallerResult};

/// One artifact to fetch into a partial file.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub pack_id: &'a str,
    pub url: &'a str,
    /// Partial file the bytes are appended to.
    pub dest: &'a Path,
    /// Size declared by the catalog; 0 when unknown.
    pub expected_size: u64,
}

/// Outcome of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    /// Final size of the artifact on disk.
    pub bytes: u64,
    /// Offset the first request of this transfer started from.
    pub resumed_from: u64,
    /// Number of requests issued.
    pub attempts: u32,
}

/// Resumable, cancellable, rate-limited downloader.
#[derive(Clone)]
pub struct DownloadEngine {
    transport: Arc<dyn ArtifactTransport>,
    retry: RetryPolicy,
    chunk_timeout: Duration,
    max_bytes_per_sec: Option<u64>,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("retry", &self.retry)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("max_bytes_per_sec", &self.max_bytes_per_sec)
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    pub fn new(transport: Arc<dyn ArtifactTransport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            chunk_timeout: crate::config::DEFAULT_CHUNK_TIMEOUT,
            max_bytes_per_sec: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_max_bytes_per_sec(mut self, limit: Option<u64>) -> Self {
        self.max_bytes_per_sec = limit.filter(|l| *l > 0);
        self
    }

    pub fn transport(&self) -> &Arc<dyn ArtifactTransport> {
        &self.transport
    }

    /// Download the artifact, resuming from whatever is already on disk.
    ///
    /// Transient failures are retried with backoff; each retry restarts from
    /// the current partial length. `on_progress` receives the absolute byte
    /// count of the partial file.
    pub async fn fetch(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(u64, u64),
    ) -> InstallerResult<TransferSummary> {
        if let Some(parent) = request.dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| InstallerError::io(parent, e))?;
        }

        let resumed_from = partial_len(request.dest).await;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.fetch_once(request, cancel, &mut on_progress).await {
                Ok(bytes) => {
                    info!(
                        pack_id = %request.pack_id,
                        bytes,
                        resumed_from,
                        attempts = attempt,
                        "Transfer complete"
                    );
                    return Ok(TransferSummary {
                        bytes,
                        resumed_from,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() => {
                    let Some(delay) = self.retry.backoff(attempt) else {
                        warn!(pack_id = %request.pack_id, attempts = attempt, error = %e, "Giving up after retries");
                        return Err(e);
                    };
                    warn!(
                        pack_id = %request.pack_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transfer interrupted, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(cancelled(request)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancellationToken,
        on_progress: &mut impl FnMut(u64, u64),
    ) -> InstallerResult<u64> {
        let dest = request.dest;
        let mut offset = partial_len(dest).await;

        if request.expected_size > 0 {
            if offset == request.expected_size {
                debug!(pack_id = %request.pack_id, offset, "Partial already complete");
                on_progress(offset, request.expected_size);
                return Ok(offset);
            }
            if offset > request.expected_size {
                warn!(pack_id = %request.pack_id, offset, expected = request.expected_size, "Partial larger than artifact, restarting");
                remove_partial(dest).await?;
                offset = 0;
            }
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(request)),
            r = tokio::time::timeout(self.chunk_timeout, self.transport.fetch(request.url, offset)) => {
                r.map_err(|_| stall_error(request, self.chunk_timeout))??
            }
        };

        let truncate = match response.status {
            206 => match response.range_start {
                Some(start) if start != offset => {
                    warn!(pack_id = %request.pack_id, offset, start, "Range response at wrong offset, restarting");
                    remove_partial(dest).await?;
                    return Err(InstallerError::Network {
                        url: request.url.to_string(),
                        reason: format!("range response started at {} instead of {}", start, offset),
                    });
                }
                _ => false,
            },
            200 => {
                if offset > 0 {
                    info!(pack_id = %request.pack_id, offset, "Server ignored range request, restarting from 0");
                    offset = 0;
                }
                true
            }
            416 if offset > 0 && response.total_size.map_or(true, |t| t == offset) => {
                // Nothing left to send: the partial already holds every byte.
                debug!(pack_id = %request.pack_id, offset, "Range not satisfiable, partial is complete");
                on_progress(offset, offset);
                return Ok(offset);
            }
            416 if offset > 0 => {
                warn!(pack_id = %request.pack_id, offset, "Partial does not match remote size, restarting");
                remove_partial(dest).await?;
                return Err(InstallerError::Network {
                    url: request.url.to_string(),
                    reason: "requested range not satisfiable".to_string(),
                });
            }
            status => return Err(status_error(request.url, status)),
        };

        let total = response
            .total_size
            .filter(|t| *t > 0)
            .unwrap_or(request.expected_size);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!truncate)
            .truncate(truncate)
            .open(dest)
            .await
            .map_err(|e| InstallerError::write(dest, e))?;

        let mut body = response.body;
        let mut written = offset;
        let started = Instant::now();
        let mut transferred = 0u64;

        let streamed: InstallerResult<()> = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled(request)),
                    r = tokio::time::timeout(self.chunk_timeout, body.next()) => r,
                };
                let chunk = match next {
                    Err(_) => return Err(stall_error(request, self.chunk_timeout)),
                    Ok(None) => return Ok(()),
                    Ok(Some(chunk)) => chunk?,
                };

                file.write_all(&chunk)
                    .await
                    .map_err(|e| InstallerError::write(dest, e))?;
                written += chunk.len() as u64;
                transferred += chunk.len() as u64;
                on_progress(written, total);

                if let Some(limit) = self.max_bytes_per_sec {
                    let target = Duration::from_secs_f64(transferred as f64 / limit as f64);
                    let elapsed = started.elapsed();
                    if target > elapsed {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(cancelled(request)),
                            _ = tokio::time::sleep(target - elapsed) => {}
                        }
                    }
                }
            }
        }
        .await;

        // Everything written so far must be on disk before the next attempt
        // measures the partial length.
        let flushed = file
            .flush()
            .await
            .map_err(|e| InstallerError::write(dest, e));
        drop(file);
        streamed?;
        flushed?;

        if total > 0 && written < total {
            return Err(InstallerError::Network {
                url: request.url.to_string(),
                reason: format!("connection closed after {} of {} bytes", written, total),
            });
        }

        Ok(written)
    }
}

/// Fail with [`InstallerError::DiskSpace`] if `dir` cannot hold `required` bytes.
pub fn ensure_free_space(dir: &Path, required: u64) -> InstallerResult<()> {
    let available = fs2::available_space(dir).map_err(|e| InstallerError::io(dir, e))?;
    if available < required {
        return Err(InstallerError::DiskSpace {
            path: dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

async fn partial_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_partial(path: &Path) -> InstallerResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(InstallerError::io(path, e)),
    }
}

fn cancelled(request: &TransferRequest<'_>) -> InstallerError {
    InstallerError::Cancelled {
        pack_id: request.pack_id.to_string(),
    }
}

fn stall_error(request: &TransferRequest<'_>, after: Duration) -> InstallerError {
    InstallerError::Network {
        url: request.url.to_string(),
        reason: format!("no data received for {}s", after.as_secs_f64()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::transport::mock::{Fault, MemoryTransport};
    use tempfile::TempDir;

    const URL: &str = "mem://core-binaries.tar.gz";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine(transport: &MemoryTransport) -> DownloadEngine {
        DownloadEngine::new(Arc::new(transport.clone())).with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        })
    }

    fn request(dest: &Path, expected_size: u64) -> TransferRequest<'_> {
        TransferRequest {
            pack_id: "core-binaries",
            url: URL,
            dest,
            expected_size,
        }
    }

    #[tokio::test]
    async fn test_fresh_download() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let data = payload(10_000);
        let transport = MemoryTransport::new();
        transport.serve(URL, data.clone());

        let mut last = (0, 0);
        let summary = engine(&transport)
            .fetch(&request(&dest, 10_000), &CancellationToken::new(), |b, t| {
                last = (b, t)
            })
            .await
            .unwrap();

        assert_eq!(summary.bytes, 10_000);
        assert_eq!(summary.attempts, 1);
        assert_eq!(last, (10_000, 10_000));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_after_connection_drop() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let data = payload(10_000);
        let transport = MemoryTransport::new();
        transport.serve(URL, data.clone());
        transport.inject(URL, vec![Fault::DropAfter(5_000)]);

        let summary = engine(&transport)
            .fetch(&request(&dest, 10_000), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert_eq!(summary.attempts, 2);
        let offsets: Vec<u64> = transport.requests().into_iter().map(|(_, o)| o).collect();
        assert_eq!(offsets, vec![0, 5_000]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_existing_partial() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let data = payload(4_000);
        std::fs::write(&dest, &data[..1_500]).unwrap();
        let transport = MemoryTransport::new();
        transport.serve(URL, data.clone());

        let summary = engine(&transport)
            .fetch(&request(&dest, 4_000), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert_eq!(summary.resumed_from, 1_500);
        assert_eq!(transport.requests(), vec![(URL.to_string(), 1_500)]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let data = payload(3_000);
        std::fs::write(&dest, &data[..1_000]).unwrap();
        let transport = MemoryTransport::new();
        transport.serve(URL, data.clone());
        transport.inject(URL, vec![Fault::IgnoreRange]);

        engine(&transport)
            .fetch(&request(&dest, 3_000), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_complete_partial_with_unknown_size() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let data = payload(2_000);
        std::fs::write(&dest, &data).unwrap();
        let transport = MemoryTransport::new();
        transport.serve(URL, data.clone());

        let summary = engine(&transport)
            .fetch(&request(&dest, 0), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        // 416 from the server ends the transfer without touching the file.
        assert_eq!(summary.bytes, 2_000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let transport = MemoryTransport::new();

        let err = engine(&transport)
            .fetch(&request(&dest, 0), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, InstallerError::Http { status: 404, .. }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let transport = MemoryTransport::new();
        transport.serve(URL, payload(100));
        transport.inject(
            URL,
            vec![Fault::Status(503), Fault::Status(503), Fault::Status(503)],
        );

        let err = engine(&transport)
            .fetch(&request(&dest, 100), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let transport = MemoryTransport::new();
        transport.serve(URL, payload(100));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine(&transport)
            .fetch(&request(&dest, 100), &cancel, |_, _| {})
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_bandwidth_cap_slows_transfer() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("core.part");
        let transport = MemoryTransport::new().with_chunk_size(100);
        transport.serve(URL, payload(1_000));

        let started = Instant::now();
        engine(&transport)
            .with_max_bytes_per_sec(Some(10_000))
            .fetch(&request(&dest, 1_000), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_free_space_check() {
        let temp = TempDir::new().unwrap();
        assert!(ensure_free_space(temp.path(), 1).is_ok());
        let err = ensure_free_space(temp.path(), u64::MAX).unwrap_err();
        assert!(matches!(err, InstallerError::DiskSpace { .. }));
    }
}
