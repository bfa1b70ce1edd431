//! Byte-range capable transport for artifact downloads.
//!
//! [`ArtifactTransport`] is the seam between the download engine and the
//! network. The production implementation uses reqwest; tests substitute
//! in-memory transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_RANGE;

use crate::error::{InstallerError, InstallerResult};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = InstallerResult<Bytes>> + Send>>;

/// Response to a (possibly ranged) fetch.
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// First byte offset of the body, as reported by `Content-Range`.
    pub range_start: Option<u64>,
    /// Size of the complete resource, when the server reports it.
    pub total_size: Option<u64>,
    /// Body chunks.
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("range_start", &self.range_start)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Fetches artifact bytes starting at an offset.
///
/// Implementations must be `Send + Sync`; one transport is shared by every
/// pipeline.
pub trait ArtifactTransport: Send + Sync {
    /// Request `url` from byte `offset` onward (`offset == 0` is a plain GET).
    fn fetch(&self, url: &str, offset: u64) -> BoxFuture<'_, InstallerResult<TransportResponse>>;

    /// Fetch a small resource in full, failing on any non-200 status.
    fn fetch_bytes(&self, url: &str) -> BoxFuture<'_, InstallerResult<Vec<u8>>> {
        let url = url.to_string();
        Box::pin(async move {
            let mut response = self.fetch(&url, 0).await?;
            if response.status != 200 {
                return Err(status_error(&url, response.status));
            }
            let mut data = Vec::new();
            while let Some(chunk) = response.body.next().await {
                data.extend_from_slice(&chunk?);
            }
            Ok(data)
        })
    }
}

/// Map a non-success status to the right error class.
///
/// Server-side and throttling statuses are transient; the rest are not.
pub fn status_error(url: &str, status: u16) -> InstallerError {
    match status {
        408 | 429 | 500..=599 => InstallerError::Network {
            url: url.to_string(),
            reason: format!("server responded with HTTP {}", status),
        },
        _ => InstallerError::Http {
            url: url.to_string(),
            status,
        },
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with the given connect timeout.
    ///
    /// No overall request timeout is set; the engine applies a per-chunk
    /// timeout instead so large artifacts are not cut off.
    pub fn new(connect_timeout: Duration) -> InstallerResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("contentpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallerError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ArtifactTransport for ReqwestTransport {
    fn fetch(&self, url: &str, offset: u64) -> BoxFuture<'_, InstallerResult<TransportResponse>> {
        let url = url.to_string();
        Box::pin(async move {
            let mut request = self.client.get(&url);
            if offset > 0 {
                request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
            }

            let response = request.send().await.map_err(|e| network_error(&url, &e))?;
            let status = response.status().as_u16();

            let content_range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            let (range_start, total_size) = match (status, content_range) {
                (206, Some((start, total))) => (Some(start), total),
                (206, None) => (
                    Some(offset),
                    response.content_length().map(|len| len + offset),
                ),
                (416, Some((_, total))) => (None, total),
                _ => (None, response.content_length()),
            };

            let stream_url = url.clone();
            let body = response
                .bytes_stream()
                .map(move |chunk| chunk.map_err(|e| network_error(&stream_url, &e)));

            Ok(TransportResponse {
                status,
                range_start,
                total_size,
                body: Box::pin(body),
            })
        })
    }
}

fn network_error(url: &str, e: &reqwest::Error) -> InstallerError {
    let reason = if e.is_timeout() {
        format!("timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };
    InstallerError::Network {
        url: url.to_string(),
        reason,
    }
}

/// Parse `bytes <start>-<end>/<total>` or `bytes */<total>`.
///
/// Returns the start offset (0 for the unsatisfied form) and the total size
/// when it is not `*`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => 0,
        r => r.split_once('-')?.0.trim().parse().ok()?,
    };
    Some((start, total))
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport used by unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Failure injected into a request.
    #[derive(Debug, Clone)]
    pub enum Fault {
        /// Drop the connection after this many body bytes.
        DropAfter(usize),
        /// Answer with this status and an empty body.
        Status(u16),
        /// Ignore the `Range` offset and answer 200 with the full body.
        IgnoreRange,
    }

    #[derive(Debug, Default)]
    struct Inner {
        resources: HashMap<String, Vec<u8>>,
        faults: HashMap<String, Vec<Fault>>,
        requests: Vec<(String, u64)>,
    }

    /// Serves registered byte buffers, honouring ranges.
    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        inner: Arc<Mutex<Inner>>,
        chunk_size: usize,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self {
                inner: Arc::default(),
                chunk_size: 1024,
            }
        }

        pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
            self.chunk_size = chunk_size.max(1);
            self
        }

        pub fn serve(&self, url: &str, data: Vec<u8>) {
            self.inner.lock().resources.insert(url.to_string(), data);
        }

        /// Queue faults applied to the next requests of `url`, in order.
        pub fn inject(&self, url: &str, faults: Vec<Fault>) {
            self.inner.lock().faults.insert(url.to_string(), faults);
        }

        /// Offsets of every request made so far.
        pub fn requests(&self) -> Vec<(String, u64)> {
            self.inner.lock().requests.clone()
        }
    }

    impl ArtifactTransport for MemoryTransport {
        fn fetch(
            &self,
            url: &str,
            offset: u64,
        ) -> BoxFuture<'_, InstallerResult<TransportResponse>> {
            let url = url.to_string();
            Box::pin(async move {
                let (data, fault) = {
                    let mut inner = self.inner.lock();
                    inner.requests.push((url.clone(), offset));
                    let fault = inner.faults.get_mut(&url).and_then(|f| {
                        if f.is_empty() {
                            None
                        } else {
                            Some(f.remove(0))
                        }
                    });
                    (inner.resources.get(&url).cloned(), fault)
                };

                let Some(data) = data else {
                    return Ok(empty(404, None));
                };
                let total = data.len() as u64;

                let (status, start) = match fault {
                    Some(Fault::Status(status)) => return Ok(empty(status, Some(total))),
                    Some(Fault::IgnoreRange) => (200, 0),
                    _ if offset >= total && offset > 0 => return Ok(empty(416, Some(total))),
                    _ if offset > 0 => (206, offset),
                    _ => (200, 0),
                };

                let mut body = data[start as usize..].to_vec();
                let mut drop_connection = false;
                if let Some(Fault::DropAfter(n)) = fault {
                    body.truncate(n);
                    drop_connection = true;
                }

                let mut items: Vec<InstallerResult<Bytes>> = body
                    .chunks(self.chunk_size)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                if drop_connection {
                    items.push(Err(InstallerError::Network {
                        url: url.clone(),
                        reason: "connection reset".to_string(),
                    }));
                }

                Ok(TransportResponse {
                    status,
                    range_start: (status == 206).then_some(start),
                    total_size: Some(total),
                    body: Box::pin(futures::stream::iter(items)),
                })
            })
        }
    }

    fn empty(status: u16, total_size: Option<u64>) -> TransportResponse {
        TransportResponse {
            status,
            range_start: None,
            total_size,
            body: Box::pin(futures::stream::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MemoryTransport;
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 100-999/1000"),
            Some((100, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((0, None)));
        assert_eq!(parse_content_range("bytes */1000"), Some((0, Some(1000))));
        assert_eq!(parse_content_range("items 0-9/10"), None);
        assert_eq!(parse_content_range("bytes garbage"), None);
    }

    #[test]
    fn test_status_error_classes() {
        assert!(status_error("u", 503).is_retryable());
        assert!(status_error("u", 429).is_retryable());
        assert!(!status_error("u", 404).is_retryable());
        assert!(matches!(
            status_error("u", 403),
            InstallerError::Http { status: 403, .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_bytes_collects_body() {
        let transport = MemoryTransport::new().with_chunk_size(3);
        transport.serve("mem://manifest.json", b"{\"ok\":true}".to_vec());

        let data = transport.fetch_bytes("mem://manifest.json").await.unwrap();
        assert_eq!(data, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_fetch_bytes_missing_resource() {
        let transport = MemoryTransport::new();
        let err = transport.fetch_bytes("mem://missing").await.unwrap_err();
        assert!(matches!(err, InstallerError::Http { status: 404, .. }));
    }
}
