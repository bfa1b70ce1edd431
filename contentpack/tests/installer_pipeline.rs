//! End-to-end tests of the install pipeline.
//!
//! These tests drive [`ContentInstaller`] against real tar.gz archives served
//! by an in-process transport:
//! - resume after a network failure half way through
//! - checksum mismatch and recovery once the source is fixed
//! - cancellation cleanup
//! - concurrent starts
//! - atomic re-download, and discarding a paused re-download
//! - startup reconciliation after tampering or an interrupted re-download
//!
//! Run with: `cargo test --test installer_pipeline`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use semver::Version;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::broadcast;

use contentpack::catalog::Catalog;
use contentpack::config::InstallerConfig;
use contentpack::download::{
    ArtifactTransport, BoxFuture, ByteStream, DownloadPhase, DownloadStatus, RetryPolicy,
    ThrottleConfig, TransportResponse,
};
use contentpack::error::{InstallerError, InstallerResult};
use contentpack::integrity::HmacVerifier;
use contentpack::state::{InstallStatus, InstallationStore, ReconcileChange};
use contentpack::{ContentInstaller, ControlOutcome, InstallerEvent, PipelineOutcome};

// ============================================================================
// Test transport
// ============================================================================

const PACK: &str = "core-binaries";
const CHUNK: usize = 4096;

/// What happens to the next response body after `at` bytes.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    /// Fail with a network error.
    Drop { at: u64 },
    /// Stop sending without closing.
    Stall { at: u64 },
}

#[derive(Default)]
struct ServerState {
    files: HashMap<String, Vec<u8>>,
    interrupts: Vec<Interrupt>,
    requests: Vec<(String, u64)>,
}

/// Range-capable transport over in-memory files.
#[derive(Clone, Default)]
struct TestServer {
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    fn serve(&self, url: &str, data: Vec<u8>) {
        self.state.lock().files.insert(url.to_string(), data);
    }

    /// Interrupt the next response (one interrupt per response, in order).
    fn interrupt(&self, interrupt: Interrupt) {
        self.state.lock().interrupts.push(interrupt);
    }

    fn offsets(&self) -> Vec<u64> {
        self.state.lock().requests.iter().map(|(_, o)| *o).collect()
    }
}

impl ArtifactTransport for TestServer {
    fn fetch(&self, url: &str, offset: u64) -> BoxFuture<'_, InstallerResult<TransportResponse>> {
        let url = url.to_string();
        Box::pin(async move {
            let (data, interrupt) = {
                let mut state = self.state.lock();
                state.requests.push((url.clone(), offset));
                let interrupt = if state.interrupts.is_empty() {
                    None
                } else {
                    Some(state.interrupts.remove(0))
                };
                (state.files.get(&url).cloned(), interrupt)
            };

            let Some(data) = data else {
                return Ok(TransportResponse {
                    status: 404,
                    range_start: None,
                    total_size: None,
                    body: Box::pin(stream::empty()),
                });
            };
            let total = data.len() as u64;

            let limit = match interrupt {
                Some(Interrupt::Drop { at }) | Some(Interrupt::Stall { at }) => at.clamp(offset, total),
                None => total,
            } as usize;
            let chunks: Vec<InstallerResult<Bytes>> = data[offset as usize..limit]
                .chunks(CHUNK)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let head = stream::iter(chunks);

            let body: ByteStream = match interrupt {
                None => Box::pin(head),
                Some(Interrupt::Drop { .. }) => {
                    let failure = InstallerError::Network {
                        url: url.clone(),
                        reason: "connection reset".to_string(),
                    };
                    Box::pin(head.chain(stream::once(async move { Err(failure) })))
                }
                Some(Interrupt::Stall { .. }) => Box::pin(head.chain(stream::pending())),
            };

            Ok(TransportResponse {
                status: if offset > 0 { 206 } else { 200 },
                range_start: (offset > 0).then_some(offset),
                total_size: Some(total),
                body,
            })
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn url(version: &str) -> String {
    format!("https://downloads.example.com/packs/{}/{}/linux-x64.tar.gz", PACK, version)
}

/// Executable payload unique to a version.
fn payload(name: &str, version: &str) -> Vec<u8> {
    let seed = format!("{}-{}", name, version);
    (0..64 * 1024)
        .map(|i| seed.as_bytes()[i % seed.len()] ^ (i as u8))
        .collect()
}

/// tar.gz with the three tools under a single top-level directory.
fn archive(version: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::none()));
    for name in ["yt-dlp", "aria2c", "ffmpeg"] {
        let data = payload(name, version);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                format!("{}-{}/{}", PACK, version, name),
                data.as_slice(),
            )
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn catalog(version: &str, data: &[u8]) -> Catalog {
    let digest = hex::encode(Sha256::digest(data));
    let json = serde_json::json!({
        "version": "1.0.0",
        "generated_at": "2025-06-01T00:00:00Z",
        "app_version": "0.1.0",
        "content_packs": [{
            "id": PACK,
            "name": "Core Binaries",
            "version": version,
            "required": true,
            "total_size": 3 * 64 * 1024,
            "platforms": [{
                "id": "linux-x64",
                "download_url": url(version),
                "compressed_size": data.len(),
                "checksum": format!("sha256:{}", digest)
            }],
            "files": [
                {"path": "yt-dlp", "size": 64 * 1024, "executable": true},
                {"path": "aria2c", "size": 64 * 1024, "executable": true},
                {"path": "ffmpeg", "size": 64 * 1024, "executable": true}
            ]
        }]
    });
    Catalog::from_json(&json.to_string(), &HmacVerifier::default()).unwrap()
}

fn config(temp: &TempDir) -> InstallerConfig {
    InstallerConfig::new(temp.path().join("content"))
        .with_platform("linux-x64")
        .with_throttle(ThrottleConfig::unthrottled())
        .with_event_capacity(4096)
        .with_disk_space_check(false)
        .with_retry(RetryPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..RetryPolicy::default()
        })
}

fn open(temp: &TempDir, version: &str, server: &TestServer) -> (ContentInstaller, Vec<u8>) {
    open_with(config(temp), version, server)
}

fn open_with(
    config: InstallerConfig,
    version: &str,
    server: &TestServer,
) -> (ContentInstaller, Vec<u8>) {
    let data = archive(version);
    server.serve(&url(version), data.clone());
    let installer =
        ContentInstaller::open(config, catalog(version, &data), Arc::new(server.clone())).unwrap();
    (installer, data)
}

fn drain(rx: &mut broadcast::Receiver<InstallerEvent>) -> Vec<InstallerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_bytes(rx: &mut broadcast::Receiver<InstallerEvent>) {
    loop {
        if let InstallerEvent::Progress(p) = rx.recv().await.unwrap() {
            if p.phase == DownloadPhase::Downloading && p.bytes_downloaded > 0 {
                return;
            }
        }
    }
}

fn error_events(events: &[InstallerEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            InstallerEvent::Error { error_message, .. } => Some(error_message.as_str()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Integration Tests
// ============================================================================

/// A network failure at 50% resumes from the partial instead of byte 0.
#[tokio::test]
async fn test_network_failure_at_half_resumes() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    let (installer, data) = open(&temp, "1.0.0", &server);
    let half = data.len() as u64 / 2;
    server.interrupt(Interrupt::Drop { at: half });
    let mut rx = installer.subscribe_pack(PACK).unwrap();

    let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
    assert_eq!(outcome, PipelineOutcome::Installed);
    assert_eq!(server.offsets(), vec![0, half]);

    let events = drain(&mut rx);
    assert!(error_events(&events).is_empty());

    // Bytes never go backwards during the transfer
    let transferred: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            InstallerEvent::Progress(p) if p.phase == DownloadPhase::Downloading => {
                Some(p.bytes_downloaded)
            }
            _ => None,
        })
        .collect();
    assert!(transferred.windows(2).all(|w| w[0] <= w[1]));

    let last = events
        .iter()
        .rev()
        .find_map(|e| match e {
            InstallerEvent::Progress(p) => Some(p.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last.status, DownloadStatus::Completed);
    assert_eq!(last.percentage, 100.0);
    assert!(events
        .iter()
        .any(|e| matches!(e, InstallerEvent::Complete { pack_id } if pack_id == PACK)));

    let record = installer.record(PACK).unwrap();
    assert_eq!(record.status(), InstallStatus::Installed);
    assert_eq!(record.installed_version(), Some(&Version::new(1, 0, 0)));

    let paths = installer.binary_paths().unwrap().unwrap();
    assert_eq!(std::fs::read(&paths.ffmpeg).unwrap(), payload("ffmpeg", "1.0.0"));
}

/// An altered artifact ends corrupted with one error event; fixing the
/// source and retrying installs the pack.
#[tokio::test]
async fn test_checksum_mismatch_then_retry() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    let (installer, data) = open(&temp, "1.0.0", &server);

    let mut tampered = data.clone();
    let middle = tampered.len() / 2;
    tampered[middle] ^= 0xff;
    server.serve(&url("1.0.0"), tampered);
    let mut rx = installer.subscribe_pack(PACK).unwrap();

    let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
    assert!(matches!(outcome, PipelineOutcome::Failed(_)));

    let events = drain(&mut rx);
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("checksum mismatch"), "{}", errors[0]);

    let record = installer.record(PACK).unwrap();
    assert_eq!(record.status(), InstallStatus::Corrupted);
    assert!(record.last_error().unwrap().contains("checksum mismatch"));
    assert!(!installer.config().install_path(PACK).exists());
    assert!(!installer.config().partial_path(PACK).exists());

    server.serve(&url("1.0.0"), data);
    let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
    assert_eq!(outcome, PipelineOutcome::Installed);
    assert!(installer.record(PACK).unwrap().last_error().is_none());
}

/// Cancelling mid-transfer leaves nothing behind.
#[tokio::test]
async fn test_cancel_mid_transfer_cleans_up() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    let (installer, data) = open(&temp, "1.0.0", &server);
    server.interrupt(Interrupt::Stall {
        at: data.len() as u64 / 3,
    });
    let mut rx = installer.subscribe_pack(PACK).unwrap();

    let handle = installer.download_content_pack(PACK).unwrap();
    wait_for_bytes(&mut rx).await;
    assert_eq!(
        installer.cancel_content_download(PACK).unwrap(),
        ControlOutcome::Applied
    );
    assert_eq!(handle.wait().await, PipelineOutcome::Cancelled);

    assert_eq!(installer.record(PACK).unwrap().status(), InstallStatus::NotInstalled);
    assert!(!installer.config().partial_path(PACK).exists());
    assert!(!installer.config().install_path(PACK).exists());
    let staging = installer.config().staging_dir();
    assert!(!staging.exists() || std::fs::read_dir(&staging).unwrap().count() == 0);
    assert_eq!(
        installer.download_progress(PACK).unwrap().status,
        DownloadStatus::Cancelled
    );
    assert!(error_events(&drain(&mut rx)).is_empty());
}

/// Many simultaneous starts share one pipeline and one transfer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_single_transfer() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    // Slow enough that every start lands while the transfer is running
    let config = config(&temp).with_max_bytes_per_sec(Some(1024 * 1024));
    let (installer, _) = open_with(config, "1.0.0", &server);
    let installer = Arc::new(installer);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let installer = Arc::clone(&installer);
            tokio::spawn(async move { installer.download_content_pack(PACK).unwrap() })
        })
        .collect();

    let mut started = 0;
    let mut handles = Vec::new();
    for task in tasks {
        let handle = task.await.unwrap();
        if handle.started() {
            started += 1;
        }
        handles.push(handle);
    }
    for handle in handles {
        assert_eq!(handle.wait().await, PipelineOutcome::Installed);
    }

    assert_eq!(started, 1);
    assert_eq!(server.offsets(), vec![0]);
}

/// Re-downloading swaps versions atomically; an aborted re-download keeps
/// the old install.
#[tokio::test]
async fn test_redownload_replaces_atomically() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    {
        let (installer, _) = open(&temp, "1.0.0", &server);
        let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
        assert_eq!(outcome, PipelineOutcome::Installed);
        installer.shutdown().await.unwrap();
    }

    let (installer, data) = open(&temp, "2.0.0", &server);
    assert_eq!(installer.record(PACK).unwrap().status(), InstallStatus::Installed);
    let ffmpeg = installer.config().install_path(PACK).join("ffmpeg");

    // Abort a re-download half way: v1 stays usable
    server.interrupt(Interrupt::Stall {
        at: data.len() as u64 / 2,
    });
    let mut rx = installer.subscribe_pack(PACK).unwrap();
    let handle = installer.download_content_pack(PACK).unwrap();
    wait_for_bytes(&mut rx).await;
    assert_eq!(std::fs::read(&ffmpeg).unwrap(), payload("ffmpeg", "1.0.0"));
    installer.cancel_content_download(PACK).unwrap();
    assert_eq!(handle.wait().await, PipelineOutcome::Cancelled);

    let record = installer.record(PACK).unwrap();
    assert_eq!(record.status(), InstallStatus::Installed);
    assert_eq!(record.installed_version(), Some(&Version::new(1, 0, 0)));
    assert_eq!(std::fs::read(&ffmpeg).unwrap(), payload("ffmpeg", "1.0.0"));

    // Complete the re-download
    let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
    assert_eq!(outcome, PipelineOutcome::Installed);
    let record = installer.record(PACK).unwrap();
    assert_eq!(record.installed_version(), Some(&Version::new(2, 0, 0)));
    assert_eq!(std::fs::read(&ffmpeg).unwrap(), payload("ffmpeg", "2.0.0"));
    assert_eq!(
        std::fs::read_dir(installer.config().staging_dir()).unwrap().count(),
        0
    );
}

/// A tampered install is downgraded to corrupted on the next start.
#[tokio::test]
async fn test_restart_detects_tampered_install() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    {
        let (installer, _) = open(&temp, "1.0.0", &server);
        let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
        assert_eq!(outcome, PipelineOutcome::Installed);
        installer.shutdown().await.unwrap();
    }

    let install = temp.path().join("content").join(PACK);
    std::fs::write(install.join("ffmpeg"), b"truncated").unwrap();

    let (installer, _) = open(&temp, "1.0.0", &server);
    assert_eq!(installer.record(PACK).unwrap().status(), InstallStatus::Corrupted);
    assert_eq!(installer.reconciled().len(), 1);
    assert!(installer.binary_paths().unwrap().is_none());

    let status = installer.check_content_status();
    assert_eq!(status.installation_status.get(PACK), Some(&InstallStatus::Corrupted));
}

/// Cancelling a paused re-download removes the partial and keeps the
/// installed version.
#[tokio::test]
async fn test_cancel_paused_redownload_discards_partial() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    {
        let (installer, _) = open(&temp, "1.0.0", &server);
        let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
        assert_eq!(outcome, PipelineOutcome::Installed);
        installer.shutdown().await.unwrap();
    }

    let (installer, data) = open(&temp, "2.0.0", &server);
    server.interrupt(Interrupt::Stall {
        at: data.len() as u64 / 2,
    });
    let mut rx = installer.subscribe_pack(PACK).unwrap();
    let handle = installer.download_content_pack(PACK).unwrap();
    wait_for_bytes(&mut rx).await;
    assert_eq!(
        installer.pause_content_download(PACK).unwrap(),
        ControlOutcome::Applied
    );
    assert_eq!(handle.wait().await, PipelineOutcome::Paused);

    let partial = installer.config().partial_path(PACK);
    assert!(partial.exists());
    assert_eq!(installer.record(PACK).unwrap().status(), InstallStatus::Installed);

    assert_eq!(
        installer.cancel_content_download(PACK).unwrap(),
        ControlOutcome::Applied
    );
    assert!(!partial.exists());
    let record = installer.record(PACK).unwrap();
    assert_eq!(record.status(), InstallStatus::Installed);
    assert_eq!(record.installed_version(), Some(&Version::new(1, 0, 0)));
    assert_eq!(
        installer.download_progress(PACK).unwrap().status,
        DownloadStatus::Cancelled
    );
    assert!(installer.binary_paths().unwrap().is_some());

    assert_eq!(
        installer.cancel_content_download(PACK).unwrap(),
        ControlOutcome::NotRunning
    );
}

/// A crash right after a re-download started keeps the old install on the
/// next start.
#[tokio::test]
async fn test_restart_after_interrupted_redownload_keeps_install() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::default();
    {
        let (installer, _) = open(&temp, "1.0.0", &server);
        let outcome = installer.download_content_pack(PACK).unwrap().wait().await;
        assert_eq!(outcome, PipelineOutcome::Installed);
        installer.shutdown().await.unwrap();
    }

    // What the pipeline persists before the first byte arrives
    let state_file = config(&temp).state_file;
    {
        let store = InstallationStore::load(&state_file).unwrap();
        store
            .transition(
                PACK,
                &temp.path().join("content").join(PACK),
                InstallStatus::Downloading,
            )
            .unwrap();
    }

    let (installer, _) = open(&temp, "2.0.0", &server);
    assert_eq!(
        installer.reconciled(),
        &[ReconcileChange {
            pack_id: PACK.to_string(),
            from: InstallStatus::Downloading,
            to: InstallStatus::Installed,
        }]
    );
    let record = installer.record(PACK).unwrap();
    assert_eq!(record.status(), InstallStatus::Installed);
    assert_eq!(record.installed_version(), Some(&Version::new(1, 0, 0)));

    let paths = installer.binary_paths().unwrap().unwrap();
    assert_eq!(std::fs::read(&paths.ffmpeg).unwrap(), payload("ffmpeg", "1.0.0"));
}
