//! Per-pack install pipeline.
//!
//! One task per pack runs the stages strictly in order:
//!
//! ```text
//! Preparing ─► Downloading ─► Verifying ─► [SignatureCheck] ─► Extracting ─► Installing ─► Cleanup
//! ```
//!
//! Every failure is caught here and turned into a record transition plus
//! events, so nothing a pipeline does can take the host down. Pause and
//! cancel arrive through [`PipelineControl`]; the pipeline observes them at
//! the next chunk, hash buffer or archive entry.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ContentPack, PlatformArtifact};
use crate::config::InstallerConfig;
use crate::download::{
    ensure_free_space, DownloadEngine, DownloadPhase, DownloadStatus, ProgressTracker,
    TransferRequest, TransferSummary,
};
use crate::error::{InstallerError, InstallerResult};
use crate::events::EventBus;
use crate::extractor::{Extractor, InstallMarker, StagedInstall};
use crate::integrity::{verify_checksum, verify_signature, SignatureVerifier, VerificationReceipt};
use crate::state::{InstallStatus, InstallationRecord, InstallationStore};

/// Everything a pipeline task needs, shared by all pipelines.
pub(crate) struct PipelineContext {
    pub config: Arc<InstallerConfig>,
    pub catalog: Arc<Catalog>,
    pub store: Arc<InstallationStore>,
    pub events: Arc<EventBus>,
    pub engine: DownloadEngine,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub platform_id: String,
}

/// Why a pipeline was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep the partial artifact so the next start resumes.
    Pause,
    /// Discard everything and return to the previous state.
    Cancel,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Installed,
    Paused,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
struct ControlState {
    phase: DownloadPhase,
    stop: Option<StopReason>,
    /// The stages are done and the outcome is being applied.
    settling: bool,
    /// The outcome is final; nothing is accepted any more.
    settled: bool,
}

/// Stop requests and the phase they are judged against.
///
/// The phase only changes under the same lock a stop request takes, so a
/// request either lands before a phase starts or is refused.
#[derive(Debug)]
pub(crate) struct PipelineControl {
    cancel: CancellationToken,
    state: Mutex<ControlState>,
}

impl PipelineControl {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            state: Mutex::new(ControlState {
                phase: DownloadPhase::Preparing,
                stop: None,
                settling: false,
                settled: false,
            }),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> DownloadPhase {
        self.state.lock().phase
    }

    #[cfg(test)]
    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        self.state.lock().stop
    }

    /// Ask the pipeline to stop. Returns `false` when the current phase
    /// no longer accepts the request.
    ///
    /// Pausing is possible while preparing or downloading; cancelling until
    /// promotion starts. A later request replaces an earlier one. While the
    /// outcome is being applied only a cancel is still taken, and it is
    /// applied on top of that outcome.
    pub(crate) fn request_stop(&self, reason: StopReason) -> bool {
        let mut state = self.state.lock();
        if state.settled {
            return false;
        }
        let accepted = match reason {
            StopReason::Pause => !state.settling && state.phase <= DownloadPhase::Downloading,
            StopReason::Cancel => state.phase < DownloadPhase::Installing,
        };
        if accepted {
            state.stop = Some(reason);
            self.cancel.cancel();
        }
        accepted
    }

    /// Whether the outcome is final.
    pub(crate) fn is_settled(&self) -> bool {
        self.state.lock().settled
    }

    /// Stop taking pauses and report the stop reason the outcome is based on.
    fn begin_settle(&self) -> Option<StopReason> {
        let mut state = self.state.lock();
        state.settling = true;
        state.stop
    }

    /// Finish the outcome if no new request arrived since `handled`.
    ///
    /// Returns the newer request otherwise; the caller applies it and asks
    /// again.
    fn settle(&self, handled: Option<StopReason>) -> Option<StopReason> {
        let mut state = self.state.lock();
        match state.stop {
            Some(reason) if Some(reason) != handled => Some(reason),
            _ => {
                state.settled = true;
                None
            }
        }
    }

    fn enter(&self, pack_id: &str, phase: DownloadPhase) -> InstallerResult<()> {
        let mut state = self.state.lock();
        if state.stop.is_some() {
            return Err(InstallerError::Cancelled {
                pack_id: pack_id.to_string(),
            });
        }
        state.phase = phase;
        Ok(())
    }
}

/// Run one pack's pipeline to completion.
pub(crate) async fn run(
    ctx: Arc<PipelineContext>,
    pack_id: String,
    control: Arc<PipelineControl>,
) -> PipelineOutcome {
    let previous = ctx
        .store
        .get(&pack_id)
        .filter(|r| r.status() == InstallStatus::Installed);

    let mut run = PackRun {
        install_path: ctx.config.install_path(&pack_id),
        partial: ctx.config.partial_path(&pack_id),
        tracker: ProgressTracker::new(&pack_id, 0, ctx.config.throttle.clone()),
        ctx,
        control,
        pack_id,
    };

    info!(pack_id = %run.pack_id, reinstall = previous.is_some(), "Starting content pack pipeline");
    let result = run.execute().await;
    let stop = run.control.begin_settle();

    let (mut outcome, mut handled) = match result {
        Ok(()) => (PipelineOutcome::Installed, stop),
        Err(e) if e.is_cancelled() => match stop {
            Some(StopReason::Pause) => (run.paused(previous.clone()), stop),
            _ => (
                run.cancelled(previous.clone()).await,
                Some(StopReason::Cancel),
            ),
        },
        Err(e) => (run.failed(e, previous.clone()).await, None),
    };

    // A cancel that landed while the outcome was applied still wins.
    while let Some(late) = run.control.settle(handled) {
        debug!(pack_id = %run.pack_id, request = ?late, "Applying stop request received while settling");
        if late == StopReason::Cancel {
            outcome = run.cancelled(previous.clone()).await;
        }
        handled = Some(late);
    }
    outcome
}

struct PackRun {
    ctx: Arc<PipelineContext>,
    control: Arc<PipelineControl>,
    pack_id: String,
    install_path: PathBuf,
    partial: PathBuf,
    tracker: ProgressTracker,
}

impl PackRun {
    async fn execute(&mut self) -> InstallerResult<()> {
        let (pack, artifact) = self
            .ctx
            .catalog
            .artifact(&self.pack_id, &self.ctx.platform_id)?;
        let pack = pack.clone();
        let artifact = artifact.clone();

        self.enter(DownloadPhase::Preparing, 0)?;
        self.set_status(InstallStatus::Downloading)?;
        self.prepare(&pack, &artifact).await?;
        self.finish();

        self.enter(DownloadPhase::Downloading, artifact.compressed_size)?;
        let summary = self.download(&artifact).await?;
        self.finish();

        self.enter(DownloadPhase::Verifying, summary.bytes)?;
        self.set_status(InstallStatus::Verifying)?;
        let mut receipt = self.verify(&artifact).await?;
        self.finish();

        if let Some(signature) = artifact.signature.clone() {
            self.enter(DownloadPhase::SignatureCheck, summary.bytes)?;
            self.set_status(InstallStatus::SignatureCheck)?;
            receipt = self.check_signature(receipt, signature).await?;
            self.finish();
        }

        self.enter(DownloadPhase::Extracting, summary.bytes)?;
        self.set_status(InstallStatus::Extracting)?;
        let staged = self.extract(&pack, &artifact).await?;
        self.finish();

        // Past this point stop requests are refused.
        self.enter(DownloadPhase::Installing, pack.total_size)?;
        self.set_status(InstallStatus::Installing)?;
        self.install(&pack, &receipt, staged).await?;
        self.finish();

        self.enter(DownloadPhase::Cleanup, 0)?;
        remove_file(&self.partial).await;
        self.finish();

        self.ctx.events.progress(self.tracker.complete());
        self.ctx.events.complete(&self.pack_id);
        info!(pack_id = %self.pack_id, version = %pack.version, "Content pack installed");
        Ok(())
    }

    async fn prepare(&self, pack: &ContentPack, artifact: &PlatformArtifact) -> InstallerResult<()> {
        let downloads = self.ctx.config.downloads_dir();
        fs::create_dir_all(&downloads)
            .await
            .map_err(|e| InstallerError::write(&downloads, e))?;

        if !self.ctx.config.check_disk_space {
            return Ok(());
        }
        let have = fs::metadata(&self.partial).await.map(|m| m.len()).unwrap_or(0);
        let required = artifact.compressed_size.saturating_sub(have) + pack.total_size;
        ensure_free_space(&downloads, required)
    }

    async fn download(&mut self, artifact: &PlatformArtifact) -> InstallerResult<TransferSummary> {
        let request = TransferRequest {
            pack_id: &self.pack_id,
            url: &artifact.url,
            dest: &self.partial,
            expected_size: artifact.compressed_size,
        };
        let cancel = self.control.token();
        let tracker = &mut self.tracker;
        let events = &self.ctx.events;

        let summary = self
            .ctx
            .engine
            .fetch(&request, &cancel, |bytes, _total| {
                if let Some(progress) = tracker.update(bytes) {
                    events.progress(progress);
                }
            })
            .await?;

        if summary.resumed_from > 0 {
            debug!(pack_id = %self.pack_id, resumed_from = summary.resumed_from, "Transfer resumed");
        }
        Ok(summary)
    }

    async fn verify(&mut self, artifact: &PlatformArtifact) -> InstallerResult<VerificationReceipt> {
        let pack_id = self.pack_id.clone();
        let path = self.partial.clone();
        let expected = artifact.checksum.clone();
        let cancel = self.control.token();

        self.blocking(move |tracker, events| {
            verify_checksum(&pack_id, &path, &expected, &cancel, |bytes| {
                if let Some(progress) = tracker.update(bytes) {
                    events.progress(progress);
                }
            })
        })
        .await
    }

    async fn check_signature(
        &mut self,
        receipt: VerificationReceipt,
        signature: String,
    ) -> InstallerResult<VerificationReceipt> {
        let path = self.partial.clone();
        let verifier = Arc::clone(&self.ctx.verifier);
        let cancel = self.control.token();

        self.blocking(move |_, _| {
            verify_signature(receipt, &path, &signature, verifier.as_ref(), &cancel)
        })
        .await
    }

    async fn extract(
        &mut self,
        pack: &ContentPack,
        artifact: &PlatformArtifact,
    ) -> InstallerResult<StagedInstall> {
        let extractor = Extractor::new(self.ctx.config.staging_dir(), &self.ctx.platform_id);
        let pack = pack.clone();
        let format = artifact.format;
        let path = self.partial.clone();
        let cancel = self.control.token();

        self.blocking(move |tracker, events| {
            extractor.stage(&pack, format, &path, &cancel, |done, _total| {
                if let Some(progress) = tracker.update(done) {
                    events.progress(progress);
                }
            })
        })
        .await
    }

    async fn install(
        &mut self,
        pack: &ContentPack,
        receipt: &VerificationReceipt,
        staged: StagedInstall,
    ) -> InstallerResult<()> {
        let marker = InstallMarker::new(
            &self.pack_id,
            pack.version.clone(),
            receipt.checksum().clone(),
        );
        let install_path = self.install_path.clone();

        let size = self
            .blocking(move |_, _| staged.promote(&install_path, &marker))
            .await?;
        self.ctx.store.mark_installed(
            receipt,
            &self.install_path,
            pack.version.clone(),
            size,
        )?;
        Ok(())
    }

    /// Run blocking work on the blocking pool with access to the tracker.
    async fn blocking<T, F>(&mut self, work: F) -> InstallerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProgressTracker, &EventBus) -> InstallerResult<T> + Send + 'static,
    {
        let mut tracker = self.tracker.clone();
        let events = Arc::clone(&self.ctx.events);

        let joined = tokio::task::spawn_blocking(move || {
            let result = work(&mut tracker, &*events);
            (result, tracker)
        })
        .await;

        match joined {
            Ok((result, tracker)) => {
                self.tracker = tracker;
                result
            }
            Err(e) => Err(InstallerError::io(
                &self.partial,
                io::Error::other(format!("pipeline worker failed: {}", e)),
            )),
        }
    }

    fn enter(&mut self, phase: DownloadPhase, total_bytes: u64) -> InstallerResult<()> {
        self.control.enter(&self.pack_id, phase)?;
        self.ctx
            .events
            .progress(self.tracker.enter_phase(phase, total_bytes));
        Ok(())
    }

    fn finish(&mut self) {
        self.ctx.events.progress(self.tracker.finish_phase());
    }

    fn set_status(&self, status: InstallStatus) -> InstallerResult<()> {
        self.ctx
            .store
            .transition(&self.pack_id, &self.install_path, status)
            .map(|_| ())
    }

    /// Keep the partial artifact; the record stays resumable.
    fn paused(&mut self, previous: Option<InstallationRecord>) -> PipelineOutcome {
        if let Some(previous) = previous {
            self.restore(previous);
        }
        info!(pack_id = %self.pack_id, phase = %self.tracker.phase(), "Content pack download paused");
        self.ctx
            .events
            .progress(self.tracker.set_status(DownloadStatus::Paused));
        PipelineOutcome::Paused
    }

    /// Remove every trace of the run and return to the previous state.
    async fn cancelled(&mut self, previous: Option<InstallationRecord>) -> PipelineOutcome {
        remove_file(&self.partial).await;

        match previous {
            Some(previous) => self.restore(previous),
            None => {
                if let Err(e) = self.set_status(InstallStatus::NotInstalled) {
                    warn!(pack_id = %self.pack_id, error = %e, "Failed to reset cancelled pack");
                }
            }
        }

        info!(pack_id = %self.pack_id, phase = %self.tracker.phase(), "Content pack download cancelled");
        self.ctx
            .events
            .progress(self.tracker.set_status(DownloadStatus::Cancelled));
        PipelineOutcome::Cancelled
    }

    async fn failed(
        &mut self,
        error: InstallerError,
        previous: Option<InstallationRecord>,
    ) -> PipelineOutcome {
        let status = error.failure_status();
        let message = error.to_string();
        warn!(pack_id = %self.pack_id, phase = %self.tracker.phase(), status = %status, error = %message, "Content pack pipeline failed");

        // A corrupt artifact cannot be resumed.
        if status == InstallStatus::Corrupted {
            remove_file(&self.partial).await;
        }

        match previous {
            Some(previous) => self.restore(previous),
            None => {
                if let Err(e) =
                    self.ctx
                        .store
                        .fail(&self.pack_id, &self.install_path, status, &message)
                {
                    warn!(pack_id = %self.pack_id, error = %e, "Failed to record pipeline failure");
                }
            }
        }

        self.ctx
            .events
            .progress(self.tracker.set_status(DownloadStatus::Error));
        self.ctx.events.error(&self.pack_id, message.clone());
        PipelineOutcome::Failed(message)
    }

    /// Put back the installed record of a re-download that did not finish.
    fn restore(&self, previous: InstallationRecord) {
        if let Err(e) = self.ctx.store.restore(previous) {
            warn!(pack_id = %self.pack_id, error = %e, "Failed to restore previous installation record");
        }
    }
}

async fn remove_file(path: &std::path::Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed download artifact"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove download artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_only_while_transferring() {
        let control = PipelineControl::new();
        control.enter("core", DownloadPhase::Verifying).unwrap();

        assert!(!control.request_stop(StopReason::Pause));
        assert!(!control.token().is_cancelled());
        assert!(control.request_stop(StopReason::Cancel));
        assert!(control.token().is_cancelled());
    }

    #[test]
    fn test_cancel_refused_once_installing() {
        let control = PipelineControl::new();
        control.enter("core", DownloadPhase::Installing).unwrap();

        assert!(!control.request_stop(StopReason::Cancel));
        assert_eq!(control.stop_reason(), None);
    }

    #[test]
    fn test_stop_blocks_next_phase() {
        let control = PipelineControl::new();
        assert!(control.request_stop(StopReason::Pause));

        let err = control.enter("core", DownloadPhase::Downloading).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(control.phase(), DownloadPhase::Preparing);
    }

    #[test]
    fn test_settling_takes_only_cancel() {
        let control = PipelineControl::new();
        control.enter("core", DownloadPhase::Downloading).unwrap();
        assert!(control.request_stop(StopReason::Pause));
        assert_eq!(control.begin_settle(), Some(StopReason::Pause));

        assert!(!control.request_stop(StopReason::Pause));
        assert!(control.request_stop(StopReason::Cancel));
        assert_eq!(
            control.settle(Some(StopReason::Pause)),
            Some(StopReason::Cancel)
        );
        assert!(!control.is_settled());

        assert_eq!(control.settle(Some(StopReason::Cancel)), None);
        assert!(control.is_settled());
        assert!(!control.request_stop(StopReason::Cancel));
    }

    #[test]
    fn test_last_stop_request_wins() {
        let control = PipelineControl::new();
        assert!(control.request_stop(StopReason::Pause));
        assert!(control.request_stop(StopReason::Cancel));
        assert_eq!(control.stop_reason(), Some(StopReason::Cancel));
    }
}
