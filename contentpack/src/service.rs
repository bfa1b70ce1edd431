//! Installer service: the command surface used by the presentation layer.
//!
//! [`ContentInstaller`] owns the catalog, the state store, the event bus and
//! the registry of running pipelines. Every command returns immediately;
//! long work happens in one tokio task per pack.
//!
//! # Startup
//!
//! [`ContentInstaller::open`] loads the store, repairs interrupted
//! promotions, purges stale staging data and reconciles every record against
//! the filesystem before any command is accepted.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::binaries::{BinaryPaths, CORE_PACK_ID};
use crate::catalog::{current_platform, Catalog, ContentPack};
use crate::config::InstallerConfig;
use crate::download::{
    ArtifactTransport, DownloadEngine, DownloadProgress, DownloadStatus, ReqwestTransport,
};
use crate::error::{InstallerError, InstallerResult};
use crate::events::{EventBus, InstallerEvent};
use crate::extractor::recover_staging;
use crate::integrity::HmacVerifier;
use crate::pipeline::{self, PipelineContext, PipelineControl, PipelineOutcome, StopReason};
use crate::state::{InstallStatus, InstallationRecord, InstallationStore, ReconcileChange};

/// Answer to a status query.
#[derive(Debug, Clone, Serialize)]
pub struct ContentStatus {
    pub current_platform: String,
    pub app_version: String,
    pub compatible_packs: Vec<ContentPack>,
    pub installation_status: BTreeMap<String, InstallStatus>,
}

/// Result of a pause or cancel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The request was accepted.
    Applied,
    /// No pipeline is running for the pack.
    NotRunning,
    /// The pipeline is past the point where the request applies.
    NotApplicable,
}

/// Handle to a started or attached pipeline.
#[derive(Debug)]
pub struct DownloadHandle {
    pack_id: String,
    started: bool,
    outcome: watch::Receiver<Option<PipelineOutcome>>,
}

impl DownloadHandle {
    pub fn pack_id(&self) -> &str {
        &self.pack_id
    }

    /// `false` when the call attached to a pipeline that was already running.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Wait for the pipeline to end.
    pub async fn wait(mut self) -> PipelineOutcome {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| PipelineOutcome::Failed("pipeline task ended unexpectedly".into()))
    }
}

struct Running {
    control: Arc<PipelineControl>,
    outcome: watch::Receiver<Option<PipelineOutcome>>,
}

impl Running {
    fn is_active(&self) -> bool {
        self.outcome.borrow().is_none()
            && self.outcome.has_changed().is_ok()
            && !self.control.is_settled()
    }

    fn handle(&self, pack_id: &str, started: bool) -> DownloadHandle {
        DownloadHandle {
            pack_id: pack_id.to_string(),
            started,
            outcome: self.outcome.clone(),
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, Running>>>;

/// The content pack installer.
pub struct ContentInstaller {
    ctx: Arc<PipelineContext>,
    pipelines: Registry,
    reconciled: Vec<ReconcileChange>,
}

impl std::fmt::Debug for ContentInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentInstaller")
            .field("platform_id", &self.ctx.platform_id)
            .field("content_dir", &self.ctx.config.content_dir)
            .field("running", &self.pipelines.lock().len())
            .finish_non_exhaustive()
    }
}

impl ContentInstaller {
    /// Open the installer over an already loaded catalog.
    pub fn open(
        config: InstallerConfig,
        catalog: Catalog,
        transport: Arc<dyn ArtifactTransport>,
    ) -> InstallerResult<Self> {
        let platform_id = config
            .platform_id
            .clone()
            .unwrap_or_else(|| current_platform().to_string());

        fs::create_dir_all(&config.content_dir)
            .map_err(|e| InstallerError::write(&config.content_dir, e))?;

        let store = InstallationStore::load(&config.state_file)?;
        for pack_id in recover_staging(&config.staging_dir(), &config.content_dir)? {
            info!(pack_id = %pack_id, "Recovered install after interrupted promotion");
        }
        let reconciled = store.reconcile(&config)?;

        let engine = DownloadEngine::new(transport)
            .with_retry(config.retry.clone())
            .with_chunk_timeout(config.chunk_timeout)
            .with_max_bytes_per_sec(config.max_bytes_per_sec);
        let verifier = HmacVerifier::new(config.signing_key.clone());
        let events = EventBus::new(config.event_capacity);

        info!(
            platform = %platform_id,
            packs = catalog.packs().len(),
            records = store.snapshot().len(),
            reconciled = reconciled.len(),
            "Content installer ready"
        );

        Ok(Self {
            ctx: Arc::new(PipelineContext {
                config: Arc::new(config),
                catalog: Arc::new(catalog),
                store: Arc::new(store),
                events: Arc::new(events),
                engine,
                verifier: Arc::new(verifier),
                platform_id,
            }),
            pipelines: Arc::new(Mutex::new(HashMap::new())),
            reconciled,
        })
    }

    /// Open the installer with the HTTP transport and the configured manifest.
    ///
    /// Uses the remote manifest when `manifest_url` is set (cache and embedded
    /// fallbacks apply) and the embedded manifest otherwise.
    pub async fn from_config(config: InstallerConfig) -> InstallerResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.connect_timeout)?);
        let verifier = HmacVerifier::new(config.signing_key.clone());

        let catalog = match &config.manifest_url {
            Some(url) => {
                let (catalog, origin) = Catalog::load_remote(
                    url,
                    &config.manifest_cache_dir,
                    transport.as_ref(),
                    &verifier,
                )
                .await?;
                debug!(origin = ?origin, "Catalog loaded");
                catalog
            }
            None => Catalog::embedded(&verifier)?,
        };

        Self::open(config, catalog, transport)
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.ctx.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.ctx.catalog
    }

    pub fn platform_id(&self) -> &str {
        &self.ctx.platform_id
    }

    /// Changes applied by startup reconciliation.
    pub fn reconciled(&self) -> &[ReconcileChange] {
        &self.reconciled
    }

    /// Current record of a pack.
    pub fn record(&self, pack_id: &str) -> Option<InstallationRecord> {
        self.ctx.store.get(pack_id)
    }

    /// Platform, version, compatible packs and their install status.
    pub fn check_content_status(&self) -> ContentStatus {
        let compatible_packs: Vec<ContentPack> = self
            .ctx
            .catalog
            .compatible_packs(&self.ctx.platform_id)
            .into_iter()
            .cloned()
            .collect();

        // First query creates the record of every compatible pack.
        let installation_status = compatible_packs
            .iter()
            .map(|pack| {
                let record = self
                    .ctx
                    .store
                    .get_or_create(&pack.id, &self.ctx.config.install_path(&pack.id));
                (pack.id.clone(), record.status())
            })
            .collect();

        ContentStatus {
            current_platform: self.ctx.platform_id.clone(),
            app_version: self.ctx.config.app_version.clone(),
            compatible_packs,
            installation_status,
        }
    }

    /// Start a pack's pipeline, or attach to the one already running.
    ///
    /// Must be called within a tokio runtime. Returns as soon as the task is
    /// spawned.
    pub fn download_content_pack(&self, pack_id: &str) -> InstallerResult<DownloadHandle> {
        self.ctx.catalog.artifact(pack_id, &self.ctx.platform_id)?;

        let mut pipelines = self.pipelines.lock();
        if let Some(running) = pipelines.get(pack_id) {
            if running.is_active() {
                debug!(pack_id = %pack_id, "Attaching to running pipeline");
                return Ok(running.handle(pack_id, false));
            }
        }

        let control = Arc::new(PipelineControl::new());
        let (tx, rx) = watch::channel(None);
        let running = Running {
            control: Arc::clone(&control),
            outcome: rx,
        };
        let handle = running.handle(pack_id, true);
        pipelines.insert(pack_id.to_string(), running);

        let ctx = Arc::clone(&self.ctx);
        let registry = Arc::clone(&self.pipelines);
        let id = pack_id.to_string();
        tokio::spawn(async move {
            let outcome = pipeline::run(ctx, id.clone(), Arc::clone(&control)).await;
            {
                // A newer pipeline may own the slot already.
                let mut pipelines = registry.lock();
                if pipelines
                    .get(&id)
                    .is_some_and(|r| Arc::ptr_eq(&r.control, &control))
                {
                    pipelines.remove(&id);
                }
            }
            debug!(pack_id = %id, outcome = ?outcome, "Pipeline finished");
            let _ = tx.send(Some(outcome));
        });

        Ok(handle)
    }

    /// Pause a running transfer, keeping the partial artifact.
    pub fn pause_content_download(&self, pack_id: &str) -> InstallerResult<ControlOutcome> {
        self.ctx.catalog.describe(pack_id)?;
        Ok(self.stop(pack_id, StopReason::Pause))
    }

    /// Cancel a pack's pipeline and discard its partial data.
    ///
    /// A pack that is not running but holds a failed or paused download is
    /// reset to `not_installed`. An installed pack with a paused re-download
    /// only loses the partial artifact and stays `installed`.
    pub fn cancel_content_download(&self, pack_id: &str) -> InstallerResult<ControlOutcome> {
        self.ctx.catalog.describe(pack_id)?;

        let mut pipelines = self.pipelines.lock();
        if let Some(running) = pipelines.get(pack_id) {
            if running.is_active() {
                return Ok(if running.control.request_stop(StopReason::Cancel) {
                    info!(pack_id = %pack_id, "Cancel requested");
                    ControlOutcome::Applied
                } else {
                    ControlOutcome::NotApplicable
                });
            }
            pipelines.remove(pack_id);
        }

        // Held so no pipeline starts while the leftovers are removed.
        let status = self.ctx.store.get(pack_id).map(|r| r.status());
        let partial = self.ctx.config.partial_path(pack_id);
        match status {
            Some(
                InstallStatus::Downloading
                | InstallStatus::DownloadError
                | InstallStatus::Corrupted,
            ) => {
                remove_partial(pack_id, &partial);
                self.ctx.store.transition(
                    pack_id,
                    &self.ctx.config.install_path(pack_id),
                    InstallStatus::NotInstalled,
                )?;
                self.report_cancelled(pack_id);
                info!(pack_id = %pack_id, from = ?status, "Reset idle pack");
                Ok(ControlOutcome::Applied)
            }
            Some(InstallStatus::Installed) if partial.exists() => {
                remove_partial(pack_id, &partial);
                self.report_cancelled(pack_id);
                info!(pack_id = %pack_id, "Discarded paused re-download");
                Ok(ControlOutcome::Applied)
            }
            _ => Ok(ControlOutcome::NotRunning),
        }
    }

    fn report_cancelled(&self, pack_id: &str) {
        let mut progress = self
            .ctx
            .events
            .latest_progress(pack_id)
            .unwrap_or_else(|| DownloadProgress::queued(pack_id, 0));
        progress.status = DownloadStatus::Cancelled;
        progress.speed_bytes_per_sec = 0;
        self.ctx.events.progress(progress);
    }

    /// Last progress snapshot of a pack.
    pub fn download_progress(&self, pack_id: &str) -> Option<DownloadProgress> {
        self.ctx.events.latest_progress(pack_id)
    }

    pub fn is_running(&self, pack_id: &str) -> bool {
        self.pipelines
            .lock()
            .get(pack_id)
            .is_some_and(Running::is_active)
    }

    /// Events of every pack.
    pub fn subscribe(&self) -> broadcast::Receiver<InstallerEvent> {
        self.ctx.events.subscribe()
    }

    /// Events of one catalog pack.
    pub fn subscribe_pack(
        &self,
        pack_id: &str,
    ) -> InstallerResult<broadcast::Receiver<InstallerEvent>> {
        self.ctx.catalog.describe(pack_id)?;
        Ok(self.ctx.events.subscribe_pack(pack_id))
    }

    /// Paths of the bundled tools, once the core pack is installed.
    pub fn binary_paths(&self) -> InstallerResult<Option<BinaryPaths>> {
        let Some(record) = self.ctx.store.get(CORE_PACK_ID) else {
            return Ok(None);
        };
        if record.status() != InstallStatus::Installed {
            return Ok(None);
        }

        let paths = BinaryPaths::resolve(record.install_path(), &self.ctx.platform_id);
        paths.ensure_executable()?;
        Ok(Some(paths))
    }

    /// Pause every running pipeline, wait for them to settle and flush state.
    pub async fn shutdown(&self) -> InstallerResult<()> {
        let handles: Vec<DownloadHandle> = {
            let pipelines = self.pipelines.lock();
            pipelines
                .iter()
                .filter(|(_, r)| r.is_active())
                .map(|(id, r)| {
                    if !r.control.request_stop(StopReason::Pause) {
                        debug!(pack_id = %id, "Letting pipeline finish before shutdown");
                    }
                    r.handle(id, false)
                })
                .collect()
        };

        for handle in handles {
            let pack_id = handle.pack_id().to_string();
            let outcome = handle.wait().await;
            debug!(pack_id = %pack_id, outcome = ?outcome, "Pipeline settled for shutdown");
        }

        self.ctx.store.flush()?;
        info!("Content installer shut down");
        Ok(())
    }

    fn stop(&self, pack_id: &str, reason: StopReason) -> ControlOutcome {
        let pipelines = self.pipelines.lock();
        match pipelines.get(pack_id) {
            Some(running) if running.is_active() => {
                if running.control.request_stop(reason) {
                    info!(pack_id = %pack_id, reason = ?reason, "Stop requested");
                    ControlOutcome::Applied
                } else {
                    ControlOutcome::NotApplicable
                }
            }
            _ => ControlOutcome::NotRunning,
        }
    }
}

fn remove_partial(pack_id: &str, partial: &std::path::Path) {
    if let Err(e) = fs::remove_file(partial) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(pack_id = %pack_id, error = %e, "Failed to remove partial download");
        }
    }
}
