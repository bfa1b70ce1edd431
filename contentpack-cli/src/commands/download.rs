//! `download` command.
//!
//! Installs packs one after another (dependencies first) and renders the
//! progress events as bars. Ctrl-C pauses the running transfer; the partial
//! download is resumed by the next run.

use std::collections::HashSet;

use contentpack::download::{format_size, DownloadPhase, DownloadProgress};
use contentpack::state::InstallStatus;
use contentpack::{ContentInstaller, ControlOutcome, InstallerEvent, PipelineOutcome};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::CliError;

/// Download the given packs, or every required pack when none are given.
pub async fn run(
    installer: &ContentInstaller,
    packs: Vec<String>,
    with_deps: bool,
) -> Result<(), CliError> {
    let requested = if packs.is_empty() {
        installer
            .check_content_status()
            .compatible_packs
            .into_iter()
            .filter(|p| p.required)
            .map(|p| p.id)
            .collect()
    } else {
        packs
    };

    let plan = plan(installer, &requested, with_deps)?;
    if plan.is_empty() {
        println!("Nothing to install.");
        return Ok(());
    }
    debug!(plan = ?plan, "Download plan");

    let multi = MultiProgress::new();
    let mut failed = 0;

    for pack_id in &plan {
        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(bar_style());
        bar.set_prefix(pack_id.clone());
        bar.set_message("queued");

        let (outcome, interrupted) = install_one(installer, pack_id, &bar).await?;
        match outcome {
            PipelineOutcome::Installed => bar.finish_with_message("installed"),
            PipelineOutcome::Paused => bar.abandon_with_message("paused"),
            PipelineOutcome::Cancelled => bar.abandon_with_message("cancelled"),
            PipelineOutcome::Failed(message) => {
                failed += 1;
                bar.abandon_with_message(format!("failed: {}", message));
            }
        }

        if interrupted {
            return Err(CliError::Interrupted);
        }
    }

    if failed > 0 {
        return Err(CliError::InstallFailed {
            failed,
            total: plan.len(),
        });
    }
    Ok(())
}

/// Run one pack's pipeline, rendering its events until it ends.
async fn install_one(
    installer: &ContentInstaller,
    pack_id: &str,
    bar: &ProgressBar,
) -> Result<(PipelineOutcome, bool), CliError> {
    let mut events = installer.subscribe_pack(pack_id)?;
    let handle = installer.download_content_pack(pack_id)?;
    if !handle.started() {
        bar.set_message("attached to running download");
    }

    let wait = handle.wait();
    tokio::pin!(wait);
    let mut interrupted = false;
    let mut events_open = true;

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            event = events.recv(), if events_open => match event {
                Ok(InstallerEvent::Progress(progress)) => render(bar, &progress),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(pack_id = %pack_id, skipped, "Progress display lagged"),
                Err(RecvError::Closed) => events_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                match installer.pause_content_download(pack_id)? {
                    ControlOutcome::Applied => bar.set_message("pausing"),
                    _ => bar.set_message("finishing install before exit"),
                }
            }
        }
    };

    Ok((outcome, interrupted))
}

/// Order packs so dependencies come first.
///
/// Dependencies that are already installed are skipped; requested packs are
/// always included.
fn plan(
    installer: &ContentInstaller,
    requested: &[String],
    with_deps: bool,
) -> Result<Vec<String>, CliError> {
    fn visit(
        installer: &ContentInstaller,
        pack_id: &str,
        explicit: bool,
        with_deps: bool,
        seen: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), CliError> {
        if !seen.insert(pack_id.to_string()) {
            return Ok(());
        }
        let pack = installer.catalog().describe(pack_id)?;

        if with_deps {
            for dependency in &pack.dependencies {
                visit(installer, dependency, false, with_deps, seen, order)?;
            }
        }

        let installed = installer
            .record(pack_id)
            .is_some_and(|r| r.status() == InstallStatus::Installed);
        if explicit || !installed {
            if !explicit && !pack.supports(installer.platform_id()) {
                warn!(pack_id = %pack_id, "Dependency is not available for this platform");
                return Ok(());
            }
            order.push(pack_id.to_string());
        }
        Ok(())
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for pack_id in requested {
        visit(installer, pack_id, true, with_deps, &mut seen, &mut order)?;
    }
    Ok(order)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>16.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn render(bar: &ProgressBar, progress: &DownloadProgress) {
    bar.set_position(progress.percentage.round() as u64);

    let message = match progress.phase {
        DownloadPhase::Downloading => {
            let mut message = format!(
                "downloading {} / {}  {}",
                format_size(progress.bytes_downloaded),
                format_size(progress.total_bytes),
                progress.speed_formatted
            );
            if !progress.eta.is_empty() {
                message.push_str(&format!("  eta {}", progress.eta));
            }
            message
        }
        phase => phase.to_string(),
    };
    bar.set_message(message);
}
