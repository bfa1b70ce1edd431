//! Installer event bus.
//!
//! Pipelines publish [`InstallerEvent`]s; the presentation layer subscribes to
//! every pack or to a single one. Delivery is fire-and-forget: publishing never
//! waits for subscribers, and a slow subscriber sees `Lagged` from the
//! broadcast receiver instead of holding up a pipeline.
//!
//! Each pack has one publishing task, so events of one pack arrive in the
//! order they were published.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::download::DownloadProgress;

/// Event name of progress snapshots.
pub const PROGRESS_EVENT: &str = "content-download-progress";
/// Event name of successful installs.
pub const COMPLETE_EVENT: &str = "content-download-complete";
/// Event name of failed pipelines.
pub const ERROR_EVENT: &str = "content-download-error";

/// Notification emitted by a pack pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum InstallerEvent {
    #[serde(rename = "content-download-progress")]
    Progress(DownloadProgress),
    #[serde(rename = "content-download-complete")]
    Complete { pack_id: String },
    #[serde(rename = "content-download-error")]
    Error {
        pack_id: String,
        error_message: String,
    },
}

impl InstallerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => PROGRESS_EVENT,
            Self::Complete { .. } => COMPLETE_EVENT,
            Self::Error { .. } => ERROR_EVENT,
        }
    }

    pub fn pack_id(&self) -> &str {
        match self {
            Self::Progress(progress) => &progress.pack_id,
            Self::Complete { pack_id } | Self::Error { pack_id, .. } => pack_id,
        }
    }
}

/// Publish/subscribe hub scoped per pack id.
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    all: broadcast::Sender<InstallerEvent>,
    packs: DashMap<String, broadcast::Sender<InstallerEvent>>,
    latest: DashMap<String, DownloadProgress>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            all,
            packs: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    /// Receive events of every pack.
    pub fn subscribe(&self) -> broadcast::Receiver<InstallerEvent> {
        self.all.subscribe()
    }

    /// Receive events of one pack.
    pub fn subscribe_pack(&self, pack_id: &str) -> broadcast::Receiver<InstallerEvent> {
        self.packs
            .entry(pack_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Last progress snapshot published for a pack.
    pub fn latest_progress(&self, pack_id: &str) -> Option<DownloadProgress> {
        self.latest.get(pack_id).map(|p| p.value().clone())
    }

    pub fn publish(&self, event: InstallerEvent) {
        if let InstallerEvent::Progress(progress) = &event {
            self.latest
                .insert(progress.pack_id.clone(), progress.clone());
        }
        trace!(pack_id = %event.pack_id(), event = event.name(), "Publishing event");

        if let Some(sender) = self.packs.get(event.pack_id()) {
            // No receivers is fine
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    pub fn progress(&self, progress: DownloadProgress) {
        self.publish(InstallerEvent::Progress(progress));
    }

    pub fn complete(&self, pack_id: &str) {
        self.publish(InstallerEvent::Complete {
            pack_id: pack_id.to_string(),
        });
    }

    pub fn error(&self, pack_id: &str, error_message: impl Into<String>) {
        self.publish(InstallerEvent::Error {
            pack_id: pack_id.to_string(),
            error_message: error_message.into(),
        });
    }
}
