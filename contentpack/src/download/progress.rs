//! Progress reporting for pack pipelines.
//!
//! [`ProgressTracker`] turns raw byte counts into [`DownloadProgress`]
//! snapshots, keeps the percentage monotonic within a phase, measures speed
//! and ETA, and decides through [`ProgressThrottle`] which snapshots are
//! worth publishing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Window over which transfer speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Pipeline status as seen by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Active,
    Paused,
    Cancelled,
    Completed,
    Error,
}

/// Pipeline phase. Phases of one run are reported in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    Preparing,
    Downloading,
    Verifying,
    SignatureCheck,
    Extracting,
    Installing,
    Cleanup,
    Complete,
}

impl DownloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::SignatureCheck => "signaturecheck",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Cleanup => "cleanup",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a pack pipeline's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub pack_id: String,
    pub status: DownloadStatus,
    pub phase: DownloadPhase,
    /// 0 to 100, non-decreasing within a phase.
    pub percentage: f64,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub speed_formatted: String,
    pub eta: String,
}

impl DownloadProgress {
    /// Initial snapshot of a pipeline that has not started yet.
    pub fn queued(pack_id: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            pack_id: pack_id.into(),
            status: DownloadStatus::Queued,
            phase: DownloadPhase::Preparing,
            percentage: 0.0,
            bytes_downloaded: 0,
            total_bytes,
            speed_bytes_per_sec: 0,
            speed_formatted: format_speed(0),
            eta: String::new(),
        }
    }
}

/// Progress event rate limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Minimum time between two events of the same phase.
    pub min_interval: Duration,
    /// Minimum percentage advance between two events of the same phase.
    pub min_percent_delta: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            min_percent_delta: 0.5,
        }
    }
}

impl ThrottleConfig {
    /// No rate limiting at all.
    pub fn unthrottled() -> Self {
        Self {
            min_interval: Duration::ZERO,
            min_percent_delta: 0.0,
        }
    }
}

/// Time and percentage-delta gate for progress events.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    config: ThrottleConfig,
    last: Option<(Instant, DownloadPhase, f64)>,
}

impl ProgressThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self { config, last: None }
    }

    /// Whether an intermediate event may be published now.
    ///
    /// The first event of a phase always passes. Admitted events are recorded.
    pub fn admit(&mut self, phase: DownloadPhase, percentage: f64, now: Instant) -> bool {
        let pass = match self.last {
            Some((at, last_phase, last_pct)) if last_phase == phase => {
                now.saturating_duration_since(at) >= self.config.min_interval
                    && percentage - last_pct >= self.config.min_percent_delta
            }
            _ => true,
        };
        if pass {
            self.record(phase, percentage, now);
        }
        pass
    }

    /// Record an event that bypassed the gate (phase boundaries, final events).
    pub fn record(&mut self, phase: DownloadPhase, percentage: f64, now: Instant) {
        self.last = Some((now, phase, percentage));
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Builds progress snapshots for one pipeline run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    current: DownloadProgress,
    throttle: ProgressThrottle,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressTracker {
    pub fn new(pack_id: impl Into<String>, total_bytes: u64, throttle: ThrottleConfig) -> Self {
        Self {
            current: DownloadProgress::queued(pack_id, total_bytes),
            throttle: ProgressThrottle::new(throttle),
            samples: VecDeque::new(),
        }
    }

    /// Latest snapshot, whether or not it was published.
    pub fn snapshot(&self) -> &DownloadProgress {
        &self.current
    }

    pub fn phase(&self) -> DownloadPhase {
        self.current.phase
    }

    /// Enter a new phase. The returned snapshot must always be published.
    ///
    /// Entering a phase earlier than the current one is ignored so events
    /// stay in non-decreasing phase order.
    pub fn enter_phase(&mut self, phase: DownloadPhase, total_bytes: u64) -> DownloadProgress {
        self.enter_phase_at(phase, total_bytes, Instant::now())
    }

    pub fn enter_phase_at(
        &mut self,
        phase: DownloadPhase,
        total_bytes: u64,
        now: Instant,
    ) -> DownloadProgress {
        if phase > self.current.phase || self.current.status == DownloadStatus::Queued {
            self.current.phase = phase.max(self.current.phase);
            self.current.percentage = 0.0;
            self.current.bytes_downloaded = 0;
            self.current.total_bytes = total_bytes;
            self.current.speed_bytes_per_sec = 0;
            self.current.speed_formatted = format_speed(0);
            self.current.eta = String::new();
            self.samples.clear();
        }
        self.current.status = DownloadStatus::Active;
        self.throttle.record(self.current.phase, self.current.percentage, now);
        self.current.clone()
    }

    /// Report bytes processed in the current phase.
    ///
    /// Returns a snapshot only when the throttle admits it.
    pub fn update(&mut self, bytes: u64) -> Option<DownloadProgress> {
        self.update_at(bytes, Instant::now())
    }

    pub fn update_at(&mut self, bytes: u64, now: Instant) -> Option<DownloadProgress> {
        self.apply(bytes, now);
        if self
            .throttle
            .admit(self.current.phase, self.current.percentage, now)
        {
            Some(self.current.clone())
        } else {
            None
        }
    }

    /// Close the current phase at 100%. The returned snapshot must be published.
    pub fn finish_phase(&mut self) -> DownloadProgress {
        self.finish_phase_at(Instant::now())
    }

    pub fn finish_phase_at(&mut self, now: Instant) -> DownloadProgress {
        let total = self.current.total_bytes;
        self.apply(total.max(self.current.bytes_downloaded), now);
        self.current.percentage = 100.0;
        self.current.eta = format_eta(0);
        self.throttle.record(self.current.phase, 100.0, now);
        self.current.clone()
    }

    /// Change the status without touching counters (pause, cancel, errors).
    pub fn set_status(&mut self, status: DownloadStatus) -> DownloadProgress {
        self.current.status = status;
        if status != DownloadStatus::Active {
            self.current.speed_bytes_per_sec = 0;
            self.current.speed_formatted = format_speed(0);
            self.current.eta = String::new();
        }
        self.current.clone()
    }

    /// Final snapshot of a successful run.
    pub fn complete(&mut self) -> DownloadProgress {
        let now = Instant::now();
        self.current.phase = DownloadPhase::Complete;
        self.current.status = DownloadStatus::Completed;
        self.current.percentage = 100.0;
        self.current.speed_bytes_per_sec = 0;
        self.current.speed_formatted = format_speed(0);
        self.current.eta = format_eta(0);
        self.throttle.record(DownloadPhase::Complete, 100.0, now);
        self.current.clone()
    }

    fn apply(&mut self, bytes: u64, now: Instant) {
        self.current.bytes_downloaded = bytes;

        let computed = if self.current.total_bytes == 0 {
            0.0
        } else {
            (bytes as f64 / self.current.total_bytes as f64 * 100.0).min(100.0)
        };
        self.current.percentage = self.current.percentage.max(computed);

        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let speed = match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, b0)), Some(&(t1, b1))) if t1 > t0 && b1 >= b0 => {
                ((b1 - b0) as f64 / (t1 - t0).as_secs_f64()) as u64
            }
            _ => self.current.speed_bytes_per_sec,
        };
        self.current.speed_bytes_per_sec = speed;
        self.current.speed_formatted = format_speed(speed);

        let remaining = self.current.total_bytes.saturating_sub(bytes);
        self.current.eta = if speed > 0 {
            format_eta(remaining / speed)
        } else {
            String::new()
        };
    }
}

/// Format a byte count, e.g. `5.0 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", size, UNITS[unit])
}

/// Format a transfer rate, e.g. `5.0 MB/s`.
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

/// Format a remaining time, e.g. `30s`, `1m 30s`, `1h 1m`.
pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
