//! Progress reporting for running sessions.
//!
//! Events are pushed through a bounded [`tokio::sync::broadcast`] channel. A
//! subscriber that falls behind loses the oldest events instead of slowing
//! the transfer down; the sender never waits.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::ProgressConfig;
use crate::session::SessionId;

/// Samples kept for the sliding-window speed estimate.
const SPEED_WINDOW: usize = 10;

/// What a session is doing when an event is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ProgressStage {
    /// Bytes are being transferred.
    Downloading,
    /// A transient failure occurred and the transfer will be retried.
    Retrying {
        /// Attempt about to start (2 for the first retry).
        attempt: u32,
        /// Total attempts allowed.
        max_attempts: u32,
        /// Failure that triggered the retry.
        reason: String,
        /// Delay before the attempt starts, in milliseconds.
        delay_ms: u64,
    },
    /// The transcoder is converting to MP3.
    Converting,
    /// Separately downloaded video and audio are being muxed.
    Merging,
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Current stage.
    pub stage: ProgressStage,
    /// Bytes written so far.
    pub bytes_transferred: u64,
    /// Expected total, when known.
    pub total_bytes: Option<u64>,
    /// Recent transfer rate in bytes per second.
    pub rate_bps: f64,
    /// Estimated seconds remaining, when known.
    pub eta_secs: Option<f64>,
}

impl ProgressEvent {
    /// Completion as a percentage (0.0 - 100.0), when the total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        self.total_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.bytes_transferred as f64 / total as f64 * 100.0).min(100.0))
    }

    /// Rate as a human-readable string.
    #[must_use]
    pub fn formatted_rate(&self) -> String {
        format_bytes_per_second(self.rate_bps)
    }

    /// ETA as a human-readable string.
    #[must_use]
    pub fn formatted_eta(&self) -> Option<String> {
        self.eta_secs.map(format_duration)
    }
}

/// Sending half of a session's progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    session_id: SessionId,
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { session_id, sender }
    }

    /// Session this sink reports for.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never blocks; dropped when nobody listens.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish an event for this session.
    pub fn report(
        &self,
        stage: ProgressStage,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        tracker: Option<&ProgressTracker>,
    ) {
        self.emit(ProgressEvent {
            session_id: self.session_id,
            stage,
            bytes_transferred,
            total_bytes,
            rate_bps: tracker.map_or(0.0, ProgressTracker::speed_bps),
            eta_secs: tracker.and_then(|t| t.eta_secs(total_bytes)),
        });
    }
}

/// Decides when a transfer is worth reporting.
///
/// An event is due once `min_interval` has passed or `byte_threshold` bytes
/// have arrived since the last one, whichever comes first.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_interval: Duration,
    byte_threshold: u64,
    last_emit: Option<Instant>,
    last_bytes: u64,
}

impl ProgressThrottle {
    /// Create a throttle from configuration.
    #[must_use]
    pub const fn new(config: &ProgressConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            byte_threshold: config.byte_threshold,
            last_emit: None,
            last_bytes: 0,
        }
    }

    /// Whether an event for `bytes` should go out now. Records it if so.
    pub fn should_emit(&mut self, bytes: u64) -> bool {
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                now.duration_since(last) >= self.min_interval
                    || bytes.saturating_sub(self.last_bytes) >= self.byte_threshold
            }
        };
        if due {
            self.last_emit = Some(now);
            self.last_bytes = bytes;
        }
        due
    }

    /// Forget the last emission, e.g. after a transfer restarts from zero.
    pub const fn reset(&mut self) {
        self.last_emit = None;
        self.last_bytes = 0;
    }
}

/// Sliding-window transfer rate and ETA estimate.
#[derive(Debug)]
pub struct ProgressTracker {
    start_time: Instant,
    bytes: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Start tracking now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes: 0,
            samples: VecDeque::with_capacity(SPEED_WINDOW),
        }
    }

    /// Record the running byte count.
    pub fn record(&mut self, bytes: u64) {
        self.bytes = bytes;
        self.samples.push_back((Instant::now(), bytes));
        if self.samples.len() > SPEED_WINDOW {
            self.samples.pop_front();
        }
    }

    /// Drop rate history, e.g. after a transfer restarts from zero.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.bytes = 0;
        self.start_time = Instant::now();
    }

    /// Seconds since tracking started.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Transfer rate in bytes per second over the recent window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn speed_bps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            let elapsed = self.elapsed_secs();
            return if elapsed > 0.0 {
                self.bytes as f64 / elapsed
            } else {
                0.0
            };
        }

        let time_diff = last.0.duration_since(first.0).as_secs_f64();
        let bytes_diff = last.1.saturating_sub(first.1);
        if time_diff > 0.0 {
            bytes_diff as f64 / time_diff
        } else {
            0.0
        }
    }

    /// Seconds until `total` bytes at the current rate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn eta_secs(&self, total: Option<u64>) -> Option<f64> {
        let remaining = total?.checked_sub(self.bytes)?;
        let speed = self.speed_bps();
        (speed > 0.0).then(|| remaining as f64 / speed)
    }
}

/// Format bytes per second as a human-readable string.
#[must_use]
pub fn format_bytes_per_second(bps: f64) -> String {
    if bps < 1024.0 {
        format!("{bps:.0} B/s")
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else {
        format!("{:.1} MB/s", bps / (1024.0 * 1024.0))
    }
}

/// Format a duration in seconds as `m:ss` or `h:mm:ss`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_duration(secs: f64) -> String {
    let total_secs = secs.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
