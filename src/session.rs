//! Session state: counters shared by every component, the periodic live
//! status file, the final summary document, and the orchestrator that owns
//! component lifecycles and coordinated shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::camera::FrameSource;
use crate::clock_sync::{ClockSynchronizer, OsClock};
use crate::config::PipelineConfig;
use crate::capture::CaptureLoop;
use crate::frame_queue::FrameQueue;
use crate::geotag::GeotagWriter;
use crate::gps_reader::{self, GpsInput};
use crate::position::PositionTracker;
use crate::storage::StorageTarget;

// ─── Counters ────────────────────────────────────────────────────────────────

/// Process-lifetime counters, reset per session. One shared handle, updated
/// by every component; each counter is a single atomic so no lock is ever
/// held across I/O.
pub struct SessionStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_written: AtomicU64,
    frames_unpositioned: AtomicU64,
    writes_dropped: AtomicU64,
    capture_failures: AtomicU64,
    sentences_parsed: AtomicU64,
    sentences_rejected: AtomicU64,
    clock_corrections: AtomicU64,
}

/// Plain copy of the counters, for status/summary documents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_written: u64,
    pub frames_unpositioned: u64,
    pub writes_dropped: u64,
    pub capture_failures: u64,
    pub sentences_parsed: u64,
    pub sentences_rejected: u64,
    pub clock_corrections: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            frames_unpositioned: AtomicU64::new(0),
            writes_dropped: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            sentences_parsed: AtomicU64::new(0),
            sentences_rejected: AtomicU64::new(0),
            clock_corrections: AtomicU64::new(0),
        }
    }

    pub fn inc_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_unpositioned(&self) {
        self.frames_unpositioned.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_writes_dropped(&self) {
        self.writes_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_capture_failures(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_sentences_parsed(&self) {
        self.sentences_parsed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_sentences_rejected(&self) {
        self.sentences_rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_clock_corrections(&self) {
        self.clock_corrections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_unpositioned: self.frames_unpositioned.load(Ordering::Relaxed),
            writes_dropped: self.writes_dropped.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            sentences_parsed: self.sentences_parsed.load(Ordering::Relaxed),
            sentences_rejected: self.sentences_rejected.load(Ordering::Relaxed),
            clock_corrections: self.clock_corrections.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Live status ─────────────────────────────────────────────────────────────

/// Written periodically into the session directory so a running survey can be
/// watched from the field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveStatus {
    pub timestamp: String,
    pub session_id: String,
    pub uptime_seconds: u64,
    pub queue_depth: usize,
    pub position_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_age_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub counts: StatsSnapshot,
}

// ─── Session summary ─────────────────────────────────────────────────────────

/// Why the session ended.
pub const END_DURATION: &str = "duration_elapsed";
pub const END_SIGNAL: &str = "shutdown_signal";
pub const END_DEVICE_LOST: &str = "device_lost";
pub const END_STORAGE: &str = "storage_unavailable";

/// One JSON document per session: counts plus timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: f64,
    pub target_fps: f64,
    pub achieved_fps: f64,
    pub terminated_by: String,
    pub counts: StatsSnapshot,
}

pub const SUMMARY_FILENAME: &str = "session_summary.json";
pub const LIVE_STATUS_FILENAME: &str = "live_status.json";

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Owns component lifecycles. Shutdown stops frame production first, drains
/// the in-flight queue through the writer, and stops the GPS reader last so
/// the freshest position is available for the final frames.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    tracker: Arc<PositionTracker>,
    stats: Arc<SessionStats>,
    queue: Arc<FrameQueue>,
    stop_capture: Arc<AtomicBool>,
    stop_aux: Arc<AtomicBool>,
    shutdown_requested: Arc<AtomicBool>,
    session_id: String,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let session_id = format!("session_{}", Utc::now().timestamp_millis());
        let staleness = Duration::from_secs_f64(config.staleness_ceiling_secs);
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        Self {
            config: Arc::new(config),
            tracker: Arc::new(PositionTracker::new(staleness)),
            stats: Arc::new(SessionStats::new()),
            queue,
            stop_capture: Arc::new(AtomicBool::new(false)),
            stop_aux: Arc::new(AtomicBool::new(false)),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            session_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    pub fn tracker(&self) -> Arc<PositionTracker> {
        self.tracker.clone()
    }

    /// Ask the supervision loop to begin an orderly shutdown (signal handler).
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Drive a full session. Fatal component escalations end the session
    /// through the same orderly shutdown; the cause lands in `terminated_by`.
    pub async fn run(
        &self,
        mut source: Box<dyn FrameSource>,
        gps: GpsInput,
        storage: StorageTarget,
    ) -> anyhow::Result<SessionSummary> {
        let started_wall = Utc::now();
        let started_mono = Instant::now();
        info!(
            "[session] {} starting, storage {}",
            self.session_id,
            storage.root().display()
        );

        let gps_handle = tokio::spawn(gps_reader::run(
            gps,
            self.config.clone(),
            self.tracker.clone(),
            self.stats.clone(),
            self.stop_aux.clone(),
        ));

        let clock_handle = if self.config.enable_clock_sync {
            Some(tokio::spawn(clock_task(
                self.config.clone(),
                self.tracker.clone(),
                self.stats.clone(),
                self.stop_aux.clone(),
            )))
        } else {
            None
        };

        let capture_handle = {
            let mut capture = CaptureLoop::new(
                self.config.clone(),
                self.queue.clone(),
                self.stats.clone(),
                self.stop_capture.clone(),
            );
            tokio::spawn(async move { capture.run(source.as_mut()).await })
        };

        let writer_handle = {
            let mut writer = GeotagWriter::new(
                self.config.clone(),
                self.tracker.clone(),
                self.queue.clone(),
                self.stats.clone(),
                storage.clone(),
            );
            tokio::spawn(async move { writer.run().await })
        };

        // ── Supervision ──
        let status_interval = Duration::from_secs_f64(self.config.status_interval_secs.max(0.5));
        let mut last_status = Instant::now();
        let mut terminated_by = END_DURATION;

        loop {
            sleep(Duration::from_millis(100)).await;

            if last_status.elapsed() >= status_interval {
                self.write_live_status(&storage, started_mono);
                last_status = Instant::now();
            }

            if self.shutdown_requested.load(Ordering::Acquire) {
                terminated_by = END_SIGNAL;
                break;
            }
            if self.config.duration_secs > 0
                && started_mono.elapsed() >= Duration::from_secs(self.config.duration_secs)
            {
                terminated_by = END_DURATION;
                break;
            }
            if capture_handle.is_finished() {
                terminated_by = END_DEVICE_LOST;
                break;
            }
            if writer_handle.is_finished() {
                terminated_by = END_STORAGE;
                break;
            }
        }

        // ── Orderly shutdown: producer, then drain, then GPS last ──
        self.stop_capture.store(true, Ordering::Release);
        match capture_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("[session] capture escalated: {e}");
                terminated_by = END_DEVICE_LOST;
            }
            Err(e) => error!("[session] capture task panicked: {e}"),
        }

        self.queue.close();
        match writer_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("[session] writer escalated: {e}");
                terminated_by = END_STORAGE;
            }
            Err(e) => error!("[session] writer task panicked: {e}"),
        }

        self.stop_aux.store(true, Ordering::Release);
        if let Err(e) = gps_handle.await {
            error!("[session] gps task panicked: {e}");
        }
        if let Some(handle) = clock_handle {
            if let Err(e) = handle.await {
                error!("[session] clock task panicked: {e}");
            }
        }

        // ── Summary ──
        let ended_wall = Utc::now();
        let elapsed = started_mono.elapsed().as_secs_f64();
        let counts = self.stats.snapshot();
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            started_at: started_wall.to_rfc3339_opts(SecondsFormat::Millis, true),
            ended_at: ended_wall.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_seconds: elapsed,
            target_fps: self.config.target_fps,
            achieved_fps: if elapsed > 0.0 {
                counts.frames_captured as f64 / elapsed
            } else {
                0.0
            },
            terminated_by: terminated_by.to_string(),
            counts,
        };

        match serde_json::to_vec_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = storage.atomic_write(SUMMARY_FILENAME, &json) {
                    warn!("[session] could not write summary: {e}");
                }
            }
            Err(e) => warn!("[session] could not serialize summary: {e}"),
        }

        info!(
            "[session] {} ended ({}): captured {} written {} dropped {} unpositioned {}",
            self.session_id,
            summary.terminated_by,
            summary.counts.frames_captured,
            summary.counts.frames_written,
            summary.counts.frames_dropped,
            summary.counts.frames_unpositioned
        );
        Ok(summary)
    }

    fn write_live_status(&self, storage: &StorageTarget, started_mono: Instant) {
        let position = self.tracker.snapshot();
        let status = LiveStatus {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id: self.session_id.clone(),
            uptime_seconds: started_mono.elapsed().as_secs(),
            queue_depth: self.queue.len(),
            position_valid: position.valid,
            position_age_secs: position.age.map(|a| a.as_secs_f64()),
            latitude: position.fix.latitude,
            longitude: position.fix.longitude,
            counts: self.stats.snapshot(),
        };
        match serde_json::to_vec_pretty(&status) {
            Ok(json) => {
                if let Err(e) = storage.atomic_write(LIVE_STATUS_FILENAME, &json) {
                    warn!("[session] could not write live status: {e}");
                }
            }
            Err(e) => warn!("[session] could not serialize live status: {e}"),
        }
    }
}

/// Side-consumer of the tracker: periodically evaluate snapshots and apply at
/// most one clock correction per cooldown. Failures are logged and retried.
async fn clock_task(
    config: Arc<PipelineConfig>,
    tracker: Arc<PositionTracker>,
    stats: Arc<SessionStats>,
    stop: Arc<AtomicBool>,
) {
    let mut sync = ClockSynchronizer::new(
        OsClock,
        Duration::from_secs_f64(config.drift_threshold_secs),
        Duration::from_secs_f64(config.clock_cooldown_secs),
    );
    let check_interval = Duration::from_secs_f64(config.clock_check_interval_secs.max(0.1));

    while !stop.load(Ordering::Acquire) {
        sleep(check_interval).await;
        let snapshot = tracker.snapshot();
        match sync.evaluate(&snapshot) {
            Ok(Some(_)) => stats.inc_clock_corrections(),
            Ok(None) => {}
            Err(e) => warn!("[clock] correction failed, will retry after cooldown: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_reflects_increments() {
        let stats = SessionStats::new();
        stats.inc_captured();
        stats.inc_captured();
        stats.inc_written();
        stats.inc_dropped();
        stats.inc_unpositioned();
        stats.inc_sentences_parsed();
        stats.inc_sentences_rejected();
        stats.inc_clock_corrections();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.frames_written, 1);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.frames_unpositioned, 1);
        assert_eq!(snap.sentences_parsed, 1);
        assert_eq!(snap.sentences_rejected, 1);
        assert_eq!(snap.clock_corrections, 1);
    }

    #[test]
    fn test_summary_round_trips_through_json() {
        let summary = SessionSummary {
            session_id: "session_1".to_string(),
            started_at: "2024-11-19T10:00:00.000Z".to_string(),
            ended_at: "2024-11-19T10:00:30.000Z".to_string(),
            duration_seconds: 30.0,
            target_fps: 2.0,
            achieved_fps: 1.97,
            terminated_by: END_DURATION.to_string(),
            counts: StatsSnapshot {
                frames_captured: 59,
                frames_written: 57,
                frames_dropped: 2,
                ..StatsSnapshot::default()
            },
        };
        let json = serde_json::to_string_pretty(&summary).unwrap();
        let back: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.counts, summary.counts);
        assert_eq!(back.terminated_by, END_DURATION);
    }

    #[test]
    fn test_live_status_flattens_counts() {
        let status = LiveStatus {
            timestamp: "2024-11-19T10:00:00.000Z".to_string(),
            session_id: "session_1".to_string(),
            uptime_seconds: 10,
            queue_depth: 3,
            position_valid: false,
            position_age_secs: None,
            latitude: None,
            longitude: None,
            counts: StatsSnapshot::default(),
        };
        let value = serde_json::to_value(&status).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("frames_captured"));
        assert!(!object.contains_key("latitude"), "absent position must be omitted");
    }
}
