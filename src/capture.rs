//! Capture loop: drives the camera at the target rate with drift-corrected
//! pacing, validates acquisitions on two independent axes, and escalates a
//! dead device only after bounded reinitialize-and-retry cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::time::{sleep, sleep_until, Instant};

use crate::camera::{frame_period, CaptureOutcome, DeviceState, Frame, FrameSource, RawFrame};
use crate::config::PipelineConfig;
use crate::error::DeviceLostError;
use crate::frame_queue::FrameQueue;
use crate::session::SessionStats;

const REINIT_COOLDOWN_CAP_SECS: f64 = 30.0;

/// Why acquisitions failed, kept per cause. The device saying "no frame" and
/// the device handing over an empty buffer are different defects and must
/// stay distinguishable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailureCauses {
    pub device_reported: u64,
    pub empty_payload: u64,
    pub not_ready: u64,
}

impl FailureCauses {
    pub fn total(&self) -> u64 {
        self.device_reported + self.empty_payload + self.not_ready
    }
}

pub struct CaptureLoop {
    config: Arc<PipelineConfig>,
    queue: Arc<FrameQueue>,
    stats: Arc<SessionStats>,
    stop: Arc<AtomicBool>,
    sequence: u64,
    consecutive_failures: u32,
    recovering: bool,
    causes: FailureCauses,
}

impl CaptureLoop {
    pub fn new(
        config: Arc<PipelineConfig>,
        queue: Arc<FrameQueue>,
        stats: Arc<SessionStats>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            queue,
            stats,
            stop,
            sequence: 0,
            consecutive_failures: 0,
            recovering: false,
            causes: FailureCauses::default(),
        }
    }

    pub fn failure_causes(&self) -> FailureCauses {
        self.causes
    }

    /// Run until the stop flag is raised or the device is lost for good.
    pub async fn run(&mut self, source: &mut dyn FrameSource) -> Result<(), DeviceLostError> {
        let period = frame_period(self.config.target_fps);
        info!(
            "[capture] starting {} at {:.2} fps",
            source.describe(),
            self.config.target_fps
        );

        let mut deadline = Instant::now() + period;
        while !self.stop.load(Ordering::Acquire) {
            match source.acquire() {
                CaptureOutcome::Acquired(raw) if raw.data.is_empty() => {
                    self.causes.empty_payload += 1;
                    warn!("[capture] device reported a frame but the buffer is empty");
                    self.note_failure(source).await?;
                }
                CaptureOutcome::Acquired(raw) => self.emit(raw),
                CaptureOutcome::NotReady => {
                    self.causes.not_ready += 1;
                    warn!("[capture] device not ready");
                    self.note_failure(source).await?;
                }
                CaptureOutcome::Failed(cause) => {
                    self.causes.device_reported += 1;
                    warn!("[capture] acquisition failed: {cause}");
                    self.note_failure(source).await?;
                }
            }

            // Pace against the deadline, not a fixed sleep, so sustained FPS
            // tracks the target as capture latency varies.
            sleep_until(deadline).await;
            deadline += period;
            let now = Instant::now();
            if deadline < now {
                // More than a full period behind; resync instead of bursting.
                deadline = now + period;
            }
        }

        info!(
            "[capture] stopped after {} frames ({} acquisition failures)",
            self.sequence,
            self.causes.total()
        );
        Ok(())
    }

    fn emit(&mut self, raw: RawFrame) {
        self.consecutive_failures = 0;
        let device_state = if self.recovering {
            self.recovering = false;
            DeviceState::Degraded
        } else {
            DeviceState::Ok
        };

        self.sequence += 1;
        let frame = Frame {
            data: raw.data,
            width: raw.width,
            height: raw.height,
            sequence: self.sequence,
            captured_mono: std::time::Instant::now(),
            captured_wall: Utc::now(),
            device_state,
        };

        self.stats.inc_captured();
        if let Some(evicted_seq) = self.queue.push(frame) {
            self.stats.inc_dropped();
            warn!("[capture] queue full, evicted oldest frame #{evicted_seq}");
        }
    }

    async fn note_failure(&mut self, source: &mut dyn FrameSource) -> Result<(), DeviceLostError> {
        self.stats.inc_capture_failures();
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.failure_threshold {
            self.recover(source).await?;
        }
        Ok(())
    }

    /// The device looks lost: bounded reinitialize cycles with exponential
    /// backoff, then escalate.
    async fn recover(&mut self, source: &mut dyn FrameSource) -> Result<(), DeviceLostError> {
        warn!(
            "[capture] {} consecutive failures, treating device as lost",
            self.consecutive_failures
        );

        let mut cooldown = Duration::from_secs_f64(self.config.reinit_base_cooldown_secs.max(0.0));
        let mut last_cause = String::from("unknown");

        for attempt in 1..=self.config.reinit_max_attempts {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            match source.reinitialize() {
                Ok(()) => {
                    info!("[capture] device reinitialized on attempt {attempt}");
                    self.consecutive_failures = 0;
                    self.recovering = true;
                    return Ok(());
                }
                Err(e) => {
                    last_cause = e.to_string();
                    warn!(
                        "[capture] reinitialize attempt {attempt}/{} failed: {last_cause}, next retry in {:.1}s",
                        self.config.reinit_max_attempts,
                        cooldown.as_secs_f64()
                    );
                    sleep(cooldown).await;
                    cooldown = Duration::from_secs_f64(
                        (cooldown.as_secs_f64() * 1.5).min(REINIT_COOLDOWN_CAP_SECS),
                    );
                }
            }
        }

        error!("[capture] device did not come back, escalating");
        Err(DeviceLostError {
            attempts: self.config.reinit_max_attempts,
            last_cause,
        })
    }
}
