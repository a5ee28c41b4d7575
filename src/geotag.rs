//! Geotagger/writer: pairs each dequeued frame with the freshest position
//! snapshot inside the tolerance window and persists image + JSON sidecar.
//! Position absence never blocks image preservation — the record goes out
//! unpositioned, with the position fields omitted rather than zero-filled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::SecondsFormat;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::camera::Frame;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StorageError};
use crate::frame_queue::FrameQueue;
use crate::position::{PositionSnapshot, PositionTracker};
use crate::session::SessionStats;
use crate::storage::StorageTarget;

/// Metadata sidecar written next to every image, same stem. Position fields
/// are only present on positioned records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sidecar {
    pub filename: String,
    pub captured_at: String,
    pub sequence: u64,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub device_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_age_secs: Option<f64>,
}

impl Sidecar {
    pub fn positioned(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Whether a snapshot may be paired with a frame captured at `frame_mono`:
/// the snapshot must be valid and its position-update instant within the
/// pairing tolerance of the capture instant (either side — the fix may have
/// arrived just after the frame).
pub fn pair_with_frame(
    snapshot: &PositionSnapshot,
    frame_mono: Instant,
    tolerance: Duration,
) -> bool {
    if !snapshot.valid {
        return false;
    }
    let Some(updated_at) = snapshot.updated_at else {
        return false;
    };
    let delta = if updated_at >= frame_mono {
        updated_at - frame_mono
    } else {
        frame_mono - updated_at
    };
    delta <= tolerance
}

/// Build the sidecar for a frame, with or without a paired snapshot.
pub fn build_sidecar(frame: &Frame, paired: Option<&PositionSnapshot>, image_name: &str) -> Sidecar {
    let mut sidecar = Sidecar {
        filename: image_name.to_string(),
        captured_at: frame.captured_wall.to_rfc3339_opts(SecondsFormat::Millis, true),
        sequence: frame.sequence,
        file_size: frame.data.len() as u64,
        width: frame.width,
        height: frame.height,
        device_state: frame.device_state.as_str().to_string(),
        latitude: None,
        longitude: None,
        altitude: None,
        fix_quality: None,
        position_age_secs: None,
    };

    if let Some(snapshot) = paired {
        sidecar.latitude = snapshot.fix.latitude;
        sidecar.longitude = snapshot.fix.longitude;
        sidecar.altitude = snapshot.fix.altitude;
        sidecar.fix_quality = Some(snapshot.fix.quality.as_str().to_string());
        sidecar.position_age_secs = snapshot.updated_at.map(|updated_at| {
            let delta = if updated_at >= frame.captured_mono {
                updated_at - frame.captured_mono
            } else {
                frame.captured_mono - updated_at
            };
            delta.as_secs_f64()
        });
    }
    sidecar
}

/// Filename stem: wall-clock capture time to the millisecond plus sequence,
/// so records sort by time and stay unique across same-millisecond frames.
pub fn record_stem(frame: &Frame) -> String {
    format!(
        "img_{}_{:06}",
        frame.captured_wall.format("%Y%m%d_%H%M%S_%3f"),
        frame.sequence
    )
}

pub struct GeotagWriter {
    config: Arc<PipelineConfig>,
    tracker: Arc<PositionTracker>,
    queue: Arc<FrameQueue>,
    stats: Arc<SessionStats>,
    storage: StorageTarget,
    consecutive_storage_drops: u64,
}

impl GeotagWriter {
    pub fn new(
        config: Arc<PipelineConfig>,
        tracker: Arc<PositionTracker>,
        queue: Arc<FrameQueue>,
        stats: Arc<SessionStats>,
        storage: StorageTarget,
    ) -> Self {
        Self {
            config,
            tracker,
            queue,
            stats,
            storage,
            consecutive_storage_drops: 0,
        }
    }

    /// Consume frames until the queue closes and drains. Only a storage
    /// target that stays unreachable across consecutive records escalates.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        info!("[writer] writing to {}", self.storage.root().display());
        while let Some(frame) = self.queue.pop().await {
            self.write_record(frame).await;
            if self.consecutive_storage_drops >= self.config.storage_failure_limit {
                error!(
                    "[writer] storage unreachable across {} consecutive records, escalating",
                    self.consecutive_storage_drops
                );
                return Err(PipelineError::StorageUnavailable {
                    dropped_records: self.consecutive_storage_drops,
                });
            }
        }
        info!("[writer] queue drained, stopping");
        Ok(())
    }

    async fn write_record(&mut self, frame: Frame) {
        let snapshot = self.tracker.snapshot();
        let tolerance = Duration::from_secs_f64(self.config.pairing_tolerance_secs);
        let paired = pair_with_frame(&snapshot, frame.captured_mono, tolerance);

        let stem = record_stem(&frame);
        let image_name = format!("{stem}.{}", self.config.image_ext);
        let sidecar_name = format!("{stem}.json");
        let sidecar = build_sidecar(&frame, paired.then_some(&snapshot), &image_name);

        let sidecar_json = match serde_json::to_vec_pretty(&sidecar) {
            Ok(json) => json,
            Err(e) => {
                error!("[writer] sidecar serialization failed for #{}: {e}", frame.sequence);
                self.stats.inc_writes_dropped();
                return;
            }
        };

        let retry_delay = Duration::from_millis(self.config.write_retry_delay_ms);
        for attempt in 0..=self.config.write_retries {
            match self.try_write(&image_name, &frame.data, &sidecar_name, &sidecar_json) {
                Ok(()) => {
                    self.consecutive_storage_drops = 0;
                    self.stats.inc_written();
                    if !sidecar.positioned() {
                        self.stats.inc_unpositioned();
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "[writer] write attempt {}/{} for #{} failed: {e}",
                        attempt + 1,
                        self.config.write_retries + 1,
                        frame.sequence
                    );
                    if attempt < self.config.write_retries {
                        sleep(retry_delay).await;
                    }
                }
            }
        }

        // Bounded retries exhausted: drop this record, keep the queue moving.
        warn!("[writer] dropping record #{} after retries", frame.sequence);
        self.stats.inc_writes_dropped();
        self.consecutive_storage_drops += 1;
    }

    fn try_write(
        &self,
        image_name: &str,
        image: &[u8],
        sidecar_name: &str,
        sidecar_json: &[u8],
    ) -> Result<(), StorageError> {
        self.storage.verify()?;
        self.storage.atomic_write(image_name, image)?;
        self.storage.atomic_write(sidecar_name, sidecar_json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::DeviceState;
    use crate::nmea::FixQuality;
    use crate::position::GpsFix;
    use chrono::Utc;
    use tempfile::tempdir;

    fn frame_at(mono: Instant, sequence: u64) -> Frame {
        Frame {
            data: vec![0xAB; 128],
            width: 16,
            height: 9,
            sequence,
            captured_mono: mono,
            captured_wall: Utc::now(),
            device_state: DeviceState::Ok,
        }
    }

    fn snapshot_updated_at(updated_at: Instant) -> PositionSnapshot {
        PositionSnapshot {
            fix: GpsFix {
                latitude: Some(-33.702),
                longitude: Some(-70.675),
                altitude: Some(12.5),
                utc: None,
                quality: FixQuality::Gps,
                satellites: Some(6),
                hdop: Some(1.2),
            },
            age: Some(Duration::from_millis(100)),
            valid: true,
            updated_at: Some(updated_at),
        }
    }

    #[test]
    fn test_pairing_prefers_fresh_fix_within_tolerance() {
        let tolerance = Duration::from_secs(1);
        let now = Instant::now();
        let frame_mono = now - Duration::from_millis(500);

        // Fix from 2 s before the frame: outside the window.
        let old_fix = snapshot_updated_at(frame_mono - Duration::from_secs(2));
        assert!(!pair_with_frame(&old_fix, frame_mono, tolerance));

        // Fix from 0.5 s after the frame: inside the window.
        let fresh_fix = snapshot_updated_at(now);
        assert!(pair_with_frame(&fresh_fix, frame_mono, tolerance));
    }

    #[test]
    fn test_invalid_snapshot_never_pairs() {
        let now = Instant::now();
        let mut snapshot = snapshot_updated_at(now);
        snapshot.valid = false;
        assert!(!pair_with_frame(&snapshot, now, Duration::from_secs(1)));
    }

    #[test]
    fn test_unpositioned_sidecar_omits_position_fields() {
        let frame = frame_at(Instant::now(), 3);
        let sidecar = build_sidecar(&frame, None, "img_x_000003.jpg");
        assert!(!sidecar.positioned());

        let value: serde_json::Value = serde_json::to_value(&sidecar).unwrap();
        let object = value.as_object().unwrap();
        for field in ["latitude", "longitude", "altitude", "fix_quality", "position_age_secs"] {
            assert!(!object.contains_key(field), "{field} must be omitted, not null/zero");
        }
        assert_eq!(object["sequence"], 3);
        assert_eq!(object["file_size"], 128);
    }

    #[test]
    fn test_positioned_sidecar_carries_fix_and_age() {
        let now = Instant::now();
        let frame = frame_at(now, 4);
        let snapshot = snapshot_updated_at(now - Duration::from_millis(400));
        let sidecar = build_sidecar(&frame, Some(&snapshot), "img_x_000004.jpg");

        assert_eq!(sidecar.latitude, Some(-33.702));
        assert_eq!(sidecar.longitude, Some(-70.675));
        assert_eq!(sidecar.fix_quality.as_deref(), Some("gps"));
        let age = sidecar.position_age_secs.unwrap();
        assert!((0.3..0.6).contains(&age), "age {age} should be ~0.4s");
    }

    fn writer_fixture(
        storage: StorageTarget,
        config: PipelineConfig,
    ) -> (GeotagWriter, Arc<FrameQueue>, Arc<SessionStats>) {
        let config = Arc::new(config);
        let tracker = Arc::new(PositionTracker::new(Duration::from_secs(5)));
        let queue = Arc::new(FrameQueue::new(8));
        let stats = Arc::new(SessionStats::new());
        let writer = GeotagWriter::new(config, tracker, queue.clone(), stats.clone(), storage);
        (writer, queue, stats)
    }

    #[tokio::test]
    async fn test_unpositioned_record_still_written_and_counted() {
        let dir = tempdir().unwrap();
        let storage = StorageTarget::at(dir.path().to_path_buf(), 0).unwrap();
        let (mut writer, queue, stats) = writer_fixture(storage, PipelineConfig::default());

        queue.push(frame_at(Instant::now(), 1));
        queue.close();
        writer.run().await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_written, 1);
        assert_eq!(snapshot.frames_unpositioned, 1);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with(".jpg")));
        assert!(names.iter().any(|n| n.ends_with(".json")));
    }

    #[tokio::test]
    async fn test_storage_failure_drops_record_after_bounded_retries() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mount");
        let storage = StorageTarget::at(root.clone(), 0).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let config = PipelineConfig {
            write_retries: 2,
            write_retry_delay_ms: 5,
            storage_failure_limit: 10,
            ..PipelineConfig::default()
        };
        let (mut writer, queue, stats) = writer_fixture(storage, config);

        queue.push(frame_at(Instant::now(), 1));
        queue.close();
        writer.run().await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_written, 0);
        assert_eq!(snapshot.writes_dropped, 1);
    }

    #[tokio::test]
    async fn test_unreachable_storage_escalates_after_limit() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mount");
        let storage = StorageTarget::at(root.clone(), 0).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let config = PipelineConfig {
            write_retries: 0,
            write_retry_delay_ms: 1,
            storage_failure_limit: 2,
            ..PipelineConfig::default()
        };
        let (mut writer, queue, _stats) = writer_fixture(storage, config);

        queue.push(frame_at(Instant::now(), 1));
        queue.push(frame_at(Instant::now(), 2));
        queue.close();

        let err = writer.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageUnavailable { dropped_records: 2 }));
    }
}
