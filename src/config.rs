use std::path::PathBuf;

/// All pipeline tuning in one immutable value, built once at startup and
/// passed by reference to every component.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    // ── GPS input ──
    pub gps_device: PathBuf,
    pub gps_reopen_cooldown_secs: f64,
    pub gps_read_timeout_ms: u64,

    // ── Position staleness / pairing ──
    pub staleness_ceiling_secs: f64,
    pub pairing_tolerance_secs: f64,

    // ── Clock correction ──
    pub drift_threshold_secs: f64,
    pub clock_cooldown_secs: f64,
    pub clock_check_interval_secs: f64,

    // ── Camera ──
    pub camera_device: PathBuf,
    pub frame_width: u32,
    pub frame_height: u32,
    pub target_fps: f64,
    pub image_ext: String,
    pub capture_command: String,
    pub reset_command: Option<String>,

    // ── Capture failure handling ──
    pub failure_threshold: u32,
    pub reinit_max_attempts: u32,
    pub reinit_base_cooldown_secs: f64,

    // ── Inter-stage queue ──
    pub queue_capacity: usize,

    // ── Storage ──
    pub preferred_dir: PathBuf,
    pub fallback_dir: PathBuf,
    pub min_free_mb: u64,
    pub write_retries: u32,
    pub write_retry_delay_ms: u64,
    pub storage_failure_limit: u64,

    // ── Session ──
    pub duration_secs: u64,
    pub status_interval_secs: f64,

    // ── Feature flags ──
    pub enable_clock_sync: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gps_device: PathBuf::from("/dev/ttyUSB0"),
            gps_reopen_cooldown_secs: 2.0,
            gps_read_timeout_ms: 500,
            staleness_ceiling_secs: 5.0,
            pairing_tolerance_secs: 1.0,
            drift_threshold_secs: 2.0,
            clock_cooldown_secs: 60.0,
            clock_check_interval_secs: 1.0,
            camera_device: PathBuf::from("/dev/video0"),
            frame_width: 1280,
            frame_height: 720,
            target_fps: 2.0,
            image_ext: "jpg".to_string(),
            capture_command:
                "fswebcam -d {device} -r {width}x{height} --no-banner --jpeg 90 -".to_string(),
            reset_command: None,
            failure_threshold: 5,
            reinit_max_attempts: 10,
            reinit_base_cooldown_secs: 1.0,
            queue_capacity: 32,
            preferred_dir: PathBuf::from("/media/survey"),
            fallback_dir: PathBuf::from("survey_sessions"),
            min_free_mb: 64,
            write_retries: 3,
            write_retry_delay_ms: 250,
            storage_failure_limit: 10,
            duration_secs: 0,
            status_interval_secs: 2.0,
            enable_clock_sync: true,
        }
    }
}
