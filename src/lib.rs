//! GPS-correlated image acquisition for seabed survey.
//!
//! Merges two independently-clocked, unreliable sources — a serial NMEA GPS
//! stream and a USB camera — into time-ordered, geotagged image records:
//! one image file plus one JSON sidecar per frame, with a session summary at
//! the end. Everything runs as one worker task per I/O-bound component, with
//! a bounded drop-oldest queue as the only cross-worker hand-off.

pub mod camera;
pub mod capture;
pub mod clock_sync;
pub mod config;
pub mod error;
pub mod frame_queue;
pub mod geotag;
pub mod gps_reader;
pub mod nmea;
pub mod position;
pub mod session;
pub mod storage;

pub use camera::{CaptureOutcome, CommandCamera, Frame, FrameSource, SimulatedCamera};
pub use config::PipelineConfig;
pub use error::{DeviceLostError, NmeaError, PipelineError, StorageError, TimeSyncError};
pub use geotag::Sidecar;
pub use gps_reader::GpsInput;
pub use position::{GpsFix, PositionSnapshot, PositionTracker};
pub use session::{Pipeline, SessionStats, SessionSummary, StatsSnapshot};
pub use storage::StorageTarget;
