use std::path::PathBuf;
use thiserror::Error;

/// Errors from decoding a single NMEA sentence. Rejected input never touches
/// tracker state; the sentence is counted and discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NmeaError {
    #[error("checksum mismatch: sentence carries {expected:02X}, payload computes {computed:02X}")]
    Checksum { expected: u8, computed: u8 },

    #[error("malformed sentence: {0}")]
    Malformed(String),
}

/// Transient camera failure, retried inside the capture loop.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("device reinitialize failed: {0}")]
    ReinitFailed(String),

    #[error("capture command failed: {0}")]
    CommandFailed(String),
}

/// The camera stayed dead through every reinitialize cycle. Fatal to the
/// capture component; the orchestrator shuts the session down.
#[derive(Error, Debug, Clone)]
#[error("camera lost after {attempts} reinitialize attempts: {last_cause}")]
pub struct DeviceLostError {
    pub attempts: u32,
    pub last_cause: String,
}

/// Storage target trouble. Retried per record, never fatal to the pipeline
/// unless the target stays unreachable across consecutive records.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage target not reachable: {0}")]
    Unreachable(PathBuf),

    #[error("insufficient free space on {path}: {available_mb} MB available, {required_mb} MB required")]
    InsufficientSpace {
        path: PathBuf,
        available_mb: u64,
        required_mb: u64,
    },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Clock correction failure. Non-fatal; retried on the next qualifying
/// snapshot after the cooldown interval.
#[derive(Error, Debug, Clone)]
pub enum TimeSyncError {
    #[error("insufficient privilege to set system clock")]
    InsufficientPrivilege,

    #[error("clock set rejected: {0}")]
    ClockSetRejected(String),

    #[error("time service command failed: {0}")]
    CommandFailed(String),
}

/// What a component surfaces to the orchestrator. Everything else is absorbed
/// locally and reflected only in stats and logs.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    DeviceLost(#[from] DeviceLostError),

    #[error("storage target unreachable across {dropped_records} consecutive records")]
    StorageUnavailable { dropped_records: u64 },
}
