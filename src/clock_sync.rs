//! One-shot system-clock correction from GPS time. Coordinates with the host
//! network-time service so the two never fight over the clock.

use std::process::Command;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};

use crate::error::TimeSyncError;
use crate::nmea::FixQuality;
use crate::position::PositionSnapshot;

/// OS-facing clock contract: read time, set time, query/suspend/resume the
/// network time service.
pub trait SystemClock: Send {
    fn now(&self) -> DateTime<Utc>;
    fn set_time(&mut self, to: DateTime<Utc>) -> Result<(), TimeSyncError>;
    fn network_sync_active(&mut self) -> Result<bool, TimeSyncError>;
    fn set_network_sync(&mut self, enabled: bool) -> Result<(), TimeSyncError>;
}

/// Real host clock, driven through `date` and `timedatectl`.
pub struct OsClock;

impl OsClock {
    fn run(program: &str, args: &[&str]) -> Result<String, TimeSyncError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| TimeSyncError::CommandFailed(format!("{program}: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_ascii_lowercase().contains("permi") {
                Err(TimeSyncError::InsufficientPrivilege)
            } else {
                Err(TimeSyncError::CommandFailed(format!(
                    "{program} exited {}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
        }
    }
}

impl SystemClock for OsClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn set_time(&mut self, to: DateTime<Utc>) -> Result<(), TimeSyncError> {
        let stamp = to.to_rfc3339_opts(SecondsFormat::Millis, true);
        Self::run("date", &["-u", "-s", &stamp]).map(|_| ()).map_err(|e| match e {
            TimeSyncError::CommandFailed(msg) => TimeSyncError::ClockSetRejected(msg),
            other => other,
        })
    }

    fn network_sync_active(&mut self) -> Result<bool, TimeSyncError> {
        let value = Self::run("timedatectl", &["show", "-p", "NTP", "--value"])?;
        Ok(value.eq_ignore_ascii_case("yes"))
    }

    fn set_network_sync(&mut self, enabled: bool) -> Result<(), TimeSyncError> {
        let flag = if enabled { "true" } else { "false" };
        Self::run("timedatectl", &["set-ntp", flag]).map(|_| ())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Evaluating,
    Correcting,
}

/// Watches tracker snapshots and applies at most one clock correction per
/// cooldown interval. Failures are non-fatal; the next qualifying snapshot
/// after the cooldown retries.
pub struct ClockSynchronizer<C: SystemClock> {
    clock: C,
    drift_threshold: Duration,
    cooldown: Duration,
    state: SyncState,
    last_attempt: Option<Instant>,
    corrections: u64,
}

impl<C: SystemClock> ClockSynchronizer<C> {
    pub fn new(clock: C, drift_threshold: Duration, cooldown: Duration) -> Self {
        Self {
            clock,
            drift_threshold,
            cooldown,
            state: SyncState::Idle,
            last_attempt: None,
            corrections: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn corrections_applied(&self) -> u64 {
        self.corrections
    }

    /// Evaluate one snapshot. Returns the corrected time when a correction
    /// was applied, `None` when nothing qualified.
    pub fn evaluate(
        &mut self,
        snapshot: &PositionSnapshot,
    ) -> Result<Option<DateTime<Utc>>, TimeSyncError> {
        let Some(fix_utc) = snapshot.fix.utc else {
            self.state = SyncState::Idle;
            return Ok(None);
        };
        if !Self::qualifies(snapshot) {
            self.state = SyncState::Idle;
            return Ok(None);
        }
        self.state = SyncState::Evaluating;

        // The fix's UTC stamp is `age` old by the time we read it.
        let age = chrono::Duration::from_std(snapshot.age.unwrap_or_default())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let gps_now = fix_utc + age;
        let system_now = self.clock.now();
        let drift = (system_now - gps_now).abs();

        let threshold = chrono::Duration::from_std(self.drift_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if drift <= threshold {
            debug!("[clock] drift {} ms within threshold", drift.num_milliseconds());
            self.state = SyncState::Idle;
            return Ok(None);
        }

        if let Some(last) = self.last_attempt {
            if last.elapsed() < self.cooldown {
                self.state = SyncState::Idle;
                return Ok(None);
            }
        }

        self.state = SyncState::Correcting;
        self.last_attempt = Some(Instant::now());
        let result = self.correct(gps_now, drift.num_milliseconds());
        self.state = SyncState::Idle;
        result.map(Some)
    }

    fn qualifies(snapshot: &PositionSnapshot) -> bool {
        snapshot.valid && snapshot.fix.quality >= FixQuality::Gps && snapshot.fix.utc.is_some()
    }

    fn correct(&mut self, to: DateTime<Utc>, drift_ms: i64) -> Result<DateTime<Utc>, TimeSyncError> {
        let ntp_was_active = self.clock.network_sync_active().unwrap_or(false);
        if ntp_was_active {
            self.clock.set_network_sync(false)?;
        }

        let set_result = self.clock.set_time(to);

        // Restore the time service to its prior state even when the set failed.
        if ntp_was_active {
            if let Err(e) = self.clock.set_network_sync(true) {
                warn!("[clock] failed to resume network time sync: {e}");
            }
        }

        set_result?;
        self.corrections += 1;
        info!(
            "[clock] corrected system clock by {} ms to {}",
            drift_ms,
            to.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        Ok(to)
    }
}
