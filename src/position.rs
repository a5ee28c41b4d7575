//! Shared best-known position/time fix. One short-held lock, snapshot-on-read;
//! readers never see a half-updated fix.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use log::debug;

use crate::nmea::{FixQuality, GgaSentence, RmcSentence, Sentence};

/// Merged fix state. Fields are present or explicitly absent; presence is
/// never inferred from a numeric value.
#[derive(Clone, Debug, PartialEq)]
pub struct GpsFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub utc: Option<DateTime<Utc>>,
    pub quality: FixQuality,
    pub satellites: Option<u32>,
    pub hdop: Option<f64>,
}

impl GpsFix {
    fn empty() -> Self {
        Self {
            latitude: None,
            longitude: None,
            altitude: None,
            utc: None,
            quality: FixQuality::NoFix,
            satellites: None,
            hdop: None,
        }
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Point-in-time copy of the tracker. `age` is the time since the last
/// position update (`None` before the first fix); `valid` requires both
/// coordinates present and age under the staleness ceiling.
#[derive(Clone, Debug)]
pub struct PositionSnapshot {
    pub fix: GpsFix,
    pub age: Option<Duration>,
    pub valid: bool,
    /// Monotonic instant of the last position update, for pairing a fix
    /// against a frame's capture instant.
    pub updated_at: Option<Instant>,
}

struct TrackerState {
    fix: GpsFix,
    updated_at: Option<Instant>,
    /// Date from the most recent RMC, retained so GGA time-of-day can be
    /// promoted to a full UTC datetime.
    last_date: Option<NaiveDate>,
    last_time_of_day: Option<NaiveTime>,
}

pub struct PositionTracker {
    state: Mutex<TrackerState>,
    staleness_ceiling: Duration,
}

impl PositionTracker {
    pub fn new(staleness_ceiling: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                fix: GpsFix::empty(),
                updated_at: None,
                last_date: None,
                last_time_of_day: None,
            }),
            staleness_ceiling,
        }
    }

    /// Merge one decoded sentence. Latitude/longitude move together, and only
    /// when the sentence reports a usable fix; time merges independently so
    /// RMC date and GGA time-of-day can arrive on different sentences.
    pub fn update(&self, sentence: &Sentence) {
        match sentence {
            Sentence::Gga(gga) => self.apply_gga(gga),
            Sentence::Rmc(rmc) => self.apply_rmc(rmc),
            Sentence::Unrecognized { .. } => {}
        }
    }

    fn apply_gga(&self, gga: &GgaSentence) {
        let mut state = self.state.lock().unwrap();

        state.fix.quality = gga.quality;
        if let Some(sats) = gga.satellites {
            state.fix.satellites = Some(sats);
        }
        if let Some(hdop) = gga.hdop {
            state.fix.hdop = Some(hdop);
        }

        if gga.quality.usable() {
            if let (Some(lat), Some(lon)) = (gga.latitude, gga.longitude) {
                state.fix.latitude = Some(lat);
                state.fix.longitude = Some(lon);
                state.fix.altitude = gga.altitude;
                state.updated_at = Some(Instant::now());
            }
        }

        if let Some(tod) = gga.utc {
            merge_time_of_day(&mut state, tod);
        }
    }

    fn apply_rmc(&self, rmc: &RmcSentence) {
        let mut state = self.state.lock().unwrap();

        if rmc.active {
            if let (Some(lat), Some(lon)) = (rmc.latitude, rmc.longitude) {
                state.fix.latitude = Some(lat);
                state.fix.longitude = Some(lon);
                state.updated_at = Some(Instant::now());
            }
        }

        match (rmc.date, rmc.utc) {
            // Date and time on one sentence are authoritative; the rollover
            // heuristic only applies when promoting a lone time-of-day.
            (Some(date), Some(tod)) => {
                state.last_date = Some(date);
                state.last_time_of_day = Some(tod);
                state.fix.utc = Some(Utc.from_utc_datetime(&date.and_time(tod)));
            }
            (Some(date), None) => state.last_date = Some(date),
            (None, Some(tod)) => merge_time_of_day(&mut state, tod),
            (None, None) => {}
        }
    }

    /// Immutable copy with computed age and validity.
    pub fn snapshot(&self) -> PositionSnapshot {
        let state = self.state.lock().unwrap();
        let age = state.updated_at.map(|t| t.elapsed());
        let valid =
            state.fix.has_position() && age.map(|a| a < self.staleness_ceiling).unwrap_or(false);
        PositionSnapshot {
            fix: state.fix.clone(),
            age,
            valid,
            updated_at: state.updated_at,
        }
    }
}

/// Promote a time-of-day to a full UTC datetime using the retained RMC date.
/// When the time-of-day wraps past midnight between sentences, advance the
/// date instead of letting the merged time regress by a day.
fn merge_time_of_day(state: &mut TrackerState, tod: NaiveTime) {
    let Some(mut date) = state.last_date else {
        // No date seen yet; remember the time-of-day for rollover detection
        // but leave fix.utc absent rather than inventing a date.
        state.last_time_of_day = Some(tod);
        return;
    };

    if let Some(previous) = state.last_time_of_day {
        if tod < previous && (previous - tod) > chrono::Duration::hours(12) {
            if let Some(next) = date.succ_opt() {
                debug!(
                    "[position] time-of-day rollover {previous} -> {tod}, advancing date to {}-{:02}-{:02}",
                    next.year(),
                    next.month(),
                    next.day()
                );
                date = next;
                state.last_date = Some(next);
            }
        }
    }

    state.last_time_of_day = Some(tod);
    state.fix.utc = Some(Utc.from_utc_datetime(&date.and_time(tod)));
}
