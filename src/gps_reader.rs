//! Serial GPS reader: consumes NMEA lines from the configured device (or any
//! scripted stream), feeds the position tracker, and accounts every sentence.
//! Rejected input is counted and discarded without touching tracker state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::{sleep, timeout};

use crate::config::PipelineConfig;
use crate::nmea::{parse_sentence, Sentence};
use crate::position::PositionTracker;
use crate::session::SessionStats;

/// Where NMEA lines come from. `Device` reopens with a cooldown when the port
/// drops; `Stream` is a single already-open line source (tests, replays).
pub enum GpsInput {
    Device(PathBuf),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

pub async fn run(
    input: GpsInput,
    config: Arc<PipelineConfig>,
    tracker: Arc<PositionTracker>,
    stats: Arc<SessionStats>,
    stop: Arc<AtomicBool>,
) {
    match input {
        GpsInput::Stream(reader) => {
            read_lines(BufReader::new(reader), &config, &tracker, &stats, &stop).await;
        }
        GpsInput::Device(path) => {
            let cooldown = Duration::from_secs_f64(config.gps_reopen_cooldown_secs.max(0.1));
            while !stop.load(Ordering::Acquire) {
                match tokio::fs::File::open(&path).await {
                    Ok(file) => {
                        info!("[gps] reading {}", path.display());
                        read_lines(BufReader::new(file), &config, &tracker, &stats, &stop).await;
                        warn!("[gps] {} closed, reopening", path.display());
                    }
                    Err(e) => {
                        warn!("[gps] cannot open {}: {e}", path.display());
                    }
                }
                if stop.load(Ordering::Acquire) {
                    break;
                }
                sleep(cooldown).await;
            }
        }
    }
    info!("[gps] reader stopped");
}

/// Read lines until EOF, error, or stop. Each wait is bounded so the stop
/// flag is observed within one read-timeout interval.
async fn read_lines<R: AsyncBufRead + Unpin>(
    reader: R,
    config: &PipelineConfig,
    tracker: &PositionTracker,
    stats: &SessionStats,
    stop: &AtomicBool,
) {
    let read_timeout = Duration::from_millis(config.gps_read_timeout_ms.max(50));
    let mut lines = reader.lines();
    let mut parsed_count = 0u64;

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        // Lines::next_line is cancellation-safe; a timed-out wait loses
        // nothing and just rechecks the stop flag.
        match timeout(read_timeout, lines.next_line()).await {
            Err(_) => continue,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!("[gps] read error: {e}");
                return;
            }
            Ok(Ok(Some(line))) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_sentence(line) {
                    Ok(sentence) => {
                        stats.inc_sentences_parsed();
                        parsed_count += 1;
                        if parsed_count % 100 == 0 {
                            debug!("[gps] {parsed_count} sentences parsed");
                        }
                        if let Sentence::Unrecognized { sentence_type } = &sentence {
                            debug!("[gps] ignoring {sentence_type} sentence");
                        } else {
                            tracker.update(&sentence);
                        }
                    }
                    Err(e) => {
                        stats.inc_sentences_rejected();
                        debug!("[gps] rejected sentence: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration as StdDuration;

    fn checksummed(payload: &str) -> String {
        let sum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${payload}*{sum:02X}\r\n")
    }

    fn fixture() -> (Arc<PipelineConfig>, Arc<PositionTracker>, Arc<SessionStats>, Arc<AtomicBool>) {
        (
            Arc::new(PipelineConfig::default()),
            Arc::new(PositionTracker::new(StdDuration::from_secs(5))),
            Arc::new(SessionStats::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_stream_updates_tracker_and_counts() {
        let (config, tracker, stats, stop) = fixture();
        let mut input = String::new();
        input.push_str(&checksummed("GPRMC,100000,A,4916.45,N,12311.12,W,0.5,054.7,191124,,"));
        input.push_str(&checksummed("GPGGA,100001,4916.450,N,12311.120,W,1,07,1.0,2.0,M,,M,,"));
        input.push_str(&checksummed("GPVTG,054.7,T,034.4,M,005.5,N,010.2,K"));
        input.push_str("$GPGGA,garbage*FF\r\n");

        run(
            GpsInput::Stream(Box::new(Cursor::new(input.into_bytes()))),
            config,
            tracker.clone(),
            stats.clone(),
            stop,
        )
        .await;

        let counts = stats.snapshot();
        assert_eq!(counts.sentences_parsed, 3);
        assert_eq!(counts.sentences_rejected, 1);

        let snap = tracker.snapshot();
        assert!(snap.valid);
        assert!((snap.fix.latitude.unwrap() - 49.2742).abs() < 1e-3);
        assert!(snap.fix.utc.is_some());
    }

    #[tokio::test]
    async fn test_rejected_lines_leave_tracker_untouched() {
        let (config, tracker, stats, stop) = fixture();
        let input = "$GPGGA,120000,5555.555,N,01131.000,E,1,08,0.9,545.4,M,,M,,*00\r\n";

        run(
            GpsInput::Stream(Box::new(Cursor::new(input.as_bytes().to_vec()))),
            config,
            tracker.clone(),
            stats.clone(),
            stop,
        )
        .await;

        assert_eq!(stats.snapshot().sentences_rejected, 1);
        assert!(!tracker.snapshot().fix.has_position());
    }

    #[tokio::test]
    async fn test_stop_flag_ends_reader_promptly() {
        let (config, tracker, stats, stop) = fixture();
        // A duplex that never produces data: the reader must still exit.
        let (_tx, rx) = tokio::io::duplex(64);
        stop.store(true, Ordering::Release);

        let done = tokio::time::timeout(
            StdDuration::from_secs(2),
            run(GpsInput::Stream(Box::new(rx)), config, tracker, stats, stop),
        )
        .await;
        assert!(done.is_ok(), "reader must observe the stop flag within the read timeout");
    }
}
