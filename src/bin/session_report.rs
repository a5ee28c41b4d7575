//! Offline survey QA: scan an output tree for completed sessions, re-count
//! the sidecars on disk against each session summary, and print a table.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

use seabed_capture_rs::geotag::Sidecar;
use seabed_capture_rs::session::{SessionSummary, SUMMARY_FILENAME};

#[derive(Parser, Debug)]
#[command(name = "session_report")]
#[command(about = "Aggregate seabed capture session output", long_about = None)]
struct Args {
    /// Directory holding session_* subdirectories
    #[arg(default_value = "survey_sessions")]
    output_dir: PathBuf,

    /// Print per-record detail for sessions with mismatched counts
    #[arg(long)]
    verbose: bool,
}

struct SessionReport {
    summary: SessionSummary,
    sidecars_on_disk: u64,
    positioned_on_disk: u64,
    missing_images: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut reports = Vec::new();
    for entry in fs::read_dir(&args.output_dir)? {
        let path = entry?.path();
        if path.is_dir() && path.join(SUMMARY_FILENAME).is_file() {
            match inspect_session(&path) {
                Ok(report) => reports.push((path, report)),
                Err(e) => eprintln!("skipping {}: {e}", path.display()),
            }
        }
    }
    reports.sort_by(|a, b| a.1.summary.started_at.cmp(&b.1.summary.started_at));

    if reports.is_empty() {
        println!("No sessions found under {}", args.output_dir.display());
        return Ok(());
    }

    println!(
        "{:<24} {:>9} {:>9} {:>9} {:>12} {:>10} {:>8}",
        "session", "captured", "written", "on-disk", "unpositioned", "dropped", "rate"
    );
    let mut mismatched = 0usize;
    for (path, report) in &reports {
        let counts = &report.summary.counts;
        let dropped = counts.frames_dropped + counts.writes_dropped;
        println!(
            "{:<24} {:>9} {:>9} {:>9} {:>12} {:>10} {:>7.2}",
            report.summary.session_id,
            counts.frames_captured,
            counts.frames_written,
            report.sidecars_on_disk,
            counts.frames_unpositioned,
            dropped,
            report.summary.achieved_fps,
        );

        let mut problems = Vec::new();
        if counts.frames_captured != counts.frames_written + dropped {
            problems.push(format!(
                "captured {} != written {} + dropped {}",
                counts.frames_captured, counts.frames_written, dropped
            ));
        }
        if report.sidecars_on_disk != counts.frames_written {
            problems.push(format!(
                "{} sidecars on disk vs {} written in summary",
                report.sidecars_on_disk, counts.frames_written
            ));
        }
        if report.missing_images > 0 {
            problems.push(format!("{} sidecars without an image file", report.missing_images));
        }
        if !problems.is_empty() {
            mismatched += 1;
            if args.verbose {
                for problem in &problems {
                    println!("    !! {problem}");
                }
            } else {
                println!("    !! inconsistent ({})", problems.join("; "));
            }
        }
    }

    let total_written: u64 = reports.iter().map(|(_, r)| r.summary.counts.frames_written).sum();
    let total_positioned: u64 = reports.iter().map(|(_, r)| r.positioned_on_disk).sum();
    println!(
        "\n{} sessions, {} records written, {} positioned, {} inconsistent",
        reports.len(),
        total_written,
        total_positioned,
        mismatched
    );
    Ok(())
}

fn inspect_session(dir: &Path) -> Result<SessionReport> {
    let summary: SessionSummary =
        serde_json::from_slice(&fs::read(dir.join(SUMMARY_FILENAME))?)?;

    let mut sidecars_on_disk = 0u64;
    let mut positioned_on_disk = 0u64;
    let mut missing_images = 0u64;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if !name.starts_with("img_") || path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let sidecar: Sidecar = serde_json::from_slice(&fs::read(&path)?)?;
        sidecars_on_disk += 1;
        if sidecar.positioned() {
            positioned_on_disk += 1;
        }
        if !dir.join(&sidecar.filename).is_file() {
            missing_images += 1;
        }
    }

    Ok(SessionReport {
        summary,
        sidecars_on_disk,
        positioned_on_disk,
        missing_images,
    })
}
