use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use seabed_capture_rs::camera::{CommandCamera, FrameSource, SimulatedCamera};
use seabed_capture_rs::config::PipelineConfig;
use seabed_capture_rs::gps_reader::GpsInput;
use seabed_capture_rs::session::{Pipeline, END_DURATION, END_SIGNAL};
use seabed_capture_rs::storage::StorageTarget;

#[derive(Parser, Debug)]
#[command(name = "seabed_capture")]
#[command(about = "GPS-correlated seabed survey image capture", long_about = None)]
struct Args {
    /// Duration in seconds (0 = run until interrupted)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Serial device carrying NMEA sentences
    #[arg(long, default_value = "/dev/ttyUSB0")]
    gps_device: PathBuf,

    /// Camera device handed to the capture command
    #[arg(long, default_value = "/dev/video0")]
    camera_device: PathBuf,

    /// Target capture rate
    #[arg(long, default_value = "2.0")]
    fps: f64,

    /// Frame width
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Frame height
    #[arg(long, default_value = "720")]
    height: u32,

    /// Use the built-in simulated camera instead of a real device
    #[arg(long)]
    simulate: bool,

    /// Preferred storage directory (removable medium mount point)
    #[arg(long, default_value = "/media/survey")]
    storage_dir: PathBuf,

    /// Fallback storage directory when the preferred one is unavailable
    #[arg(long, default_value = "survey_sessions")]
    fallback_dir: PathBuf,

    /// Disable GPS-driven system clock correction
    #[arg(long)]
    no_clock_sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("[{}] Seabed Capture starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  GPS Device: {}", args.gps_device.display());
    println!("  Camera: {}", if args.simulate {
        "simulated".to_string()
    } else {
        args.camera_device.display().to_string()
    });
    println!("  Target FPS: {}", args.fps);
    println!("  Storage: {} (fallback {})", args.storage_dir.display(), args.fallback_dir.display());

    let config = PipelineConfig {
        gps_device: args.gps_device.clone(),
        camera_device: args.camera_device.clone(),
        frame_width: args.width,
        frame_height: args.height,
        target_fps: args.fps,
        duration_secs: args.duration,
        preferred_dir: args.storage_dir.clone(),
        fallback_dir: args.fallback_dir.clone(),
        enable_clock_sync: !args.no_clock_sync,
        image_ext: if args.simulate { "ppm".to_string() } else { "jpg".to_string() },
        ..PipelineConfig::default()
    };

    let source: Box<dyn FrameSource> = if args.simulate {
        Box::new(SimulatedCamera::new(config.frame_width, config.frame_height))
    } else {
        Box::new(CommandCamera::from_config(&config))
    };

    // Session directory under the selected storage target.
    let base = StorageTarget::select(&config.preferred_dir, &config.fallback_dir, config.min_free_mb)?;
    let pipeline = Arc::new(Pipeline::new(config.clone()));
    let session_dir = base.root().join(pipeline.session_id());
    let storage = StorageTarget::at(session_dir.clone(), config.min_free_mb)?;

    // Ctrl-C begins the orderly shutdown; production stops first, the queue
    // drains, the GPS reader goes last.
    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n[{}] Shutdown signal received, stopping...", ts_now());
                pipeline.request_shutdown();
            }
        });
    }

    let summary = pipeline
        .run(source, GpsInput::Device(config.gps_device.clone()), storage)
        .await?;

    println!("\n=== Session Summary ===");
    println!("Session: {} ({})", summary.session_id, summary.terminated_by);
    println!("Output: {}", session_dir.display());
    println!(
        "Captured: {}  Written: {}  Dropped: {}  Unpositioned: {}",
        summary.counts.frames_captured,
        summary.counts.frames_written,
        summary.counts.frames_dropped + summary.counts.writes_dropped,
        summary.counts.frames_unpositioned
    );
    println!(
        "Sentences: {} parsed, {} rejected  Clock corrections: {}",
        summary.counts.sentences_parsed,
        summary.counts.sentences_rejected,
        summary.counts.clock_corrections
    );
    println!(
        "Rate: {:.2} fps achieved vs {:.2} fps target over {:.1}s",
        summary.achieved_fps, summary.target_fps, summary.duration_seconds
    );

    if summary.terminated_by != END_DURATION && summary.terminated_by != END_SIGNAL {
        anyhow::bail!("session terminated early: {}", summary.terminated_by);
    }
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
