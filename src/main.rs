use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use indoor_tracker_rs::live_status::{self, LiveStatus};
use indoor_tracker_rs::map::WalkableArea;
use indoor_tracker_rs::provider::{LocalizationConfig, LocalizationProvider};
use indoor_tracker_rs::sensors;
use indoor_tracker_rs::types::{AccelData, OrientationData};

#[derive(Parser, Debug)]
#[command(name = "indoor_tracker")]
#[command(about = "Indoor pedestrian tracker - particle filter + PDR", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Localization config JSON (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Walkable-area map JSON (permissive when omitted)
    #[arg(long)]
    map: Option<PathBuf>,

    /// Fixed RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Output directory
    #[arg(long, default_value = "tracker_sessions")]
    output_dir: String,
}

#[derive(Serialize, Deserialize, Clone)]
struct SensorReading {
    timestamp: f64,
    accel: Option<AccelData>,
    orientation: Option<OrientationData>,
}

#[derive(Serialize)]
struct SessionOutput {
    readings: Vec<SensorReading>,
    stats: Stats,
}

#[derive(Serialize)]
struct Stats {
    total_samples: usize,
    steps_detected: u64,
    resamples: u64,
    weight_collapses: u64,
    clamped_emissions: u64,
    final_x: f64,
    final_y: f64,
    final_accuracy_m: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("[{}] Indoor Tracker starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;

    let mut config = match &args.config {
        Some(path) => LocalizationConfig::load(path)?,
        None => LocalizationConfig::default(),
    };
    if args.seed.is_some() {
        config.rng_seed = args.seed;
    }
    let emission_period = Duration::from_secs_f64(1.0 / config.emission_hz);

    let map = match &args.map {
        Some(path) => WalkableArea::load(path)?,
        None => {
            log::info!("no walkable map supplied, constraint is permissive");
            WalkableArea::permissive()
        }
    };

    let mut provider = LocalizationProvider::new(config, map)?;
    provider.on_status(|event| log::info!("status: {:?}", event));
    provider.on_position(|update| {
        log::debug!(
            "pose ({:.2}, {:.2}) ±{:.2}m conf={:?}",
            update.x,
            update.y,
            update.accuracy_m,
            update.confidence
        );
    });
    provider.start();

    // Sensor collection channels
    let (accel_tx, mut accel_rx) = mpsc::channel::<AccelData>(500);
    let (orient_tx, mut orient_rx) = mpsc::channel::<OrientationData>(500);

    let _accel_handle = tokio::spawn(sensors::accel_loop(accel_tx));
    let _orient_handle = tokio::spawn(sensors::orientation_loop(orient_tx));

    let mut readings: Vec<SensorReading> = Vec::new();
    let mut accel_count = 0u64;
    let mut orientation_count = 0u64;

    let start = Utc::now();
    let mut last_emit = tokio::time::Instant::now();
    let mut last_status_update = Utc::now();
    let mut last_save = Utc::now();

    println!("[{}] Tracking...", ts_now());

    loop {
        if args.duration > 0 {
            let elapsed = Utc::now().signed_duration_since(start);
            if elapsed.num_seconds() as u64 >= args.duration {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
        }

        while let Ok(accel) = accel_rx.try_recv() {
            readings.push(SensorReading {
                timestamp: accel.timestamp,
                accel: Some(accel.clone()),
                orientation: None,
            });
            provider.handle_accel(&accel);
            accel_count += 1;
        }

        while let Ok(sample) = orient_rx.try_recv() {
            readings.push(SensorReading {
                timestamp: sample.timestamp,
                accel: None,
                orientation: Some(sample.clone()),
            });
            provider.handle_orientation(&sample);
            orientation_count += 1;
        }

        // Emission at the configured cadence
        if last_emit.elapsed() >= emission_period {
            provider.tick(live_status::current_timestamp());
            last_emit = tokio::time::Instant::now();
        }

        // Live status every 2 seconds
        let now = Utc::now();
        if (now.signed_duration_since(last_status_update).num_seconds() as u64) >= 2 {
            let status = build_status(&provider, accel_count, orientation_count, &start);
            let status_path = format!("{}/live_status.json", args.output_dir);
            let _ = status.save(&status_path);
            last_status_update = now;
        }

        // Auto-save session every 15 seconds
        if (now.signed_duration_since(last_save).num_seconds() as u64) >= 15 {
            let filename = format!("{}/session_{}.json", args.output_dir, ts_now_clean());
            save_session(&filename, &readings, &provider)?;
            println!("[{}] Auto-saved {} readings to {}", ts_now(), readings.len(), filename);
            last_save = now;
        }

        sleep(Duration::from_millis(2)).await;
    }

    provider.stop();

    let filename = format!("{}/session_{}_final.json", args.output_dir, ts_now_clean());
    save_session(&filename, &readings, &provider)?;

    let status = build_status(&provider, accel_count, orientation_count, &start);
    let _ = status.save(&format!("{}/live_status_final.json", args.output_dir));

    let snapshot = provider.snapshot();
    println!("\n=== Final Stats ===");
    println!("Accel samples: {}", accel_count);
    println!("Orientation samples: {}", orientation_count);
    println!("Steps detected: {}", snapshot.steps_total);
    if let Some(update) = snapshot.last_update {
        println!(
            "Final pose: ({:.2}, {:.2}) heading {:.1}° ±{:.2}m",
            update.x,
            update.y,
            update.heading_rad.to_degrees(),
            update.accuracy_m
        );
    }

    Ok(())
}

fn build_status(
    provider: &LocalizationProvider,
    accel_count: u64,
    orientation_count: u64,
    start: &chrono::DateTime<Utc>,
) -> LiveStatus {
    let snapshot = provider.snapshot();
    let mut status = LiveStatus::new();
    status.running = snapshot.state == indoor_tracker_rs::ProviderState::Running;
    status.accel_samples = accel_count;
    status.orientation_samples = orientation_count;
    status.steps_detected = snapshot.steps_total;
    status.range_fixes = snapshot.range_fixes;
    status.bearing_fixes = snapshot.bearing_fixes;
    status.resamples = snapshot.resamples;
    status.weight_collapses = snapshot.weight_collapses;
    status.clamped_emissions = snapshot.clamped_emissions;
    status.uptime_seconds = Utc::now().signed_duration_since(*start).num_seconds().max(0) as u64;
    if let Some(update) = snapshot.last_update {
        status.x = update.x;
        status.y = update.y;
        status.heading_deg = update.heading_rad.to_degrees();
        status.accuracy_m = update.accuracy_m;
        status.confidence = update.confidence.as_ordinal();
    }
    status
}

fn save_session(
    path: &str,
    readings: &[SensorReading],
    provider: &LocalizationProvider,
) -> Result<()> {
    let snapshot = provider.snapshot();
    let (final_x, final_y, final_accuracy_m) = snapshot
        .last_update
        .map(|u| (u.x, u.y, u.accuracy_m))
        .unwrap_or((0.0, 0.0, 0.0));
    let output = SessionOutput {
        readings: readings.to_vec(),
        stats: Stats {
            total_samples: readings.len(),
            steps_detected: snapshot.steps_total,
            resamples: snapshot.resamples,
            weight_collapses: snapshot.weight_collapses,
            clamped_emissions: snapshot.clamped_emissions,
            final_x,
            final_y,
            final_accuracy_m,
        },
    };
    let json = serde_json::to_string_pretty(&output)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
