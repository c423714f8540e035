use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::Parser;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::json;

use indoor_tracker_rs::map::WalkableArea;
use indoor_tracker_rs::provider::{LocalizationConfig, LocalizationProvider};
use indoor_tracker_rs::types::{AccelData, AnchorPose, BearingFix, OrientationData, RangeFix};

#[derive(Parser, Debug)]
struct Args {
    /// Path to session_*.json[.gz] log
    #[arg(long)]
    log: PathBuf,

    /// Localization config JSON (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Walkable-area map JSON (permissive when omitted)
    #[arg(long)]
    map: Option<PathBuf>,

    /// RNG seed so repeated replays agree
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Anchor the filter at x,y before replay (e.g. "12.5,3.0")
    #[arg(long)]
    start: Option<String>,
}

#[derive(Deserialize)]
struct Reading {
    timestamp: f64,
    #[serde(default)]
    accel: Option<AccelData>,
    #[serde(default)]
    orientation: Option<OrientationData>,
    #[serde(default)]
    range_fix: Option<RangeFix>,
    #[serde(default)]
    bearing_fix: Option<BearingFix>,
}

#[derive(Deserialize)]
struct LogFile {
    readings: Vec<Reading>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let log = load_log(&args.log)?;

    let mut config = match &args.config {
        Some(path) => LocalizationConfig::load(path)?,
        None => LocalizationConfig::default(),
    };
    config.rng_seed = Some(args.seed);
    let emission_period = 1.0 / config.emission_hz;

    let map = match &args.map {
        Some(path) => WalkableArea::load(path)?,
        None => WalkableArea::permissive(),
    };

    let mut provider = LocalizationProvider::new(config, map)?;
    provider.start();

    if let Some(start) = &args.start {
        let (x, y) = start
            .split_once(',')
            .ok_or_else(|| anyhow::anyhow!("--start expects x,y"))?;
        provider.anchor(&AnchorPose {
            x: x.trim().parse()?,
            y: y.trim().parse()?,
            heading_deg: None,
        })?;
    }

    let mut updates = Vec::new();
    let mut next_emit: Option<f64> = None;

    for r in &log.readings {
        if let Some(accel) = r.accel.as_ref() {
            provider.handle_accel(accel);
        }
        if let Some(sample) = r.orientation.as_ref() {
            provider.handle_orientation(sample);
        }
        if let Some(fix) = r.range_fix.as_ref() {
            provider.ingest_range(fix)?;
        }
        if let Some(fix) = r.bearing_fix.as_ref() {
            provider.ingest_bearing(fix)?;
        }

        // Emission clocked off the recorded timestamps
        let due = *next_emit.get_or_insert(r.timestamp + emission_period);
        if r.timestamp >= due {
            if let Some(update) = provider.tick(r.timestamp) {
                updates.push(update);
            }
            next_emit = Some(due + emission_period);
        }
    }

    let snapshot = provider.snapshot();
    let summary = json!({
        "log": args.log.display().to_string(),
        "readings": log.readings.len(),
        "updates_emitted": updates.len(),
        "steps_detected": snapshot.steps_total,
        "range_fixes": snapshot.range_fixes,
        "bearing_fixes": snapshot.bearing_fixes,
        "resamples": snapshot.resamples,
        "weight_collapses": snapshot.weight_collapses,
        "clamped_emissions": snapshot.clamped_emissions,
        "final_pose": snapshot.last_update.map(|u| json!({
            "x": u.x,
            "y": u.y,
            "heading_deg": u.heading_rad.to_degrees(),
            "accuracy_m": u.accuracy_m,
            "confidence": u.confidence.as_ordinal(),
        })),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
