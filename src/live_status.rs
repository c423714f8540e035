use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize, Clone)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub running: bool,
    pub accel_samples: u64,
    pub orientation_samples: u64,
    pub steps_detected: u64,
    pub range_fixes: u64,
    pub bearing_fixes: u64,
    pub resamples: u64,
    pub weight_collapses: u64,
    pub clamped_emissions: u64,
    pub uptime_seconds: u64,
    // Last emitted pose
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
    pub accuracy_m: f64,
    pub confidence: u8,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            running: false,
            accel_samples: 0,
            orientation_samples: 0,
            steps_detected: 0,
            range_fixes: 0,
            bearing_fixes: 0,
            resamples: 0,
            weight_collapses: 0,
            clamped_emissions: 0,
            uptime_seconds: 0,
            x: 0.0,
            y: 0.0,
            heading_deg: 0.0,
            accuracy_m: 0.0,
            confidence: 3,
        }
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
