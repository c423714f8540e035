// sensors.rs — async sample sources feeding bounded channels
//
// Each loop runs as its own task and only ever sends into its channel;
// the provider owner drains them, so filter mutation never leaves one
// logical execution context. With no hardware backend attached the
// loops synthesize a plausible walking signal so the full pipeline can
// run anywhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

use crate::types::{AccelData, OrientationData};

/// Accelerometer loop, ~50 Hz.
pub async fn accel_loop(tx: Sender<AccelData>) {
    let mut interval = interval(Duration::from_millis(20));
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let accel = mock_accel_data();

        match tx.try_send(accel) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 500 == 0 {
                    log::debug!("[accel] {} samples", sample_count);
                }
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                log::info!("[accel] channel closed after {} samples", sample_count);
                break;
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                // Consumer is behind; drop this sample
            }
        }
    }
}

/// Orientation loop, ~50 Hz gyro cadence with sparse compass samples.
pub async fn orientation_loop(tx: Sender<OrientationData>) {
    let mut interval = interval(Duration::from_millis(20));
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let sample = mock_orientation_data();

        match tx.try_send(sample) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 500 == 0 {
                    log::debug!("[orientation] {} samples", sample_count);
                }
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                log::info!("[orientation] channel closed after {} samples", sample_count);
                break;
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                // Consumer is behind; drop this sample
            }
        }
    }
}

/// Synthetic walking signal: ~1.8 Hz stride oscillation on top of
/// gravity with a light lateral wobble.
fn mock_accel_data() -> AccelData {
    use std::f64::consts::PI;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let t = COUNTER.fetch_add(1, Ordering::Relaxed) as f64 * 0.02;

    AccelData {
        timestamp: current_timestamp(),
        x: (t * 1.8 * PI).sin() * 0.4,
        y: (t * 0.9 * PI).cos() * 0.3,
        z: 9.81 + (t * 2.0 * PI * 1.8).sin() * 1.5,
    }
}

/// Slow wandering turn; a compass sample roughly every second.
fn mock_orientation_data() -> OrientationData {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let t = n as f64 * 0.02;

    let heading_deg = if n % 50 == 0 {
        Some((t * 0.05).sin() * 30.0)
    } else {
        None
    };

    OrientationData {
        timestamp: current_timestamp(),
        heading_deg,
        rate_z: (t * 0.1).sin() * 0.05,
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
