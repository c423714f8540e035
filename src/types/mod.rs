pub mod angles;

use serde::{Deserialize, Serialize};

/// Raw accelerometer sample in device axes (m/s²).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelData {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Orientation sample: optional absolute compass heading plus yaw rate.
///
/// `heading_deg` is `None` when the platform delivers gyro-only samples
/// (common indoors, where the magnetic field is unusable).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrientationData {
    pub timestamp: f64,
    pub heading_deg: Option<f64>,
    /// Angular rate around the vertical axis (rad/s, positive CCW).
    pub rate_z: f64,
}

/// Range measurement to a known anchor point (map units).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RangeFix {
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub range: f64,
    pub sigma: f64,
}

/// Bearing measurement from a known anchor point (radians, map frame).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BearingFix {
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub bearing_rad: f64,
    pub sigma: f64,
}

/// Authoritative pose reset, e.g. from a scanned tag or known waypoint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AnchorPose {
    pub x: f64,
    pub y: f64,
    pub heading_deg: Option<f64>,
}
