// orientation.rs — running heading estimate
//
// Gyro integration is the default source: indoor compass readings are
// routinely bent by structural steel and wiring, so an absolute heading
// sample only nudges the estimate through a bounded correction instead
// of snapping it.

use serde::{Deserialize, Serialize};

use crate::types::angles::{angle_diff, wrap_angle};
use crate::types::OrientationData;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    /// Fixed rotation between the compass frame and map "north" (rad).
    pub map_alignment_offset_rad: f64,
    /// Device screen-orientation offset subtracted from compass
    /// samples (rad).
    pub screen_orientation_offset_rad: f64,
    /// Fraction of the compass error applied per sample.
    pub compass_gain: f64,
    /// Per-sample cap on the compass correction (rad). Keeps a single
    /// bad reading from yanking the heading.
    pub max_compass_correction_rad: f64,
    /// Samples with dt outside (0, this] are dropped.
    pub max_sample_gap_s: f64,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            map_alignment_offset_rad: 0.0,
            screen_orientation_offset_rad: 0.0,
            compass_gain: 0.05,
            max_compass_correction_rad: 0.15,
            max_sample_gap_s: 1.0,
        }
    }
}

pub struct OrientationTracker {
    config: OrientationConfig,
    heading: f64,
    last_sample_ts: Option<f64>,
    last_compass: Option<f64>,
}

impl OrientationTracker {
    pub fn new(config: OrientationConfig, initial_heading: f64) -> Self {
        Self {
            config,
            heading: wrap_angle(initial_heading),
            last_sample_ts: None,
            last_compass: None,
        }
    }

    /// Current heading in radians, (−π, π].
    pub fn heading(&self) -> f64 {
        self.heading
    }

    /// Most recent compass heading after frame offsets, if any arrived.
    pub fn last_compass(&self) -> Option<f64> {
        self.last_compass
    }

    /// Force the heading, e.g. on an authoritative anchor.
    pub fn set_heading(&mut self, heading: f64) {
        self.heading = wrap_angle(heading);
    }

    /// Integrate one orientation sample; returns the updated heading.
    pub fn process(&mut self, sample: &OrientationData) -> f64 {
        if let Some(prev) = self.last_sample_ts {
            let dt = sample.timestamp - prev;
            if dt > 0.0 && dt <= self.config.max_sample_gap_s {
                self.heading = wrap_angle(self.heading + sample.rate_z * dt);
            } else if dt <= 0.0 {
                // Out-of-order sample: ignore entirely
                return self.heading;
            }
        }
        self.last_sample_ts = Some(sample.timestamp);

        if let Some(deg) = sample.heading_deg {
            let compass = wrap_angle(
                deg.to_radians() - self.config.screen_orientation_offset_rad
                    + self.config.map_alignment_offset_rad,
            );
            self.last_compass = Some(compass);

            let error = angle_diff(compass, self.heading);
            let cap = self.config.max_compass_correction_rad;
            let correction = (error * self.config.compass_gain).clamp(-cap, cap);
            self.heading = wrap_angle(self.heading + correction);
            if error.abs() > 1.0 {
                log::debug!(
                    "compass disagrees by {:.1}°, correcting {:.2}°",
                    error.to_degrees(),
                    correction.to_degrees()
                );
            }
        }

        self.heading
    }
}
