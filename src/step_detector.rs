// step_detector.rs — accelerometer magnitude to discrete step events
//
// A slow low-pass tracks the gravity/DC baseline of |accel|; the
// detrended residual drives a two-state peak/valley envelope machine.
// The detection bar adapts downward during weak-motion periods (running
// RMS below a reference) so slow shuffling still produces steps. Stride
// length comes from the Weinberg model: k * (peak - valley)^0.25.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::types::AccelData;

/// Configuration for step detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDetectorConfig {
    /// Envelope bar before adaptation (m/s²).
    pub base_threshold: f64,
    /// Refractory period between steps in seconds. 0.22 s caps the
    /// detectable cadence at ~4.5 Hz.
    pub min_step_interval_s: f64,
    /// Rise above the tracked valley that ends the valley phase (m/s²).
    pub hysteresis: f64,
    /// Weinberg stride coefficient (meters), calibrated per user.
    pub weinberg_k: f64,
    /// Slow low-pass coefficient for the gravity/DC baseline (0-1).
    pub baseline_alpha: f64,
    /// Smoothing coefficient for the detrended residual (0-1).
    pub residual_alpha: f64,
    /// EWMA coefficient for the running RMS of the residual (0-1).
    pub rms_alpha: f64,
    /// RMS at or above which no threshold adaptation happens.
    pub adapt_reference_rms: f64,
    /// Threshold reduction per unit of RMS deficit below the reference.
    pub adapt_gain: f64,
}

impl Default for StepDetectorConfig {
    fn default() -> Self {
        Self {
            base_threshold: 0.8,
            min_step_interval_s: 0.22,
            hysteresis: 0.06,
            weinberg_k: 0.37,
            baseline_alpha: 0.02,
            residual_alpha: 0.6,
            rms_alpha: 0.05,
            adapt_reference_rms: 0.5,
            adapt_gain: 0.8,
        }
    }
}

/// One detected step, before heading is attached.
#[derive(Clone, Copy, Debug)]
pub struct DetectedStep {
    pub timestamp: f64,
    /// Weinberg stride length in meters.
    pub length_m: f64,
    /// Envelope amplitude the stride was computed from (m/s²).
    pub peak_to_valley: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    LookingForPeak,
    LookingForValley,
}

pub struct StepDetector {
    config: StepDetectorConfig,

    baseline: Option<f64>,
    residual: f64,
    rms_sq: f64,

    phase: Phase,
    peak: f64,
    valley: f64,

    last_sample_ts: Option<f64>,
    last_step_ts: Option<f64>,
    total_steps: u64,
}

impl StepDetector {
    pub fn new(config: StepDetectorConfig) -> Self {
        Self {
            config,
            baseline: None,
            residual: 0.0,
            rms_sq: 0.0,
            phase: Phase::LookingForPeak,
            peak: 0.0,
            valley: 0.0,
            last_sample_ts: None,
            last_step_ts: None,
            total_steps: 0,
        }
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Detection bar after weak-motion adaptation, clamped ≥ 0.
    pub fn effective_threshold(&self) -> f64 {
        let rms = self.rms_sq.sqrt();
        let deficit = (self.config.adapt_reference_rms - rms).max(0.0);
        (self.config.base_threshold - self.config.adapt_gain * deficit).max(0.0)
    }

    /// Process one accelerometer sample. Returns a step event when the
    /// envelope machine fires.
    pub fn process(&mut self, sample: &AccelData) -> Option<DetectedStep> {
        // Out-of-order or duplicate timestamps are dropped
        if let Some(prev) = self.last_sample_ts {
            if sample.timestamp <= prev {
                return None;
            }
        }
        self.last_sample_ts = Some(sample.timestamp);

        let mag = Vector3::new(sample.x, sample.y, sample.z).norm();

        let baseline = match self.baseline {
            Some(b) => {
                let b = b + self.config.baseline_alpha * (mag - b);
                self.baseline = Some(b);
                b
            }
            None => {
                // First sample: lock the baseline, start the envelope
                // at rest.
                self.baseline = Some(mag);
                self.peak = 0.0;
                self.valley = 0.0;
                return None;
            }
        };

        let detrended = mag - baseline;
        self.residual += self.config.residual_alpha * (detrended - self.residual);
        let s = self.residual;

        self.rms_sq += self.config.rms_alpha * (s * s - self.rms_sq);

        match self.phase {
            Phase::LookingForPeak => {
                if s > self.peak {
                    self.peak = s;
                }
                // The crest counts once the signal has fallen back below
                // it by the hysteresis margin; firing on the raw
                // threshold crossing would re-trigger on the same swing.
                let crest_confirmed = s < self.peak - self.config.hysteresis;
                let amplitude = self.peak - self.valley;
                let refractory_ok = self
                    .last_step_ts
                    .map(|t| sample.timestamp - t >= self.config.min_step_interval_s)
                    .unwrap_or(true);
                if crest_confirmed && amplitude > self.effective_threshold() && refractory_ok {
                    let length_m = self.config.weinberg_k * amplitude.powf(0.25);
                    self.total_steps += 1;
                    self.last_step_ts = Some(sample.timestamp);
                    self.phase = Phase::LookingForValley;
                    self.peak = s;
                    self.valley = s;
                    log::debug!(
                        "step #{} amp={:.3} len={:.3}m",
                        self.total_steps,
                        amplitude,
                        length_m
                    );
                    return Some(DetectedStep {
                        timestamp: sample.timestamp,
                        length_m,
                        peak_to_valley: amplitude,
                    });
                }
            }
            Phase::LookingForValley => {
                if s < self.valley {
                    self.valley = s;
                }
                if s > self.valley + self.config.hysteresis {
                    self.phase = Phase::LookingForPeak;
                    self.peak = s;
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    /// Feed a gravity-biased sinusoidal magnitude at 50 Hz for
    /// `secs` seconds; returns detected steps.
    fn run_sine(detector: &mut StepDetector, freq_hz: f64, amp_pk_pk: f64, secs: f64) -> Vec<DetectedStep> {
        let rate = 50.0;
        let mut steps = Vec::new();
        let n = (secs * rate) as usize;
        for i in 0..n {
            let t = i as f64 / rate;
            let mag = 9.81 + 0.5 * amp_pk_pk * (2.0 * PI * freq_hz * t).sin();
            // Signal along z only: magnitude equals the synthetic value
            let sample = AccelData { timestamp: t, x: 0.0, y: 0.0, z: mag };
            if let Some(step) = detector.process(&sample) {
                steps.push(step);
            }
        }
        steps
    }

    #[test]
    fn test_two_hz_walk_yields_twenty_steps() {
        let mut det = StepDetector::new(StepDetectorConfig::default());
        let steps = run_sine(&mut det, 2.0, 3.0, 10.0);
        assert!(
            (18..=21).contains(&steps.len()),
            "expected ~20 steps at 2 Hz over 10 s, got {}",
            steps.len()
        );
    }

    #[test]
    fn test_weinberg_length_matches_amplitude() {
        let mut det = StepDetector::new(StepDetectorConfig::default());
        let steps = run_sine(&mut det, 2.0, 3.0, 10.0);
        let k = StepDetectorConfig::default().weinberg_k;
        for step in &steps {
            assert_relative_eq!(
                step.length_m,
                k * step.peak_to_valley.powf(0.25),
                epsilon = 1e-12
            );
        }
        // Steady-state envelope tracks the signal's peak-to-valley
        // amplitude (3.0) minus filter attenuation.
        for step in steps.iter().skip(3) {
            assert!(
                (2.2..=3.2).contains(&step.peak_to_valley),
                "steady amplitude {} strayed from the driving signal",
                step.peak_to_valley
            );
        }
    }

    #[test]
    fn test_refractory_caps_cadence() {
        let mut det = StepDetector::new(StepDetectorConfig::default());
        // 8 Hz shaking would double-count without the refractory period
        let steps = run_sine(&mut det, 8.0, 4.0, 10.0);
        let cap = (10.0 / StepDetectorConfig::default().min_step_interval_s).ceil() as usize;
        assert!(
            steps.len() <= cap,
            "cadence cap violated: {} steps > {}",
            steps.len(),
            cap
        );
    }

    #[test]
    fn test_quiet_signal_yields_no_steps() {
        let mut det = StepDetector::new(StepDetectorConfig::default());
        let mut got_step = false;
        for i in 0..500 {
            let t = i as f64 / 50.0;
            let sample = AccelData { timestamp: t, x: 0.0, y: 0.0, z: 9.81 };
            got_step |= det.process(&sample).is_some();
        }
        assert!(!got_step);
        assert_eq!(det.total_steps(), 0);
    }

    #[test]
    fn test_adaptive_threshold_catches_weak_walking() {
        // Amplitude below the base bar: only the adapted detector sees
        // the steps.
        let weak_amp = 0.9;
        let rigid = StepDetectorConfig {
            base_threshold: 1.2,
            adapt_gain: 0.0,
            ..Default::default()
        };
        let adaptive = StepDetectorConfig {
            base_threshold: 1.2,
            adapt_gain: 3.0,
            adapt_reference_rms: 0.5,
            ..Default::default()
        };

        let mut det_rigid = StepDetector::new(rigid);
        let rigid_steps = run_sine(&mut det_rigid, 2.0, weak_amp, 10.0);

        let mut det_adaptive = StepDetector::new(adaptive);
        let adaptive_steps = run_sine(&mut det_adaptive, 2.0, weak_amp, 10.0);

        assert!(rigid_steps.is_empty(), "rigid bar should miss weak steps");
        assert!(
            adaptive_steps.len() >= 10,
            "adapted bar should catch weak steps, got {}",
            adaptive_steps.len()
        );
    }

    #[test]
    fn test_effective_threshold_never_negative() {
        let config = StepDetectorConfig {
            base_threshold: 0.1,
            adapt_gain: 10.0,
            adapt_reference_rms: 5.0,
            ..Default::default()
        };
        let det = StepDetector::new(config);
        assert!(det.effective_threshold() >= 0.0);
    }

    #[test]
    fn test_out_of_order_samples_dropped() {
        let mut det = StepDetector::new(StepDetectorConfig::default());
        let s1 = AccelData { timestamp: 1.0, x: 0.0, y: 0.0, z: 9.81 };
        let s2 = AccelData { timestamp: 0.5, x: 0.0, y: 0.0, z: 15.0 };
        det.process(&s1);
        assert!(det.process(&s2).is_none());
    }
}
