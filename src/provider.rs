// provider.rs — Orchestration layer for indoor localization
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - any concrete sensor backend
//   - file I/O and status reporting
//
// It takes sensor samples and absolute fixes in, produces position
// updates and events out. Sensor loops feed it through channels; one
// owner drives it, so all filter mutation stays on a single logical
// execution context.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::filters::particle::{FilterError, ParticleFilter};
use crate::map::WalkableArea;
use crate::orientation::{OrientationConfig, OrientationTracker};
use crate::step_detector::{StepDetector, StepDetectorConfig};
use crate::types::angles::wrap_angle;
use crate::types::{AccelData, AnchorPose, BearingFix, OrientationData, RangeFix};

// ─── Configuration ───────────────────────────────────────────────────────────

/// What to emit when the estimated mean leaves the walkable area. The
/// particle set itself is never rolled back; only the published value
/// changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampPolicy {
    /// Replace the emitted pose with the last in-bounds pose and
    /// inflate the reported covariance.
    StickyLastValid,
    /// Publish the raw estimate unchanged.
    Passthrough,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    // ── Particle filter ──
    pub particle_count: usize,
    pub initial_x: f64,
    pub initial_y: f64,
    pub initial_heading_rad: f64,
    /// Position spread of the initial cloud (map units).
    pub initial_spread_xy: f64,
    pub initial_spread_heading: f64,
    /// Tight spread used when re-initializing around an anchor pose.
    pub anchor_spread_xy: f64,
    pub anchor_spread_heading: f64,
    /// Per-step length jitter (meters).
    pub noise_step_m: f64,
    /// Per-step shared heading jitter (radians).
    pub noise_heading_rad: f64,
    pub resample_threshold: f64,
    pub constraint_penalty: f64,
    /// Fixed RNG seed for reproducible replays.
    pub rng_seed: Option<u64>,

    // ── Units & emission ──
    /// Map units per meter of real-world distance.
    pub units_per_meter: f64,
    pub emission_hz: f64,
    pub clamp_policy: ClampPolicy,
    /// Multiplicative covariance penalty applied to a clamped emission.
    pub covariance_inflation: f64,

    // ── Confidence bucketing (meters of position sigma) ──
    pub confidence_high_m: f64,
    pub confidence_medium_m: f64,
    pub confidence_low_m: f64,

    // ── Components ──
    pub step_detector: StepDetectorConfig,
    pub orientation: OrientationConfig,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            particle_count: 800,
            initial_x: 0.0,
            initial_y: 0.0,
            initial_heading_rad: 0.0,
            initial_spread_xy: 5.0,
            initial_spread_heading: 0.5,
            anchor_spread_xy: 0.5,
            anchor_spread_heading: 0.1,
            noise_step_m: 0.15,
            noise_heading_rad: 0.08,
            resample_threshold: 0.6,
            constraint_penalty: 0.01,
            rng_seed: None,
            units_per_meter: 1.0,
            emission_hz: 15.0,
            clamp_policy: ClampPolicy::StickyLastValid,
            covariance_inflation: 4.0,
            confidence_high_m: 1.0,
            confidence_medium_m: 2.5,
            confidence_low_m: 5.0,
            step_detector: StepDetectorConfig::default(),
            orientation: OrientationConfig::default(),
        }
    }
}

impl LocalizationConfig {
    /// Load overrides from a JSON file; absent fields keep defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let file = File::open(path.as_ref()).map_err(ProviderError::ConfigIo)?;
        let config = serde_json::from_reader(BufReader::new(file))
            .map_err(ProviderError::ConfigParse)?;
        Ok(config)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("cannot read configuration file: {0}")]
    ConfigIo(std::io::Error),

    #[error("malformed configuration file: {0}")]
    ConfigParse(serde_json::Error),
}

// ─── Events & outputs ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Started,
    Stopped,
    StepDetected { length_m: f64, heading_rad: f64 },
    RangeFixApplied { range: f64 },
    BearingFixApplied { bearing_rad: f64 },
    Anchored { x: f64, y: f64 },
}

/// Lifecycle / permission notifications for the single status
/// subscriber.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum StatusEvent {
    Started,
    Stopped,
    Permission { detail: String },
}

/// Ordinal confidence derived from position sigma; 0 is best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Unreliable,
}

impl Confidence {
    pub fn as_ordinal(self) -> u8 {
        match self {
            Confidence::High => 0,
            Confidence::Medium => 1,
            Confidence::Low => 2,
            Confidence::Unreliable => 3,
        }
    }
}

/// One published pose. `x`, `y`, `heading_rad` are in map units /
/// radians; `accuracy_m` is back in meters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PositionUpdate {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub heading_rad: f64,
    pub accuracy_m: f64,
    pub confidence: Confidence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ProviderState {
    Idle,
    Running,
}

/// Cheap diagnostic snapshot for status reporting.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSnapshot {
    pub state: ProviderState,
    pub steps_total: u64,
    pub range_fixes: u64,
    pub bearing_fixes: u64,
    pub resamples: u64,
    pub weight_collapses: u64,
    pub clamped_emissions: u64,
    pub heading_rad: f64,
    pub last_update: Option<PositionUpdate>,
}

// ─── The provider ────────────────────────────────────────────────────────────

type PositionCallback = Box<dyn Fn(&PositionUpdate) + Send>;
type StatusCallback = Box<dyn Fn(&StatusEvent) + Send>;

/// Handle returned by `on_position`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

pub struct LocalizationProvider {
    config: LocalizationConfig,
    map: WalkableArea,

    filter: ParticleFilter,
    step_detector: StepDetector,
    orientation: OrientationTracker,

    state: ProviderState,
    /// Sticky anchor for output clamping: the last emitted mean that
    /// passed the walkable test, as (x, y, heading).
    last_valid_pose: Option<(f64, f64, f64)>,

    position_subs: Vec<(u64, PositionCallback)>,
    next_sub_id: u64,
    status_sub: Option<StatusCallback>,

    steps_total: u64,
    range_fixes: u64,
    bearing_fixes: u64,
    clamped_emissions: u64,
    last_update: Option<PositionUpdate>,
}

impl LocalizationProvider {
    pub fn new(config: LocalizationConfig, map: WalkableArea) -> Result<Self, ProviderError> {
        if !(config.units_per_meter > 0.0) || !config.units_per_meter.is_finite() {
            return Err(ProviderError::InvalidConfig("units_per_meter must be positive"));
        }
        if !(config.emission_hz > 0.0) || !config.emission_hz.is_finite() {
            return Err(ProviderError::InvalidConfig("emission_hz must be positive"));
        }
        if !(config.covariance_inflation >= 1.0) {
            return Err(ProviderError::InvalidConfig("covariance_inflation must be >= 1"));
        }

        let filter = Self::build_filter(
            &config,
            config.initial_x,
            config.initial_y,
            config.initial_heading_rad,
            config.initial_spread_xy,
            config.initial_spread_heading,
        )?;
        let step_detector = StepDetector::new(config.step_detector.clone());
        let orientation =
            OrientationTracker::new(config.orientation.clone(), config.initial_heading_rad);

        Ok(Self {
            config,
            map,
            filter,
            step_detector,
            orientation,
            state: ProviderState::Idle,
            last_valid_pose: None,
            position_subs: Vec::new(),
            next_sub_id: 0,
            status_sub: None,
            steps_total: 0,
            range_fixes: 0,
            bearing_fixes: 0,
            clamped_emissions: 0,
            last_update: None,
        })
    }

    fn build_filter(
        config: &LocalizationConfig,
        x: f64,
        y: f64,
        heading: f64,
        spread_xy: f64,
        spread_heading: f64,
    ) -> Result<ParticleFilter, ProviderError> {
        let mut filter = ParticleFilter::new(
            config.particle_count,
            x,
            y,
            heading,
            spread_xy,
            spread_heading,
            config.rng_seed,
        )?;
        filter.resample_threshold = config.resample_threshold;
        filter.constraint_penalty = config.constraint_penalty;
        Ok(filter)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn state(&self) -> ProviderState {
        self.state
    }

    /// Begin consuming sensor samples and emitting positions.
    /// Idempotent while Running.
    pub fn start(&mut self) -> Vec<ProviderEvent> {
        if self.state == ProviderState::Running {
            return Vec::new();
        }
        self.state = ProviderState::Running;
        self.notify_status(&StatusEvent::Started);
        log::info!("localization provider started");
        vec![ProviderEvent::Started]
    }

    pub fn stop(&mut self) -> Vec<ProviderEvent> {
        if self.state == ProviderState::Idle {
            return Vec::new();
        }
        self.state = ProviderState::Idle;
        self.notify_status(&StatusEvent::Stopped);
        log::info!("localization provider stopped");
        vec![ProviderEvent::Stopped]
    }

    /// Forward a platform permission / sensor-availability problem to
    /// the status subscriber. The provider keeps running in a degraded
    /// mode; this is a notification, not a failure.
    pub fn report_permission(&self, detail: impl Into<String>) {
        self.notify_status(&StatusEvent::Permission { detail: detail.into() });
    }

    // ── Sensor feeds ─────────────────────────────────────────────────

    /// Feed one accelerometer sample (primary high-rate tick).
    pub fn handle_accel(&mut self, sample: &AccelData) -> Vec<ProviderEvent> {
        if self.state != ProviderState::Running {
            return Vec::new();
        }
        match self.step_detector.process(sample) {
            Some(step) => self.apply_step(step.length_m, self.orientation.heading()),
            None => Vec::new(),
        }
    }

    /// Feed one orientation sample.
    pub fn handle_orientation(&mut self, sample: &OrientationData) -> Vec<ProviderEvent> {
        if self.state != ProviderState::Running {
            return Vec::new();
        }
        self.orientation.process(sample);
        Vec::new()
    }

    /// Advance the filter by one discrete step. Exposed for external
    /// pedometers and replay; `handle_accel` routes through here.
    pub fn apply_step(&mut self, length_m: f64, heading_rad: f64) -> Vec<ProviderEvent> {
        if self.state != ProviderState::Running {
            return Vec::new();
        }
        let scale = self.config.units_per_meter;
        if let Err(e) = self.filter.predict(
            length_m * scale,
            heading_rad,
            self.config.noise_step_m * scale,
            self.config.noise_heading_rad,
        ) {
            log::error!("predict rejected step: {e}");
            return Vec::new();
        }
        let map = &self.map;
        self.filter.apply_constraint(|x, y| map.is_inside(x, y));
        self.steps_total += 1;
        vec![ProviderEvent::StepDetected { length_m, heading_rad }]
    }

    // ── Absolute fixes ───────────────────────────────────────────────

    pub fn ingest_range(&mut self, fix: &RangeFix) -> Result<Vec<ProviderEvent>, ProviderError> {
        if self.state != ProviderState::Running {
            log::debug!("range fix ignored while idle");
            return Ok(Vec::new());
        }
        self.filter
            .update_range(fix.anchor_x, fix.anchor_y, fix.range, fix.sigma)?;
        let map = &self.map;
        self.filter.apply_constraint(|x, y| map.is_inside(x, y));
        self.range_fixes += 1;
        Ok(vec![ProviderEvent::RangeFixApplied { range: fix.range }])
    }

    pub fn ingest_bearing(&mut self, fix: &BearingFix) -> Result<Vec<ProviderEvent>, ProviderError> {
        if self.state != ProviderState::Running {
            log::debug!("bearing fix ignored while idle");
            return Ok(Vec::new());
        }
        self.filter
            .update_bearing(fix.anchor_x, fix.anchor_y, fix.bearing_rad, fix.sigma)?;
        let map = &self.map;
        self.filter.apply_constraint(|x, y| map.is_inside(x, y));
        self.bearing_fixes += 1;
        Ok(vec![ProviderEvent::BearingFixApplied { bearing_rad: fix.bearing_rad }])
    }

    /// Authoritative pose reset: rebuild the filter tightly around the
    /// given pose and re-seat the sticky output anchor. Valid in either
    /// lifecycle state.
    pub fn anchor(&mut self, pose: &AnchorPose) -> Result<Vec<ProviderEvent>, ProviderError> {
        let heading = pose
            .heading_deg
            .map(|d| wrap_angle(d.to_radians()))
            .unwrap_or_else(|| self.orientation.heading());
        self.filter = Self::build_filter(
            &self.config,
            pose.x,
            pose.y,
            heading,
            self.config.anchor_spread_xy,
            self.config.anchor_spread_heading,
        )?;
        self.orientation.set_heading(heading);
        self.last_valid_pose = Some((pose.x, pose.y, heading));
        log::info!("anchored at ({:.2}, {:.2})", pose.x, pose.y);
        Ok(vec![ProviderEvent::Anchored { x: pose.x, y: pose.y }])
    }

    // ── Emission ─────────────────────────────────────────────────────

    /// Periodic emission tick: stabilize, estimate, clamp, publish.
    /// Call at `emission_hz`; returns the published update.
    pub fn tick(&mut self, now: f64) -> Option<PositionUpdate> {
        if self.state != ProviderState::Running {
            return None;
        }

        // Cheap stabilizing pass before reading the estimate
        let map = &self.map;
        self.filter.apply_constraint(|x, y| map.is_inside(x, y));

        let est = self.filter.estimate();
        let mut sigma_sq_units = (est.covariance.xx + est.covariance.yy) / 2.0;

        let (x, y, heading) = if self.map.is_inside(est.mean.x, est.mean.y) {
            self.last_valid_pose = Some((est.mean.x, est.mean.y, est.mean.theta));
            (est.mean.x, est.mean.y, est.mean.theta)
        } else {
            match (self.config.clamp_policy, self.last_valid_pose) {
                (ClampPolicy::StickyLastValid, Some(pose)) => {
                    // Only the emitted value is clamped; the particle
                    // set keeps evolving and may recover on its own.
                    sigma_sq_units *= self.config.covariance_inflation;
                    self.clamped_emissions += 1;
                    log::debug!(
                        "estimate ({:.2}, {:.2}) out of bounds, emitting sticky pose",
                        est.mean.x,
                        est.mean.y
                    );
                    pose
                }
                _ => (est.mean.x, est.mean.y, est.mean.theta),
            }
        };

        let accuracy_m = sigma_sq_units.sqrt() / self.config.units_per_meter;
        let update = PositionUpdate {
            timestamp: now,
            x,
            y,
            heading_rad: heading,
            accuracy_m,
            confidence: self.bucket_confidence(accuracy_m),
        };

        for (_, cb) in &self.position_subs {
            cb(&update);
        }
        self.last_update = Some(update);
        Some(update)
    }

    fn bucket_confidence(&self, accuracy_m: f64) -> Confidence {
        if accuracy_m <= self.config.confidence_high_m {
            Confidence::High
        } else if accuracy_m <= self.config.confidence_medium_m {
            Confidence::Medium
        } else if accuracy_m <= self.config.confidence_low_m {
            Confidence::Low
        } else {
            Confidence::Unreliable
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register a position subscriber; returns a handle for
    /// `unsubscribe`. Multiple subscribers are allowed.
    pub fn on_position(
        &mut self,
        callback: impl Fn(&PositionUpdate) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.position_subs.push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.position_subs.len();
        self.position_subs.retain(|(sub_id, _)| *sub_id != id.0);
        self.position_subs.len() != before
    }

    /// Register the single status subscriber (replaces any previous).
    pub fn on_status(&mut self, callback: impl Fn(&StatusEvent) + Send + 'static) {
        self.status_sub = Some(Box::new(callback));
    }

    fn notify_status(&self, event: &StatusEvent) {
        if let Some(cb) = &self.status_sub {
            cb(event);
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn config(&self) -> &LocalizationConfig {
        &self.config
    }

    pub fn heading(&self) -> f64 {
        self.orientation.heading()
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            state: self.state,
            steps_total: self.steps_total,
            range_fixes: self.range_fixes,
            bearing_fixes: self.bearing_fixes,
            resamples: self.filter.resample_count(),
            weight_collapses: self.filter.collapse_count(),
            clamped_emissions: self.clamped_emissions,
            heading_rad: self.orientation.heading(),
            last_update: self.last_update,
        }
    }
}
