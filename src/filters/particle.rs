// particle.rs — Sequential Monte Carlo filter for 2-D pedestrian pose
//
// State per particle: position (x, y) in map units, heading theta in
// radians wrapped to (−π, π], non-negative weight. The filter owns a
// fixed-size particle set; predict applies the PDR motion model, the
// update_* methods apply absolute-fix likelihoods, apply_constraint
// down-weights hypotheses outside the walkable area. Resampling is
// systematic (low-variance), triggered by effective sample size.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use crate::types::angles::{angle_diff, circular_mean, wrap_angle};

/// Guards likelihood denominators against sigma = 0.
const SIGMA_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// Particle count must be at least 1
    #[error("particle count must be at least 1")]
    EmptyFilter,

    /// A parameter that must be finite was NaN or infinite
    #[error("non-finite parameter: {0}")]
    NonFinite(&'static str),

    /// A noise/sigma parameter was negative
    #[error("negative noise parameter: {0}")]
    NegativeNoise(&'static str),
}

#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub w: f64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoseMean {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

/// Diagonal covariance terms of the particle set. `tt` is computed from
/// wrapped angular residuals.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoseCovariance {
    pub xx: f64,
    pub yy: f64,
    pub tt: f64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoseEstimate {
    pub mean: PoseMean,
    pub covariance: PoseCovariance,
}

pub struct ParticleFilter {
    particles: Vec<Particle>,
    n: usize,

    /// Resample when `Neff < resample_threshold * n`.
    pub resample_threshold: f64,
    /// Weight multiplier for particles failing the walkable constraint.
    /// Must stay above zero so one bad membership check cannot wipe the
    /// probability mass.
    pub constraint_penalty: f64,

    rng: StdRng,
    resample_count: u64,
    collapse_count: u64,
}

impl ParticleFilter {
    /// Build a filter of `n` particles drawn from independent Gaussians
    /// around `(x, y, theta)` with the given position/heading spreads.
    ///
    /// `seed`: fixed RNG seed for reproducible replays; `None` uses OS
    /// entropy.
    pub fn new(
        n: usize,
        x: f64,
        y: f64,
        theta: f64,
        spread_xy: f64,
        spread_theta: f64,
        seed: Option<u64>,
    ) -> Result<Self, FilterError> {
        if n == 0 {
            return Err(FilterError::EmptyFilter);
        }
        for (value, name) in [
            (x, "x"),
            (y, "y"),
            (theta, "theta"),
            (spread_xy, "spread_xy"),
            (spread_theta, "spread_theta"),
        ] {
            if !value.is_finite() {
                return Err(FilterError::NonFinite(name));
            }
        }
        if spread_xy < 0.0 {
            return Err(FilterError::NegativeNoise("spread_xy"));
        }
        if spread_theta < 0.0 {
            return Err(FilterError::NegativeNoise("spread_theta"));
        }

        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let pos_noise =
            Normal::new(0.0, spread_xy).map_err(|_| FilterError::NegativeNoise("spread_xy"))?;
        let heading_noise = Normal::new(0.0, spread_theta)
            .map_err(|_| FilterError::NegativeNoise("spread_theta"))?;

        let w = 1.0 / n as f64;
        let particles = (0..n)
            .map(|_| Particle {
                x: x + pos_noise.sample(&mut rng),
                y: y + pos_noise.sample(&mut rng),
                theta: wrap_angle(theta + heading_noise.sample(&mut rng)),
                w,
            })
            .collect();

        Ok(Self {
            particles,
            n,
            resample_threshold: 0.6,
            constraint_penalty: 0.01,
            rng,
            resample_count: 0,
            collapse_count: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn resample_count(&self) -> u64 {
        self.resample_count
    }

    /// Times the filter recovered from total weight collapse.
    pub fn collapse_count(&self) -> u64 {
        self.collapse_count
    }

    /// PDR motion update: advance every particle by a jittered step
    /// length along a jittered heading.
    ///
    /// The heading jitter is drawn once and shared by all particles:
    /// heading uncertainty comes from a single sensor reading, not from
    /// per-particle divergence. Step-length jitter is per particle; a
    /// negative draw is clamped to zero.
    pub fn predict(
        &mut self,
        step_len: f64,
        heading: f64,
        noise_step: f64,
        noise_heading: f64,
    ) -> Result<(), FilterError> {
        for (value, name) in [(step_len, "step_len"), (heading, "heading")] {
            if !value.is_finite() {
                return Err(FilterError::NonFinite(name));
            }
        }
        let step_noise =
            Normal::new(0.0, noise_step).map_err(|_| FilterError::NegativeNoise("noise_step"))?;
        let heading_noise = Normal::new(0.0, noise_heading)
            .map_err(|_| FilterError::NegativeNoise("noise_heading"))?;

        let shared_heading = wrap_angle(heading + heading_noise.sample(&mut self.rng));
        let (sin_h, cos_h) = shared_heading.sin_cos();

        for p in &mut self.particles {
            let len = (step_len + step_noise.sample(&mut self.rng)).max(0.0);
            p.x += len * cos_h;
            p.y += len * sin_h;
            p.theta = shared_heading;
        }
        Ok(())
    }

    /// Range-fix measurement update: Gaussian likelihood on the gap
    /// between each particle's distance to the anchor and the measured
    /// range.
    pub fn update_range(
        &mut self,
        anchor_x: f64,
        anchor_y: f64,
        range: f64,
        sigma: f64,
    ) -> Result<(), FilterError> {
        for (value, name) in [(anchor_x, "anchor_x"), (anchor_y, "anchor_y"), (range, "range")] {
            if !value.is_finite() {
                return Err(FilterError::NonFinite(name));
            }
        }
        if sigma < 0.0 {
            return Err(FilterError::NegativeNoise("sigma"));
        }

        let denom = 2.0 * sigma * sigma + SIGMA_EPSILON;
        for p in &mut self.particles {
            let dist = (p.x - anchor_x).hypot(p.y - anchor_y);
            let residual = dist - range;
            p.w *= (-(residual * residual) / denom).exp();
        }
        self.normalize_and_maybe_resample();
        Ok(())
    }

    /// Bearing-fix measurement update: Gaussian likelihood on the
    /// wrapped difference between the measured bearing and the bearing
    /// implied by each particle's position relative to the anchor.
    pub fn update_bearing(
        &mut self,
        anchor_x: f64,
        anchor_y: f64,
        bearing_rad: f64,
        sigma: f64,
    ) -> Result<(), FilterError> {
        for (value, name) in [
            (anchor_x, "anchor_x"),
            (anchor_y, "anchor_y"),
            (bearing_rad, "bearing_rad"),
        ] {
            if !value.is_finite() {
                return Err(FilterError::NonFinite(name));
            }
        }
        if sigma < 0.0 {
            return Err(FilterError::NegativeNoise("sigma"));
        }

        let denom = 2.0 * sigma * sigma + SIGMA_EPSILON;
        for p in &mut self.particles {
            let implied = (p.y - anchor_y).atan2(p.x - anchor_x);
            let residual = angle_diff(bearing_rad, implied);
            p.w *= (-(residual * residual) / denom).exp();
        }
        self.normalize_and_maybe_resample();
        Ok(())
    }

    /// Down-weight every particle that fails the walkable-area
    /// predicate, then renormalize.
    pub fn apply_constraint(&mut self, inside: impl Fn(f64, f64) -> bool) {
        let penalty = self.constraint_penalty;
        let mut outside = 0usize;
        for p in &mut self.particles {
            if !inside(p.x, p.y) {
                p.w *= penalty;
                outside += 1;
            }
        }
        if outside > 0 {
            log::debug!("constraint: {}/{} particles outside", outside, self.n);
        }
        self.normalize_and_maybe_resample();
    }

    /// Weighted pose estimate over the particle set.
    ///
    /// Position is the weight-weighted arithmetic mean; heading is the
    /// weighted circular mean. If the total weight has collapsed to
    /// (numerically) zero the estimate falls back to the unweighted
    /// mean, so this never divides by zero and never returns NaN. A set
    /// whose headings cancel exactly (e.g. uniform weights on the four
    /// cardinal directions) yields the degenerate circular mean 0.0.
    pub fn estimate(&self) -> PoseEstimate {
        let total_w: f64 = self.particles.iter().map(|p| p.w).sum();
        let uniform = 1.0 / self.n as f64;
        let weight_of = |p: &Particle| if total_w > f64::EPSILON { p.w / total_w } else { uniform };

        let (mut mx, mut my) = (0.0, 0.0);
        for p in &self.particles {
            let w = weight_of(p);
            mx += w * p.x;
            my += w * p.y;
        }
        let mtheta = circular_mean(self.particles.iter().map(|p| (p.theta, weight_of(p))));

        let (mut cxx, mut cyy, mut ctt) = (0.0, 0.0, 0.0);
        for p in &self.particles {
            let w = weight_of(p);
            let dx = p.x - mx;
            let dy = p.y - my;
            let dt = angle_diff(p.theta, mtheta);
            cxx += w * dx * dx;
            cyy += w * dy * dy;
            ctt += w * dt * dt;
        }

        PoseEstimate {
            mean: PoseMean { x: mx, y: my, theta: mtheta },
            covariance: PoseCovariance { xx: cxx, yy: cyy, tt: ctt },
        }
    }

    // ── Internal: weight normalization + adaptive resampling ─────────

    fn normalize_and_maybe_resample(&mut self) {
        let total: f64 = self.particles.iter().map(|p| p.w).sum();

        if !(total > f64::EPSILON) || !total.is_finite() {
            // Degenerate collapse: every hypothesis was crushed. Reset
            // to uniform weights and keep the positions.
            let uniform = 1.0 / self.n as f64;
            for p in &mut self.particles {
                p.w = uniform;
            }
            self.collapse_count += 1;
            log::warn!("particle weights collapsed, reset to uniform (count {})", self.collapse_count);
            return;
        }

        for p in &mut self.particles {
            p.w /= total;
        }

        let sum_sq: f64 = self.particles.iter().map(|p| p.w * p.w).sum();
        let neff = 1.0 / sum_sq;
        if neff < self.resample_threshold * self.n as f64 {
            self.systematic_resample();
        }
    }

    /// Low-variance (systematic) resampling: one uniform offset in
    /// [0, 1/N), then a single monotonic sweep through the weight CDF.
    /// Every particle with weight ≥ 1/N survives at least once.
    fn systematic_resample(&mut self) {
        let n = self.n;
        let step = 1.0 / n as f64;
        let u0: f64 = self.rng.gen::<f64>() * step;

        let mut resampled = Vec::with_capacity(n);
        let mut cumulative = self.particles[0].w;
        let mut idx = 0usize;
        for j in 0..n {
            let u = u0 + j as f64 * step;
            while u > cumulative && idx < n - 1 {
                idx += 1;
                cumulative += self.particles[idx].w;
            }
            resampled.push(Particle { w: step, ..self.particles[idx] });
        }

        self.particles = resampled;
        self.resample_count += 1;
        log::debug!("systematic resample #{}", self.resample_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn weight_sum(pf: &ParticleFilter) -> f64 {
        pf.particles.iter().map(|p| p.w).sum()
    }

    #[test]
    fn test_rejects_empty_filter() {
        assert!(matches!(
            ParticleFilter::new(0, 0.0, 0.0, 0.0, 1.0, 0.1, Some(1)),
            Err(FilterError::EmptyFilter)
        ));
    }

    #[test]
    fn test_rejects_non_finite_pose() {
        assert!(ParticleFilter::new(10, f64::NAN, 0.0, 0.0, 1.0, 0.1, Some(1)).is_err());
    }

    #[test]
    fn test_weights_sum_to_one_after_update() {
        let mut pf = ParticleFilter::new(200, 0.0, 0.0, 0.0, 2.0, 0.2, Some(7)).unwrap();
        pf.update_range(5.0, 0.0, 5.0, 1.0).unwrap();
        assert_relative_eq!(weight_sum(&pf), 1.0, epsilon = 1e-9);
        pf.update_bearing(0.0, 10.0, -PI / 2.0, 0.3).unwrap();
        assert_relative_eq!(weight_sum(&pf), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_resample_preserves_set_size() {
        let mut pf = ParticleFilter::new(300, 0.0, 0.0, 0.0, 3.0, 0.3, Some(11)).unwrap();
        // A tight fix forces weight concentration and a resample
        for _ in 0..4 {
            pf.update_range(0.0, 0.0, 1.0, 0.05).unwrap();
        }
        assert!(pf.resample_count() > 0);
        assert_eq!(pf.particles.len(), 300);
        assert_relative_eq!(weight_sum(&pf), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_theta_stays_wrapped() {
        let mut pf = ParticleFilter::new(100, 0.0, 0.0, 3.0, 0.5, 0.5, Some(3)).unwrap();
        for _ in 0..50 {
            pf.predict(0.7, 2.9, 0.05, 0.3).unwrap();
        }
        for p in &pf.particles {
            assert!(p.theta > -PI && p.theta <= PI, "theta {} escaped wrap", p.theta);
        }
    }

    #[test]
    fn test_estimate_uniform_weights_is_centroid() {
        let mut pf = ParticleFilter::new(4, 0.0, 0.0, 0.0, 0.0, 0.0, Some(5)).unwrap();
        // Four cardinal corners with uniform weights, headings at the
        // four cardinal angles.
        let poses = [
            (0.0, 0.0, 0.0),
            (2.0, 0.0, PI / 2.0),
            (2.0, 2.0, PI),
            (0.0, 2.0, -PI / 2.0),
        ];
        for (p, &(x, y, theta)) in pf.particles.iter_mut().zip(poses.iter()) {
            *p = Particle { x, y, theta, w: 0.25 };
        }
        let est = pf.estimate();
        assert_relative_eq!(est.mean.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(est.mean.y, 1.0, epsilon = 1e-9);
        // Opposing headings cancel: degenerate circular mean documented as 0.0
        assert!(est.mean.theta.is_finite());
    }

    #[test]
    fn test_estimate_survives_zero_total_weight() {
        let mut pf = ParticleFilter::new(50, 1.0, 2.0, 0.0, 0.0, 0.0, Some(9)).unwrap();
        for p in &mut pf.particles {
            p.w = 0.0;
        }
        let est = pf.estimate();
        assert!(est.mean.x.is_finite() && est.mean.y.is_finite() && est.mean.theta.is_finite());
        assert_relative_eq!(est.mean.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(est.mean.y, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_collapse_resets_to_uniform() {
        let mut pf = ParticleFilter::new(64, 0.0, 0.0, 0.0, 1.0, 0.1, Some(13)).unwrap();
        for p in &mut pf.particles {
            p.w = 0.0;
        }
        pf.normalize_and_maybe_resample();
        assert_eq!(pf.collapse_count(), 1);
        for p in &pf.particles {
            assert_relative_eq!(p.w, 1.0 / 64.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_systematic_resample_unbiased() {
        // 900 particles at A (total weight 0.9), 100 at B (0.1). After
        // one systematic pass the A-fraction must track the weight
        // mass.
        let n = 1000;
        let mut pf = ParticleFilter::new(n, 0.0, 0.0, 0.0, 0.0, 0.0, Some(17)).unwrap();
        for (i, p) in pf.particles.iter_mut().enumerate() {
            if i < 500 {
                p.x = -10.0;
                p.w = 0.9 / 500.0;
            } else {
                p.x = 10.0;
                p.w = 0.1 / 500.0;
            }
        }
        pf.systematic_resample();
        let at_a = pf.particles.iter().filter(|p| p.x < 0.0).count();
        assert_eq!(pf.particles.len(), n);
        assert!(
            (880..=920).contains(&at_a),
            "expected ~900 copies of the heavy particle, got {at_a}"
        );
    }

    #[test]
    fn test_constraint_penalty_never_zeroes_mass() {
        let mut pf = ParticleFilter::new(128, 0.0, 0.0, 0.0, 1.0, 0.1, Some(19)).unwrap();
        // Everything is "outside": the soft penalty plus uniform
        // renormalization must keep the filter alive.
        pf.apply_constraint(|_, _| false);
        assert_relative_eq!(weight_sum(&pf), 1.0, epsilon = 1e-9);
        assert!(pf.estimate().mean.x.is_finite());
    }

    #[test]
    fn test_predict_accumulates_forward_motion() {
        let mut pf = ParticleFilter::new(500, 0.0, 0.0, 0.0, 0.1, 0.01, Some(23)).unwrap();
        for _ in 0..10 {
            pf.predict(0.7, 0.0, 0.02, 0.01).unwrap();
        }
        let est = pf.estimate();
        assert_relative_eq!(est.mean.x, 7.0, epsilon = 0.15);
        assert_relative_eq!(est.mean.y, 0.0, epsilon = 0.15);
    }

    #[test]
    fn test_predict_clamps_negative_step() {
        let mut pf = ParticleFilter::new(200, 0.0, 0.0, 0.0, 0.0, 0.0, Some(29)).unwrap();
        // Noise dwarfs the step; negative draws clamp to zero so the
        // cloud can only move forward.
        for _ in 0..20 {
            pf.predict(0.01, 0.0, 1.0, 0.0).unwrap();
        }
        for p in &pf.particles {
            assert!(p.x >= 0.0, "particle moved backwards: {}", p.x);
        }
    }

    #[test]
    fn test_range_update_pulls_toward_ring() {
        let mut pf = ParticleFilter::new(800, 0.0, 0.0, 0.0, 4.0, 0.3, Some(31)).unwrap();
        for _ in 0..6 {
            pf.update_range(10.0, 0.0, 4.0, 0.5).unwrap();
        }
        let est = pf.estimate();
        let dist = (est.mean.x - 10.0).hypot(est.mean.y);
        assert_relative_eq!(dist, 4.0, epsilon = 0.8);
    }

    #[test]
    fn test_bearing_update_rotates_cloud() {
        let mut pf = ParticleFilter::new(800, 0.0, 0.0, 0.0, 3.0, 0.3, Some(37)).unwrap();
        // Anchor well below the cloud, bearing straight up (+y): the
        // posterior should sit near the +y axis from the anchor.
        for _ in 0..6 {
            pf.update_bearing(0.0, -10.0, PI / 2.0, 0.1).unwrap();
        }
        let est = pf.estimate();
        let implied = (est.mean.y + 10.0).atan2(est.mean.x);
        assert_relative_eq!(implied, PI / 2.0, epsilon = 0.15);
    }
}
