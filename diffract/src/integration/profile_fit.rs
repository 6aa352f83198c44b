//! Gaussian profile fitting with the peak's shape held fixed.
//!
//! Model: `f(p) = B + A exp(-1/2 (p - c)^T M (p - c))` with `M` the metric
//! of the peak ellipsoid and parameters `[B, A, cx, cy, cz]`. The integrated
//! intensity is the Gaussian volume `A (2 pi)^(3/2) sqrt(det M^-1)`.

use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

use super::lm_optimizer::{optimize, LMConfig, LMModel};
use super::{IntegrationOutcome, PeakData, PeakIntegrator};
use crate::error::IntegrationFailure;
use crate::math::gaussian_volume_factor_3d;
use crate::peak::{Intensity, IntegrationRegion, Peak};

const PARAM_BACKGROUND: usize = 0;
const PARAM_AMPLITUDE: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFitConfig {
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    /// Fits whose Pearson correlation with the data is lower are rejected.
    pub min_correlation: f64,
}

impl Default for ProfileFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-8,
            min_correlation: 0.75,
        }
    }
}

struct FixedShapeGaussian {
    metric: DMat3,
}

impl LMModel<5> for FixedShapeGaussian {
    #[inline]
    fn evaluate(&self, p: DVec3, params: &[f64; 5]) -> f64 {
        let [b, a, cx, cy, cz] = *params;
        let d = p - DVec3::new(cx, cy, cz);
        b + a * (-0.5 * d.dot(self.metric * d)).exp()
    }

    #[inline]
    fn jacobian_row(&self, p: DVec3, params: &[f64; 5]) -> [f64; 5] {
        let [_, a, cx, cy, cz] = *params;
        let d = p - DVec3::new(cx, cy, cz);
        let md = self.metric * d;
        let e = (-0.5 * d.dot(md)).exp();
        let dc = md * (a * e);
        [1.0, e, dc.x, dc.y, dc.z]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileFitIntegrator {
    config: ProfileFitConfig,
}

impl ProfileFitIntegrator {
    pub fn new(config: ProfileFitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProfileFitConfig {
        &self.config
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    if denom > 0.0 {
        cov / denom
    } else {
        0.0
    }
}

impl PeakIntegrator for ProfileFitIntegrator {
    fn name(&self) -> &'static str {
        "profile_fit"
    }

    fn compute(
        &self,
        _peak: &Peak,
        region: &IntegrationRegion,
        data: &PeakData,
    ) -> Result<IntegrationOutcome, IntegrationFailure> {
        let shape = region.shape();
        let metric = shape
            .metric()
            .ok_or_else(|| IntegrationFailure::DegenerateGeometry("peak shape has a collapsed axis".into()))?;

        let peak_max = data
            .peak_pixels()
            .map(|p| p.counts)
            .fold(None, |m: Option<f64>, c| Some(m.map_or(c, |m| m.max(c))))
            .ok_or(IntegrationFailure::NoPeakPixels)?;
        let background_guess = data.mean_background().map_or(0.0, |b| b.mean.value);

        let points: Vec<DVec3> = data.pixels.iter().map(|p| p.position).collect();
        let values: Vec<f64> = data.pixels.iter().map(|p| p.counts).collect();
        if points.len() <= 5 {
            return Err(IntegrationFailure::InvalidFit(format!("only {} pixels", points.len())));
        }

        let model = FixedShapeGaussian { metric };
        let c = shape.center;
        let initial = [background_guess, (peak_max - background_guess).max(1.0), c.x, c.y, c.z];
        let lm = LMConfig {
            max_iterations: self.config.max_iterations,
            convergence_threshold: self.config.convergence_threshold,
            ..Default::default()
        };
        let result = optimize(&model, &points, &values, initial, &lm);
        if !result.converged {
            return Err(IntegrationFailure::NotConverged);
        }

        let [b, a, cx, cy, cz] = result.params;
        if a.is_nan() || a <= 0.0 {
            return Err(IntegrationFailure::InvalidFit(format!("amplitude {a:.3e} is not positive")));
        }
        let fitted_center = DVec3::new(cx, cy, cz);
        if region.r2(fitted_center) > region.peak_end() * region.peak_end() {
            return Err(IntegrationFailure::InvalidFit(format!(
                "center {fitted_center:?} left the peak region"
            )));
        }

        let fitted: Vec<f64> = points.iter().map(|&p| model.evaluate(p, &result.params)).collect();
        let correlation = pearson(&values, &fitted);
        if correlation < self.config.min_correlation {
            return Err(IntegrationFailure::InvalidFit(format!(
                "pearson {correlation:.2} < {:.2}",
                self.config.min_correlation
            )));
        }

        let volume = gaussian_volume_factor_3d() * shape.semi_axes.x * shape.semi_axes.y * shape.semi_axes.z;
        let amplitude_variance = result
            .parameter_variance(PARAM_AMPLITUDE, points.len())
            .unwrap_or(f64::INFINITY);
        let background_variance = result
            .parameter_variance(PARAM_BACKGROUND, points.len())
            .unwrap_or(f64::INFINITY);

        Ok(IntegrationOutcome {
            intensity: Intensity::new(a * volume, amplitude_variance * volume * volume),
            mean_background: Some(Intensity::new(b, background_variance)),
            ..Default::default()
        })
    }
}
