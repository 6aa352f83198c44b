use std::collections::BTreeMap;

use glam::DMat3;
use serde::{Deserialize, Serialize};

use super::{IntegrationOutcome, PeakData, PeakIntegrator};
use crate::blob::Blob;
use crate::error::IntegrationFailure;
use crate::geometry::Ellipsoid;
use crate::math::{symmetric_eigen, try_inverse};
use crate::peak::{Intensity, IntegrationRegion, Peak};

/// Largest relative change of the shape metric a refinement may make.
const MAX_METRIC_CHANGE: f64 = 2.0;
/// Accepted range of the refined covariance eigenvalues, in pixels^2.
const MIN_VARIANCE: f64 = 0.1;
const MAX_VARIANCE: f64 = 100.0;

/// Shape re-estimation from the background-subtracted peak pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelSumConfig {
    /// Replace the peak center with the centroid of the signal.
    pub fit_center: bool,
    /// Replace the peak covariance with the second moments of the signal.
    pub fit_covariance: bool,
}

/// Peak counts minus the mean background scaled to the peak area.
///
/// With `n` peak pixels summing to `S` and background mean `B`:
/// `I = S - n B` and `var(I) = S + n^2 var(B)`, counts being Poisson.
/// The same correction applied frame by frame gives the rocking curve.
///
/// With fitting enabled the pixels above `B + sqrt(B)` are weighted by
/// their excess counts and their moments become the peak's new shape. The
/// intensity itself is always summed over the original region.
#[derive(Debug, Clone, Default)]
pub struct PixelSumIntegrator {
    config: PixelSumConfig,
}

impl PixelSumIntegrator {
    pub fn new(config: PixelSumConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PixelSumConfig {
        &self.config
    }

    fn refine_shape(
        &self,
        region: &IntegrationRegion,
        data: &PeakData,
        background: f64,
    ) -> Result<Ellipsoid, IntegrationFailure> {
        let shape = *region.shape();
        let cutoff = background + background.max(0.0).sqrt();
        let mut blob = Blob::new();
        for pixel in data.peak_pixels().filter(|p| p.counts > cutoff) {
            let p = pixel.position;
            blob.add_point(p.x, p.y, p.z, pixel.counts - background);
        }

        let center = if self.config.fit_center {
            let center = blob.center().map_err(|err| IntegrationFailure::InconsistentShape(err.to_string()))?;
            if !shape.contains(center) {
                return Err(IntegrationFailure::InconsistentShape(format!("centroid {center} outside the peak shape")));
            }
            center
        } else {
            shape.center
        };
        if !self.config.fit_covariance {
            return Ok(Ellipsoid { center, ..shape });
        }

        let covariance = blob.covariance().map_err(|err| IntegrationFailure::InconsistentShape(err.to_string()))?;
        let (variances, _) = symmetric_eigen(covariance);
        if variances.iter().any(|v| !(MIN_VARIANCE..=MAX_VARIANCE).contains(v)) {
            return Err(IntegrationFailure::InconsistentShape(format!("variances {variances:?} out of range")));
        }
        let (Some(before), Some(after)) = (shape.metric(), try_inverse(covariance, f64::MIN_POSITIVE)) else {
            return Err(IntegrationFailure::InconsistentShape("singular covariance".to_string()));
        };
        let change = frobenius_norm(after - before) / frobenius_norm(before);
        if change >= MAX_METRIC_CHANGE {
            return Err(IntegrationFailure::InconsistentShape(format!("metric changed by {change:.2}")));
        }
        Ellipsoid::from_covariance(center, covariance).map_err(|err| IntegrationFailure::InconsistentShape(err.to_string()))
    }
}

fn frobenius_norm(m: DMat3) -> f64 {
    m.to_cols_array().iter().map(|v| v * v).sum::<f64>().sqrt()
}

impl PeakIntegrator for PixelSumIntegrator {
    fn name(&self) -> &'static str {
        "pixel_sum"
    }

    fn compute(
        &self,
        _peak: &Peak,
        region: &IntegrationRegion,
        data: &PeakData,
    ) -> Result<IntegrationOutcome, IntegrationFailure> {
        let background = data.mean_background().ok_or(IntegrationFailure::NoBackground)?;
        let b = background.mean;

        // frame -> (sum, pixel count)
        let mut per_frame: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        for pixel in data.peak_pixels() {
            let entry = per_frame.entry(pixel.position.z as usize).or_default();
            entry.0 += pixel.counts;
            entry.1 += 1;
        }
        let (Some(&first), Some(&last)) = (per_frame.keys().next(), per_frame.keys().next_back()) else {
            return Err(IntegrationFailure::NoPeakPixels);
        };

        let corrected = |sum: f64, n: usize| {
            let n = n as f64;
            Intensity::new(sum - n * b.value, sum + n * n * b.variance)
        };

        let (sum, n) = per_frame
            .values()
            .fold((0.0, 0usize), |(s, c), &(fs, fc)| (s + fs, c + fc));

        let rocking_curve = (first..=last)
            .map(|f| per_frame.get(&f).map_or(Intensity::default(), |&(s, c)| corrected(s, c)))
            .collect();

        let shape = if self.config.fit_center || self.config.fit_covariance {
            Some(self.refine_shape(region, data, b.value)?)
        } else {
            None
        };

        Ok(IntegrationOutcome {
            intensity: corrected(sum, n),
            mean_background: Some(b),
            rocking_curve,
            rocking_curve_start: first,
            shape,
        })
    }
}
