//! Blob accumulation and 3D blob construction.
//!
//! A [`Blob`] keeps raw (uncentered) intensity moments of the points added
//! to it, so two blobs merge in O(1) and merging is associative. Per-frame
//! connected components seed blobs, and the [`BlobTracker`] grows them across
//! consecutive frames.

mod collision;
mod labeling;
mod tracker;


pub use collision::merge_colliding;
pub use labeling::Connectivity;
pub(crate) use labeling::label_components;
pub use tracker::{BlobTracker, TrackedBlob};

use glam::{DMat3, DVec3};

use crate::geometry::Ellipsoid;
use crate::math::outer;
use crate::{Error, Result};

/// Blobs lighter than this have no meaningful centroid.
pub const MASS_EPSILON: f64 = 1e-9;

/// Intensity-weighted moment accumulator over `(x, y, frame)` points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    count: usize,
    m0: f64,
    m1: DVec3,
    m2: DMat3,
    min_value: f64,
    max_value: f64,
}

impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}

impl Blob {
    pub fn new() -> Self {
        Self {
            count: 0,
            m0: 0.0,
            m1: DVec3::ZERO,
            m2: DMat3::ZERO,
            min_value: f64::INFINITY,
            max_value: f64::NEG_INFINITY,
        }
    }

    #[inline]
    pub fn add_point(&mut self, x: f64, y: f64, frame: f64, weight: f64) {
        let p = DVec3::new(x, y, frame);
        self.count += 1;
        self.m0 += weight;
        self.m1 += p * weight;
        self.m2 += outer(p, p) * weight;
        self.min_value = self.min_value.min(weight);
        self.max_value = self.max_value.max(weight);
    }

    /// Absorb `other`; the result equals accumulating both point sets into
    /// one blob.
    pub fn merge(&mut self, other: &Blob) {
        self.count += other.count;
        self.m0 += other.m0;
        self.m1 += other.m1;
        self.m2 += other.m2;
        self.min_value = self.min_value.min(other.min_value);
        self.max_value = self.max_value.max(other.max_value);
    }

    /// Number of points.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Total weight.
    pub fn mass(&self) -> f64 {
        self.m0
    }

    pub fn min_value(&self) -> f64 {
        self.min_value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    /// First moment over mass.
    pub fn center(&self) -> Result<DVec3> {
        if self.m0.is_nan() || self.m0 <= MASS_EPSILON {
            return Err(Error::degenerate(format!(
                "blob mass {} below {MASS_EPSILON}",
                self.m0
            )));
        }
        Ok(self.m1 / self.m0)
    }

    /// `m2 / mass - center (x) center`.
    pub fn covariance(&self) -> Result<DMat3> {
        let c = self.center()?;
        let cov = self.m2 * (1.0 / self.m0) - outer(c, c);
        // Symmetrize away round-off.
        Ok((cov + cov.transpose()) * 0.5)
    }

    /// Ellipsoid whose semi-axes are `scale` standard deviations along the
    /// principal axes.
    pub fn to_ellipsoid(&self, scale: f64) -> Result<Ellipsoid> {
        let center = self.center()?;
        let cov = self.covariance()?;
        Ellipsoid::from_covariance(center, cov * (scale * scale))
    }
}
