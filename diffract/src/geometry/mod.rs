//! Geometric primitives in detector space.
//!
//! Points are `DVec3(x, y, frame)`: `x` is the detector column, `y` the
//! detector row (pixel centers at integer coordinates) and `frame` the
//! position within the rotation stack.

mod instrument;


pub use instrument::InstrumentGeometry;

use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::math::symmetric_eigen;
use crate::{Error, Result};

/// Semi-axes below this are treated as collapsed when building a metric.
pub const MIN_SEMI_AXIS: f64 = 1e-9;

// ============================================================================
// Axis-aligned bounding box
// ============================================================================

/// Closed axis-aligned box in detector space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb3 {
    pub lower: DVec3,
    pub upper: DVec3,
}

impl Aabb3 {
    pub fn new(lower: DVec3, upper: DVec3) -> Self {
        Self {
            lower: lower.min(upper),
            upper: lower.max(upper),
        }
    }

    pub fn from_center_half_extents(center: DVec3, half: DVec3) -> Self {
        Self::new(center - half, center + half)
    }

    pub fn extents(&self) -> DVec3 {
        self.upper - self.lower
    }

    pub fn center(&self) -> DVec3 {
        (self.lower + self.upper) * 0.5
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.lower).all() && p.cmple(self.upper).all()
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Aabb3) -> bool {
        other.lower.cmpge(self.lower).all() && other.upper.cmple(self.upper).all()
    }

    pub fn intersects(&self, other: &Aabb3) -> bool {
        self.lower.cmple(other.upper).all() && other.lower.cmple(self.upper).all()
    }

    pub fn union(&self, other: &Aabb3) -> Aabb3 {
        Aabb3 {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Inclusive integer range of frames touched by the box, clamped to
    /// `0..frame_count`. Empty when the box lies outside the stack.
    pub fn frame_range(&self, frame_count: usize) -> Range<usize> {
        clamped_index_range(self.lower.z, self.upper.z, frame_count)
    }

    /// Pixel columns touched by the box, clamped to `0..cols`.
    pub fn column_range(&self, cols: usize) -> Range<usize> {
        clamped_index_range(self.lower.x, self.upper.x, cols)
    }

    /// Pixel rows touched by the box, clamped to `0..rows`.
    pub fn row_range(&self, rows: usize) -> Range<usize> {
        clamped_index_range(self.lower.y, self.upper.y, rows)
    }
}

fn clamped_index_range(lower: f64, upper: f64, len: usize) -> Range<usize> {
    if len == 0 || !lower.is_finite() || !upper.is_finite() || upper < 0.0 {
        return 0..0;
    }
    let start = lower.ceil().max(0.0) as usize;
    let end = (upper.floor() as usize).saturating_add(1).min(len);
    if start >= end {
        0..0
    } else {
        start..end
    }
}

// ============================================================================
// Ellipsoid
// ============================================================================

/// Oriented ellipsoid: `center`, semi-axis lengths and an orientation whose
/// columns are the unit axis directions matching `semi_axes`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipsoid {
    pub center: DVec3,
    pub semi_axes: DVec3,
    pub orientation: DMat3,
}

impl Ellipsoid {
    pub fn new(center: DVec3, semi_axes: DVec3, orientation: DMat3) -> Self {
        Self {
            center,
            semi_axes,
            orientation,
        }
    }

    /// Axis-aligned sphere, mostly useful for tests and synthetic peaks.
    pub fn sphere(center: DVec3, radius: f64) -> Self {
        Self::new(center, DVec3::splat(radius), DMat3::IDENTITY)
    }

    /// Ellipsoid whose semi-axes are the square roots of the eigenvalues of
    /// `covariance`. Negative eigenvalues from round-off are clamped to zero.
    pub fn from_covariance(center: DVec3, covariance: DMat3) -> Result<Self> {
        if !covariance.is_finite() || !center.is_finite() {
            return Err(Error::degenerate("non-finite covariance or center"));
        }
        let (values, vectors) = symmetric_eigen(covariance);
        let semi_axes = DVec3::from_array(values.map(|v| v.max(0.0).sqrt()));
        Ok(Self::new(center, semi_axes, vectors))
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            semi_axes: self.semi_axes * factor,
            ..*self
        }
    }

    /// `R diag(a^2) R^T`.
    pub fn covariance(&self) -> DMat3 {
        let r = self.orientation;
        r * DMat3::from_diagonal(self.semi_axes * self.semi_axes) * r.transpose()
    }

    /// Inverse covariance `R diag(1/a^2) R^T`, `None` when any semi-axis has
    /// collapsed.
    pub fn metric(&self) -> Option<DMat3> {
        if self.semi_axes.min_element() < MIN_SEMI_AXIS || !self.semi_axes.is_finite() {
            return None;
        }
        let r = self.orientation;
        let inv = DVec3::ONE / (self.semi_axes * self.semi_axes);
        Some(r * DMat3::from_diagonal(inv) * r.transpose())
    }

    /// Squared Mahalanobis distance of `p` from the center, in units of the
    /// semi-axes.
    pub fn r2(&self, p: DVec3) -> Option<f64> {
        let d = p - self.center;
        self.metric().map(|m| d.dot(m * d))
    }

    pub fn contains(&self, p: DVec3) -> bool {
        self.r2(p).is_some_and(|r2| r2 <= 1.0)
    }

    pub fn volume(&self) -> f64 {
        4.0 / 3.0 * std::f64::consts::PI * self.semi_axes.x * self.semi_axes.y * self.semi_axes.z
    }

    /// Tight axis-aligned bounding box.
    pub fn aabb(&self) -> Aabb3 {
        let r = self.orientation;
        let a = self.semi_axes;
        // Row i of R scaled by the semi-axes gives the half-extent along axis i.
        let half = DVec3::new(
            (r.row(0) * a).length(),
            (r.row(1) * a).length(),
            (r.row(2) * a).length(),
        );
        Aabb3::from_center_half_extents(self.center, half)
    }
}

// ============================================================================
// Detector mask
// ============================================================================

/// Rectangular excluded area of the detector, optionally limited to a range
/// of frames. Peaks whose bounding box touches a mask are flagged `Masked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorMask {
    /// Column interval `[x_min, x_max]`.
    pub x: (f64, f64),
    /// Row interval `[y_min, y_max]`.
    pub y: (f64, f64),
    /// Frames the mask applies to; all frames when `None`.
    pub frames: Option<Range<usize>>,
}

impl DetectorMask {
    pub fn rectangle(x: (f64, f64), y: (f64, f64)) -> Self {
        Self { x, y, frames: None }
    }

    pub fn with_frames(mut self, frames: Range<usize>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn aabb(&self) -> Aabb3 {
        let (z0, z1) = match &self.frames {
            Some(r) if !r.is_empty() => (r.start as f64, (r.end - 1) as f64),
            Some(_) => (f64::INFINITY, f64::NEG_INFINITY),
            None => (f64::NEG_INFINITY, f64::INFINITY),
        };
        Aabb3 {
            lower: DVec3::new(self.x.0.min(self.x.1), self.y.0.min(self.y.1), z0),
            upper: DVec3::new(self.x.0.max(self.x.1), self.y.0.max(self.y.1), z1),
        }
    }

    pub fn intersects(&self, other: &Aabb3) -> bool {
        let own = self.aabb();
        own.lower.z <= own.upper.z && own.intersects(other)
    }
}
