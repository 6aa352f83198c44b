//! Peak result types, integration regions and the per-peak local frame.

mod coordinate_system;
mod region;

#[cfg(test)]
mod tests;

pub use coordinate_system::PeakCoordinateSystem;
pub use region::{IntegrationRegion, RegionType};
pub(crate) use region::validate_scales;

use std::fmt;
use std::ops::{Add, Sub};

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::IntegrationFailure;
use crate::frame::DatasetId;
use crate::geometry::Ellipsoid;

// ============================================================================
// Intensity
// ============================================================================

/// A measured quantity with its variance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Intensity {
    pub value: f64,
    pub variance: f64,
}

impl Intensity {
    pub fn new(value: f64, variance: f64) -> Self {
        Self { value, variance }
    }

    pub fn sigma(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// `value / sigma`, zero when the variance is not positive.
    pub fn strength(&self) -> f64 {
        let sigma = self.sigma();
        if sigma > 0.0 {
            self.value / sigma
        } else {
            0.0
        }
    }
}

impl Add for Intensity {
    type Output = Intensity;
    fn add(self, rhs: Intensity) -> Intensity {
        Intensity::new(self.value + rhs.value, self.variance + rhs.variance)
    }
}

impl Sub for Intensity {
    type Output = Intensity;
    fn sub(self, rhs: Intensity) -> Intensity {
        Intensity::new(self.value - rhs.value, self.variance + rhs.variance)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Reflection index `(h, k, l)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MillerIndex(pub i32, pub i32, pub i32);

impl MillerIndex {
    pub fn as_vec(&self) -> DVec3 {
        DVec3::new(self.0 as f64, self.1 as f64, self.2 as f64)
    }

    /// Euclidean distance in index space.
    pub fn distance(&self, other: &MillerIndex) -> f64 {
        (self.as_vec() - other.as_vec()).length()
    }
}

impl fmt::Display for MillerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.0, self.1, self.2)
    }
}

/// Why the finder disabled a peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionFlag {
    /// A semi-axis is outside the plausible extent range.
    TooSmallOrLarge,
    /// The peak spans more frames than allowed.
    OutsideFrameRange,
    /// The bounding box reaches the detector edge (minus the kernel margin).
    OutsideDetector,
    /// The bounding box touches a detector mask.
    Masked,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum IntegrationStatus {
    #[default]
    NotIntegrated,
    Integrated,
    Failed(IntegrationFailure),
}

// ============================================================================
// Peak
// ============================================================================

/// A detected reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub dataset: DatasetId,
    /// Center and extent; semi-axes are one standard deviation.
    pub shape: Ellipsoid,
    /// Background-corrected integrated intensity.
    pub intensity: Intensity,
    pub mean_background: Option<Intensity>,
    /// Per-frame corrected intensity, starting at `rocking_curve_start`.
    pub rocking_curve: Vec<Intensity>,
    pub rocking_curve_start: usize,
    pub miller_index: Option<MillerIndex>,
    pub selected: bool,
    pub masked: bool,
    pub enabled: bool,
    pub rejection: Option<RejectionFlag>,
    pub status: IntegrationStatus,
    /// Raw blob statistics: pixel count and total counts.
    pub pixel_count: usize,
    pub total_counts: f64,
}

impl Peak {
    pub fn new(dataset: DatasetId, shape: Ellipsoid) -> Self {
        Self {
            dataset,
            shape,
            intensity: Intensity::default(),
            mean_background: None,
            rocking_curve: Vec::new(),
            rocking_curve_start: 0,
            miller_index: None,
            selected: true,
            masked: false,
            enabled: true,
            rejection: None,
            status: IntegrationStatus::NotIntegrated,
            pixel_count: 0,
            total_counts: 0.0,
        }
    }

    pub fn center(&self) -> DVec3 {
        self.shape.center
    }

    /// Disable the peak with `flag`; the first flag wins.
    pub fn reject(&mut self, flag: RejectionFlag) {
        if self.rejection.is_none() {
            self.rejection = Some(flag);
        }
        if flag == RejectionFlag::Masked {
            self.masked = true;
        }
        self.enabled = false;
    }

    /// Enabled and selected.
    pub fn is_usable(&self) -> bool {
        self.enabled && self.selected
    }

    pub fn is_integrated(&self) -> bool {
        matches!(self.status, IntegrationStatus::Integrated)
    }

    pub fn failure(&self) -> Option<&IntegrationFailure> {
        match &self.status {
            IntegrationStatus::Failed(f) => Some(f),
            _ => None,
        }
    }
}
