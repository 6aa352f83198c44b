use glam::DVec3;

use crate::geometry::{Aabb3, Ellipsoid};
use crate::{Error, Result};

/// Classification of a point relative to an [`IntegrationRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Peak,
    Background,
    /// Guard ring between peak and background, or outside the region.
    Neither,
}

/// A peak shape scaled by three factors: points within `peak_end` scaled
/// semi-axes are peak, points between `bkg_begin` and `bkg_end` are
/// background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationRegion {
    shape: Ellipsoid,
    peak_end: f64,
    bkg_begin: f64,
    bkg_end: f64,
}

/// Validate the scale triple `0 < peak_end <= bkg_begin < bkg_end`.
pub(crate) fn validate_scales(peak_end: f64, bkg_begin: f64, bkg_end: f64) -> Result<()> {
    let finite = peak_end.is_finite() && bkg_begin.is_finite() && bkg_end.is_finite();
    if !finite || peak_end <= 0.0 || peak_end > bkg_begin || bkg_begin >= bkg_end {
        return Err(Error::config(format!(
            "integration scales must satisfy 0 < peak_end <= bkg_begin < bkg_end, got {peak_end}, {bkg_begin}, {bkg_end}"
        )));
    }
    Ok(())
}

impl IntegrationRegion {
    pub fn new(shape: Ellipsoid, peak_end: f64, bkg_begin: f64, bkg_end: f64) -> Result<Self> {
        validate_scales(peak_end, bkg_begin, bkg_end)?;
        if shape.metric().is_none() {
            return Err(Error::degenerate(format!(
                "peak shape has a collapsed axis: {:?}",
                shape.semi_axes
            )));
        }
        Ok(Self {
            shape,
            peak_end,
            bkg_begin,
            bkg_end,
        })
    }

    pub fn shape(&self) -> &Ellipsoid {
        &self.shape
    }

    pub fn peak_end(&self) -> f64 {
        self.peak_end
    }

    pub fn bkg_begin(&self) -> f64 {
        self.bkg_begin
    }

    pub fn bkg_end(&self) -> f64 {
        self.bkg_end
    }

    /// Squared distance in units of the unscaled shape.
    pub fn r2(&self, p: DVec3) -> f64 {
        self.shape.r2(p).unwrap_or(f64::INFINITY)
    }

    pub fn classify(&self, p: DVec3) -> RegionType {
        let r2 = self.r2(p);
        if r2 <= self.peak_end * self.peak_end {
            RegionType::Peak
        } else if r2 >= self.bkg_begin * self.bkg_begin && r2 <= self.bkg_end * self.bkg_end {
            RegionType::Background
        } else {
            RegionType::Neither
        }
    }

    /// Bounding box of the outer background boundary.
    pub fn aabb(&self) -> Aabb3 {
        self.shape.scaled(self.bkg_end).aabb()
    }

    /// Bounding box of the peak region.
    pub fn peak_aabb(&self) -> Aabb3 {
        self.shape.scaled(self.peak_end).aabb()
    }
}
