use std::sync::Arc;

use glam::{DMat3, DVec3};

use crate::geometry::{Ellipsoid, InstrumentGeometry};
use crate::math::try_inverse;
use crate::{Error, Result};

/// Below this |ki x kf| / (|ki| |kf|) the scattering plane is undefined.
const MIN_SCATTERING_SINE: f64 = 1e-9;

const MIN_JACOBIAN_DET: f64 = 1e-30;

/// Central-difference step in detector units (pixels and frames).
const JACOBIAN_STEP: f64 = 1e-3;

/// Local reference frame attached to one peak.
///
/// The basis is built at the peak center from the incident (`ki`) and
/// scattered (`kf`) wavevectors: `e1` is normal to the scattering plane,
/// `e2 = kf_hat x e1` and `e3 = e1 x e2`. A detector point maps to the
/// change of its momentum transfer, rotated back to the sample orientation
/// at the center frame, projected on the basis and divided by `|kf|`. In
/// these units beam divergence spreads peaks along `e1`/`e2` and sample
/// mosaicity along `e3`.
pub struct PeakCoordinateSystem {
    geometry: Arc<dyn InstrumentGeometry>,
    center: DVec3,
    /// `B * R(center)`: projects sample-frame vectors on the local basis.
    projection: DMat3,
    /// Sample-frame momentum transfer at the center.
    q_center: DVec3,
    scale: f64,
}

impl std::fmt::Debug for PeakCoordinateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeakCoordinateSystem")
            .field("center", &self.center)
            .field("scale", &self.scale)
            .finish()
    }
}

fn momentum_transfer(geometry: &dyn InstrumentGeometry, p: DVec3) -> DVec3 {
    let ki = geometry.incident_wavevector(p.z);
    let kf = geometry.scattered_wavevector(p.x, p.y, p.z);
    geometry.sample_rotation(p.z).transpose() * (kf - ki)
}

impl PeakCoordinateSystem {
    pub fn new(geometry: Arc<dyn InstrumentGeometry>, center: DVec3) -> Result<Self> {
        let ki = geometry.incident_wavevector(center.z);
        let kf = geometry.scattered_wavevector(center.x, center.y, center.z);
        let (ki_len, kf_len) = (ki.length(), kf.length());
        if !(ki_len > 0.0 && kf_len > 0.0) || !ki.is_finite() || !kf.is_finite() {
            return Err(Error::degenerate("zero or non-finite wavevector"));
        }

        let normal = ki.cross(kf);
        if normal.length() < MIN_SCATTERING_SINE * ki_len * kf_len {
            return Err(Error::degenerate(format!(
                "incident and scattered beams are collinear at {center:?}"
            )));
        }
        let e1 = normal.normalize();
        let e2 = (kf / kf_len).cross(e1);
        let e3 = e1.cross(e2);

        let basis = DMat3::from_cols(e1, e2, e3).transpose();
        let rotation = geometry.sample_rotation(center.z);
        let projection = basis * rotation;
        let q_center = momentum_transfer(geometry.as_ref(), center);

        Ok(Self {
            geometry,
            center,
            projection,
            q_center,
            scale: 1.0 / kf_len,
        })
    }

    pub fn center(&self) -> DVec3 {
        self.center
    }

    /// Detector units to local units factor, `1 / |kf|`.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Map a detector point `(x, y, frame)` into the local frame. The peak
    /// center maps to the origin.
    pub fn transform(&self, p: DVec3) -> DVec3 {
        let q = momentum_transfer(self.geometry.as_ref(), p);
        self.projection * (q - self.q_center) * self.scale
    }

    /// Derivative of [`transform`](Self::transform) at the center; column
    /// `i` is the derivative along detector axis `i`.
    pub fn jacobian(&self) -> DMat3 {
        let h = JACOBIAN_STEP;
        let column = |axis: DVec3| {
            (self.transform(self.center + axis * h) - self.transform(self.center - axis * h)) / (2.0 * h)
        };
        DMat3::from_cols(column(DVec3::X), column(DVec3::Y), column(DVec3::Z))
    }

    fn inverse_jacobian(&self) -> Result<(DMat3, DMat3)> {
        let j = self.jacobian();
        let j_inv = try_inverse(j, MIN_JACOBIAN_DET)
            .ok_or_else(|| Error::degenerate(format!("singular jacobian at {:?}", self.center)))?;
        Ok((j, j_inv))
    }

    /// Detector-space shape predicted for beam divergence `sigma_d` and
    /// mosaicity `sigma_m`, both in local units.
    pub fn detector_shape(&self, sigma_d: f64, sigma_m: f64) -> Result<Ellipsoid> {
        let (_, j_inv) = self.inverse_jacobian()?;
        let local = DMat3::from_diagonal(DVec3::new(sigma_d * sigma_d, sigma_d * sigma_d, sigma_m * sigma_m));
        let cov = j_inv * local * j_inv.transpose();
        Ellipsoid::from_covariance(self.center, cov)
    }

    /// Inverse of [`detector_shape`](Self::detector_shape): the divergence and
    /// mosaicity that best explain an observed detector-space shape.
    pub fn estimate_divergence_mosaicity(&self, shape: &Ellipsoid) -> Result<(f64, f64)> {
        let (j, _) = self.inverse_jacobian()?;
        let local = j * shape.covariance() * j.transpose();
        let sigma_d = (0.5 * (local.x_axis.x + local.y_axis.y)).max(0.0).sqrt();
        let sigma_m = local.z_axis.z.max(0.0).sqrt();
        Ok((sigma_d, sigma_m))
    }

    /// Volume of one detector voxel (1 px x 1 px x 1 frame) in local units.
    pub fn voxel_volume(&self) -> f64 {
        self.jacobian().determinant().abs()
    }
}
