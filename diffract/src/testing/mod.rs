//! Synthetic frame stacks and instrument models for tests.

use std::sync::Arc;

use glam::{DMat3, DVec3};

use crate::frame::{Dataset, FrameSource, MemoryFrameSource};
use crate::geometry::InstrumentGeometry;
use crate::progress::ProgressHandler;
use crate::Result;

// ============================================================================
// Synthetic Gaussian stacks
// ============================================================================

/// Axis-aligned 3D Gaussian spot.
#[derive(Debug, Clone, Copy)]
pub struct GaussianSpot {
    pub center: DVec3,
    /// Standard deviation along x, y and frame.
    pub sigma: DVec3,
    /// Integrated counts of the continuous profile.
    pub total: f64,
}

impl GaussianSpot {
    pub fn isotropic(center: DVec3, sigma: f64, total: f64) -> Self {
        Self {
            center,
            sigma: DVec3::splat(sigma),
            total,
        }
    }

    pub fn peak_height(&self) -> f64 {
        self.total / (crate::math::gaussian_volume_factor_3d() * self.sigma.x * self.sigma.y * self.sigma.z)
    }

    pub fn value_at(&self, p: DVec3) -> f64 {
        let d = (p - self.center) / self.sigma;
        self.peak_height() * (-0.5 * d.length_squared()).exp()
    }
}

/// Frames of `background` counts plus the spots, rounded to integers.
pub fn gaussian_frames(
    rows: usize,
    cols: usize,
    frames: usize,
    spots: &[GaussianSpot],
    background: f64,
) -> Vec<Vec<u32>> {
    (0..frames)
        .map(|f| {
            let mut data = Vec::with_capacity(rows * cols);
            for y in 0..rows {
                for x in 0..cols {
                    let p = DVec3::new(x as f64, y as f64, f as f64);
                    let v = background + spots.iter().map(|s| s.value_at(p)).sum::<f64>();
                    data.push(v.round().max(0.0) as u32);
                }
            }
            data
        })
        .collect()
}

pub fn gaussian_dataset(
    rows: usize,
    cols: usize,
    frames: usize,
    spots: &[GaussianSpot],
    background: f64,
) -> Dataset {
    let source = MemoryFrameSource::new(rows, cols, gaussian_frames(rows, cols, frames, spots, background));
    Dataset::new("synthetic", Arc::new(source))
}

// ============================================================================
// Cancellation
// ============================================================================

/// Frame source that aborts a progress handler once a given frame is read.
pub struct CancellingSource {
    inner: MemoryFrameSource,
    handler: Arc<ProgressHandler>,
    cancel_after: usize,
}

impl CancellingSource {
    pub fn new(inner: MemoryFrameSource, handler: Arc<ProgressHandler>, cancel_after: usize) -> Self {
        Self {
            inner,
            handler,
            cancel_after,
        }
    }
}

impl FrameSource for CancellingSource {
    fn shape(&self) -> (usize, usize) {
        self.inner.shape()
    }

    fn frame_count(&self) -> usize {
        self.inner.frame_count()
    }

    fn read_frame(&self, index: usize) -> Result<Vec<u32>> {
        if index >= self.cancel_after {
            self.handler.abort();
        }
        self.inner.read_frame(index)
    }
}

// ============================================================================
// Instrument
// ============================================================================

/// Flat detector perpendicular to a beam along +z, with the sample rotating
/// about the lab y axis.
#[derive(Debug, Clone, Copy)]
pub struct FlatDetector {
    /// Sample to detector distance (mm).
    pub distance: f64,
    /// Pixel pitch (mm).
    pub pixel_size: f64,
    /// Pixel position of the direct beam; may lie off the detector.
    pub beam_col: f64,
    pub beam_row: f64,
    pub wavelength: f64,
    /// Rotation per frame (radians).
    pub step: f64,
}

impl Default for FlatDetector {
    fn default() -> Self {
        Self {
            distance: 50.0,
            pixel_size: 0.1,
            beam_col: -100.0,
            beam_row: 25.0,
            wavelength: 1.0,
            step: 0.01,
        }
    }
}

impl InstrumentGeometry for FlatDetector {
    fn incident_wavevector(&self, _frame: f64) -> DVec3 {
        DVec3::Z / self.wavelength
    }

    fn scattered_wavevector(&self, x: f64, y: f64, _frame: f64) -> DVec3 {
        let position = DVec3::new(
            (x - self.beam_col) * self.pixel_size,
            (y - self.beam_row) * self.pixel_size,
            self.distance,
        );
        position.normalize() / self.wavelength
    }

    fn sample_rotation(&self, frame: f64) -> DMat3 {
        DMat3::from_rotation_y(frame * self.step)
    }
}
