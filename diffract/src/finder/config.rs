//! Peak finder configuration.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::blob::Connectivity;
use crate::convolution::{ConvolutionKernel, KernelParams};
use crate::frame::IterationMode;
use crate::geometry::DetectorMask;
use crate::math::confidence_to_z;
use crate::{Error, Result};

// ============================================================================
// Enums
// ============================================================================

/// How the per-frame detection threshold is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThresholdKind {
    /// Filtered pixels `>= threshold` are foreground.
    #[default]
    Absolute,
    /// Threshold is `mean + z * stddev` of each filtered frame, with `z`
    /// derived from `search_confidence`.
    Confidence,
}

// ============================================================================
// Config
// ============================================================================

/// Peak finder settings. Persisted with the session, hence serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakFinderConfig {
    // -- Threshold --
    pub threshold: f64,
    pub threshold_kind: ThresholdKind,
    /// One-sided confidence for 2D spot detection (confidence mode only).
    pub search_confidence: f64,
    /// Confidence giving the default peak-region scale for integration.
    pub integration_confidence: f64,

    // -- Filter --
    /// Registered kernel name, see [`ConvolutionKernel::from_name`].
    pub kernel: String,
    pub kernel_params: KernelParams,

    // -- Blob filtering --
    /// Inclusive bounds on blob pixel count.
    pub min_size: usize,
    pub max_size: usize,
    pub connectivity: Connectivity,
    /// Blobs whose scaled bounding boxes intersect are merged when set.
    pub collision_scale: Option<f64>,
    /// Peaks spanning more frames are flagged.
    pub max_frames: usize,
    /// Frames to scan; the whole dataset when `None`. Clamped per dataset.
    pub frame_range: Option<Range<usize>>,
    pub masks: Vec<DetectorMask>,

    // -- Execution --
    pub iteration_mode: IterationMode,
    pub parallel_datasets: bool,
    pub max_concurrent_datasets: usize,
}

impl Default for PeakFinderConfig {
    fn default() -> Self {
        Self {
            threshold: 80.0,
            threshold_kind: ThresholdKind::Absolute,
            search_confidence: 0.997,
            integration_confidence: 0.98,
            kernel: "delta".to_string(),
            kernel_params: KernelParams::new(),
            min_size: 30,
            max_size: 10_000,
            connectivity: Connectivity::Eight,
            collision_scale: None,
            max_frames: 20,
            frame_range: None,
            masks: Vec::new(),
            iteration_mode: IterationMode::ReadAhead,
            parallel_datasets: true,
            max_concurrent_datasets: 4,
        }
    }
}

fn check_confidence(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(Error::config(format!("{name} must be in (0, 1), got {value}")));
    }
    Ok(())
}

impl PeakFinderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(Error::config(format!("threshold must be finite, got {}", self.threshold)));
        }
        check_confidence("search_confidence", self.search_confidence)?;
        check_confidence("integration_confidence", self.integration_confidence)?;
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "min_size ({}) > max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.max_frames == 0 {
            return Err(Error::config("max_frames must be positive"));
        }
        if let Some(scale) = self.collision_scale {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(Error::config(format!("collision_scale must be positive, got {scale}")));
            }
        }
        if let Some(range) = &self.frame_range {
            if range.start > range.end {
                return Err(Error::config(format!("invalid frame range {range:?}")));
            }
        }
        if self.max_concurrent_datasets == 0 {
            return Err(Error::config("max_concurrent_datasets must be positive"));
        }
        self.build_kernel().map(|_| ())
    }

    pub fn build_kernel(&self) -> Result<ConvolutionKernel> {
        ConvolutionKernel::from_name(&self.kernel, &self.kernel_params)
    }

    /// z-score for confidence-mode detection.
    pub fn search_scale(&self) -> f64 {
        confidence_to_z(self.search_confidence)
    }

    /// Default peak-region scale handed to the integrator.
    pub fn integration_scale(&self) -> f64 {
        confidence_to_z(self.integration_confidence)
    }
}
