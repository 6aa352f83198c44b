//! Diffract - peak detection and integration for single-crystal diffraction.
//!
//! Given a stack of detector frames recorded while a sample rotates, the
//! engine locates reflection spots, estimates their 3D position and extent,
//! and integrates them into intensities with uncertainties:
//! - Frame access with synchronous or read-ahead iteration
//! - Circular convolution with a registry of filter kernels
//! - Connected-component blobs grown across frames
//! - Peak finding over many datasets with cooperative cancellation
//! - Pixel-sum, profile-fit and shape-library integration
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use diffract::prelude::*;
//!
//! let dataset = Dataset::new("scan_01", source);
//! let finder = PeakFinder::new(PeakFinderConfig::default());
//! let mut result = finder.find(&[dataset.clone()], None)?;
//!
//! let integrator = Integrator::from_name("pixel_sum", None)?;
//! let scale = finder.integration_scale();
//! integrator.integrate(&mut result.peaks, &dataset, scale, scale * 1.5, scale * 2.5, None)?;
//! ```

pub mod blob;
pub mod convolution;
pub mod error;
pub mod finder;
pub mod frame;
pub mod geometry;
pub mod integration;
pub mod math;
pub mod peak;
pub mod progress;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude;

// ============================================================================
// Errors
// ============================================================================

pub use error::{Error, IntegrationFailure, Result};

// ============================================================================
// Frames and geometry
// ============================================================================

pub use frame::{Dataset, DatasetId, Frame, FrameSource, IterationMode, MemoryFrameSource, OpenDataset};
pub use geometry::{Aabb3, DetectorMask, Ellipsoid, InstrumentGeometry};

// ============================================================================
// Detection
// ============================================================================

pub use blob::{Blob, Connectivity};
pub use convolution::{ConvolutionKernel, Convolver, KernelKind, KernelParams};
pub use finder::{FindDiagnostics, FindResult, PeakFinder, PeakFinderConfig, ThresholdKind};
pub use peak::{
    Intensity, IntegrationRegion, IntegrationStatus, MillerIndex, Peak, PeakCoordinateSystem, RegionType,
    RejectionFlag,
};

// ============================================================================
// Integration
// ============================================================================

pub use integration::{
    IntegrationConfig, IntegrationSummary, Integrator, IntegratorKind, PeakIntegrator, PixelSumConfig,
    PixelSumIntegrator, ProfileFitIntegrator, ShapeLibrary, ShapeLibraryConfig, ShapeLibraryIntegrator,
    SharedShapeLibrary,
};

// ============================================================================
// Progress
// ============================================================================

pub use progress::{ProgressCallback, ProgressHandler, ProgressUpdate};
