//! Peak integration.
//!
//! An [`Integrator`] streams a dataset once, gathers the pixels of every
//! peak's [`IntegrationRegion`] and hands them to a [`PeakIntegrator`]
//! strategy:
//!
//! - [`PixelSumIntegrator`]: peak counts minus the area-scaled mean background.
//! - [`ProfileFitIntegrator`]: Levenberg-Marquardt fit of a Gaussian with the
//!   peak's own shape, integrated analytically.
//! - [`ShapeLibraryIntegrator`]: least-squares scale of a profile predicted
//!   from a [`ShapeLibrary`], which it also feeds with strong observations.
//!
//! Pixels inside one peak's peak region never count as background of
//! another. With [`IntegrationConfig::discard_saturated`] set, peaks holding
//! a pixel above `max_counts` fail before any strategy runs.
//!
//! Per-peak failures are stored on the peak. Only an invalid configuration,
//! a frame read error or an abort make the whole call fail.

mod lm_optimizer;
mod pixel_sum;
mod profile_fit;
mod shape_library;


pub use pixel_sum::{PixelSumConfig, PixelSumIntegrator};
pub use profile_fit::{ProfileFitConfig, ProfileFitIntegrator};
pub use shape_library::{
    Interpolation, Profile3D, ProfileFrame, ShapeLibrary, ShapeLibraryConfig, ShapeLibraryIntegrator,
    SharedShapeLibrary,
};

use std::ops::Range;
use std::sync::Arc;

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::IntegrationFailure;
use crate::frame::{Dataset, Frame, IterationMode};
use crate::geometry::{Aabb3, Ellipsoid, InstrumentGeometry};
use crate::peak::{validate_scales, Intensity, IntegrationRegion, IntegrationStatus, Peak, RegionType};
use crate::progress::{check_abort, ProgressHandler};
use crate::{Error, Result};

// ============================================================================
// Collected data
// ============================================================================

/// One detector voxel inside a peak's integration region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionPixel {
    /// `(x, y, frame)`.
    pub position: DVec3,
    pub counts: f64,
    /// Either `Peak` or `Background`; guard-ring pixels are not collected.
    pub region: RegionType,
}

/// Background level estimated from the annulus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackgroundEstimate {
    /// Mean counts per pixel with the variance of that mean.
    pub mean: Intensity,
    pub pixels: usize,
}

/// Pixels gathered for one peak plus the dataset's instrument model.
#[derive(Clone, Default)]
pub struct PeakData {
    pub pixels: Vec<RegionPixel>,
    pub geometry: Option<Arc<dyn InstrumentGeometry>>,
}

impl std::fmt::Debug for PeakData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeakData")
            .field("pixels", &self.pixels.len())
            .field("geometry", &self.geometry.is_some())
            .finish()
    }
}

impl PeakData {
    pub fn new(pixels: Vec<RegionPixel>) -> Self {
        Self { pixels, geometry: None }
    }

    pub fn peak_pixels(&self) -> impl Iterator<Item = &RegionPixel> {
        self.pixels.iter().filter(|p| p.region == RegionType::Peak)
    }

    pub fn background_pixels(&self) -> impl Iterator<Item = &RegionPixel> {
        self.pixels.iter().filter(|p| p.region == RegionType::Background)
    }

    /// Mean background with the variance of the mean. A single pixel falls
    /// back to its Poisson variance.
    pub fn mean_background(&self) -> Option<BackgroundEstimate> {
        let (mut n, mut sum, mut sum_sq) = (0usize, 0.0f64, 0.0f64);
        for p in self.background_pixels() {
            n += 1;
            sum += p.counts;
            sum_sq += p.counts * p.counts;
        }
        if n == 0 {
            return None;
        }
        let mean = sum / n as f64;
        let variance_of_mean = if n > 1 {
            let sample_variance = ((sum_sq - n as f64 * mean * mean) / (n - 1) as f64).max(0.0);
            sample_variance / n as f64
        } else {
            mean.max(0.0)
        };
        Some(BackgroundEstimate {
            mean: Intensity::new(mean, variance_of_mean),
            pixels: n,
        })
    }
}

/// What a successful integration stores on the peak.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntegrationOutcome {
    pub intensity: Intensity,
    pub mean_background: Option<Intensity>,
    pub rocking_curve: Vec<Intensity>,
    pub rocking_curve_start: usize,
    /// Re-estimated peak shape, replacing the peak's own when set.
    pub shape: Option<Ellipsoid>,
}

// ============================================================================
// Strategy trait and registry
// ============================================================================

/// Turns the pixels of one peak into an intensity.
pub trait PeakIntegrator: Send + Sync {
    fn name(&self) -> &'static str;

    fn compute(
        &self,
        peak: &Peak,
        region: &IntegrationRegion,
        data: &PeakData,
    ) -> std::result::Result<IntegrationOutcome, IntegrationFailure>;

    /// Whether peaks may be computed concurrently. Strategies with shared
    /// mutable state return `false` and are run in peak order.
    fn is_parallel_safe(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum IntegratorKind {
    PixelSum,
    ProfileFit,
    ShapeLibrary,
}

impl IntegratorKind {
    pub fn names() -> Vec<String> {
        IntegratorKind::iter().map(|k| k.to_string()).collect()
    }

    pub fn from_name(name: &str) -> Result<Self> {
        name.parse().map_err(|_| {
            Error::config(format!(
                "unknown integrator '{name}' (available: {})",
                IntegratorKind::names().join(", ")
            ))
        })
    }

    /// Build the strategy. The shape-library integrator needs `library`.
    pub fn create(&self, library: Option<SharedShapeLibrary>) -> Result<Box<dyn PeakIntegrator>> {
        Ok(match self {
            IntegratorKind::PixelSum => Box::new(PixelSumIntegrator::default()),
            IntegratorKind::ProfileFit => Box::new(ProfileFitIntegrator::new(ProfileFitConfig::default())),
            IntegratorKind::ShapeLibrary => {
                let library = library
                    .ok_or_else(|| Error::config("integrator 'shape_library' requires a shape library"))?;
                Box::new(ShapeLibraryIntegrator::new(library))
            }
        })
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Settings applied by the driver to every strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub iteration_mode: IterationMode,
    /// Fail peaks whose peak region holds a pixel above `max_counts`.
    pub discard_saturated: bool,
    pub max_counts: f64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            iteration_mode: IterationMode::ReadAhead,
            discard_saturated: false,
            max_counts: 50_000.0,
        }
    }
}

impl IntegrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.discard_saturated && !(self.max_counts.is_finite() && self.max_counts > 0.0) {
            return Err(Error::config(format!(
                "max_counts must be positive, got {}",
                self.max_counts
            )));
        }
        Ok(())
    }
}

/// Counts of one [`Integrator::integrate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrationSummary {
    pub integrated: usize,
    pub failed: usize,
    /// Disabled peaks and peaks of other datasets.
    pub skipped: usize,
}

/// Frame, row and column ranges of a box clamped to the dataset.
#[derive(Debug, Clone)]
struct Window {
    frames: Range<usize>,
    rows: Range<usize>,
    cols: Range<usize>,
}

impl Window {
    fn new(aabb: Aabb3, frame_count: usize, rows: usize, cols: usize) -> Self {
        Self {
            frames: aabb.frame_range(frame_count),
            rows: aabb.row_range(rows),
            cols: aabb.column_range(cols),
        }
    }

    fn pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows
            .clone()
            .flat_map(move |y| self.cols.clone().map(move |x| (x, y)))
    }
}

struct Target {
    peak: usize,
    region: IntegrationRegion,
    /// Whole region, background shell included.
    window: Window,
    /// Peak region only.
    peak_window: Window,
    data: PeakData,
}

impl Target {
    /// Flag the pixels of `frame` inside this peak's peak region.
    fn mark_peak(&self, frame: &Frame, occupied: &mut [bool]) {
        if !self.peak_window.frames.contains(&frame.index()) {
            return;
        }
        let z = frame.index() as f64;
        for (x, y) in self.peak_window.pixels() {
            if self.region.classify(DVec3::new(x as f64, y as f64, z)) == RegionType::Peak {
                occupied[y * frame.cols() + x] = true;
            }
        }
    }

    /// Gather peak and background pixels. Background pixels inside any
    /// peak's peak region are skipped.
    fn collect(&mut self, frame: &Frame, occupied: &[bool]) {
        if !self.window.frames.contains(&frame.index()) {
            return;
        }
        let z = frame.index() as f64;
        for (x, y) in self.window.pixels() {
            let position = DVec3::new(x as f64, y as f64, z);
            let region = self.region.classify(position);
            let usable = match region {
                RegionType::Peak => true,
                RegionType::Background => !occupied[y * frame.cols() + x],
                RegionType::Neither => false,
            };
            if usable {
                self.data.pixels.push(RegionPixel {
                    position,
                    counts: frame.get(x, y) as f64,
                    region,
                });
            }
        }
    }

    fn max_peak_counts(&self) -> f64 {
        self.data
            .peak_pixels()
            .map(|p| p.counts)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Runs a [`PeakIntegrator`] over the peaks of a dataset.
pub struct Integrator {
    method: Box<dyn PeakIntegrator>,
    config: IntegrationConfig,
}

impl std::fmt::Debug for Integrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrator")
            .field("method", &self.method.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Integrator {
    pub fn new(method: Box<dyn PeakIntegrator>) -> Self {
        Self {
            method,
            config: IntegrationConfig::default(),
        }
    }

    /// Integrator for a registered strategy name.
    pub fn from_name(name: &str, library: Option<SharedShapeLibrary>) -> Result<Self> {
        Ok(Self::new(IntegratorKind::from_name(name)?.create(library)?))
    }

    pub fn with_config(mut self, config: IntegrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_iteration_mode(mut self, mode: IterationMode) -> Self {
        self.config.iteration_mode = mode;
        self
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    pub fn method_name(&self) -> &'static str {
        self.method.name()
    }

    /// Integrate the enabled peaks of `dataset`.
    ///
    /// Region scales are in units of each peak's shape and must satisfy
    /// `0 < peak_end <= bkg_begin < bkg_end`. The dataset is read once over
    /// the union of all regions' frames. Pixels inside any peak's peak region
    /// are never used as background of another peak.
    ///
    /// Peaks are only modified when the call succeeds; on cancellation they
    /// are left as they were.
    pub fn integrate(
        &self,
        peaks: &mut [Peak],
        dataset: &Dataset,
        peak_end: f64,
        bkg_begin: f64,
        bkg_end: f64,
        progress: Option<&ProgressHandler>,
    ) -> Result<IntegrationSummary> {
        validate_scales(peak_end, bkg_begin, bkg_end)?;
        self.config.validate()?;

        let mut summary = IntegrationSummary::default();
        let (rows, cols) = dataset.shape();
        let frame_count = dataset.frame_count();

        let mut targets = Vec::new();
        // Written to the peaks only once the call can no longer be cancelled.
        let mut rejected: Vec<(usize, IntegrationFailure)> = Vec::new();
        for (index, peak) in peaks.iter().enumerate() {
            if !peak.enabled || peak.dataset != dataset.id() {
                summary.skipped += 1;
                continue;
            }
            match IntegrationRegion::new(peak.shape, peak_end, bkg_begin, bkg_end) {
                Ok(region) => targets.push(Target {
                    peak: index,
                    region,
                    window: Window::new(region.aabb(), frame_count, rows, cols),
                    peak_window: Window::new(region.peak_aabb(), frame_count, rows, cols),
                    data: PeakData {
                        pixels: Vec::new(),
                        geometry: dataset.geometry().cloned(),
                    },
                }),
                Err(err) => rejected.push((index, IntegrationFailure::DegenerateGeometry(err.to_string()))),
            }
        }

        let scan = targets
            .iter()
            .filter(|t| !t.window.frames.is_empty())
            .fold(None, |acc: Option<Range<usize>>, t| {
                let frames = &t.window.frames;
                match acc {
                    None => Some(frames.clone()),
                    Some(r) => Some(r.start.min(frames.start)..r.end.max(frames.end)),
                }
            })
            .unwrap_or(0..0);

        if let Some(handler) = progress {
            handler.set_progress(0.0);
            handler.set_status(format!("Integrating {} peaks ({})", targets.len(), self.method.name()));
        }
        tracing::debug!(
            dataset = %dataset.name(),
            peaks = targets.len(),
            frames = ?scan,
            method = self.method.name(),
            "Collecting integration regions"
        );

        if !scan.is_empty() {
            let open = dataset.open()?;
            let total = scan.len();
            let mut occupied = vec![false; rows * cols];
            for (done, frame) in open.frames(self.config.iteration_mode, scan).enumerate() {
                check_abort(progress)?;
                let frame = frame?;
                occupied.fill(false);
                for target in &targets {
                    target.mark_peak(&frame, &mut occupied);
                }
                targets.par_iter_mut().for_each(|t| t.collect(&frame, &occupied));
                if let Some(handler) = progress {
                    handler.set_progress(90.0 * (done + 1) as f64 / total as f64);
                }
            }
        }

        check_abort(progress)?;
        let shared: &[Peak] = peaks;
        let compute = |t: &Target| {
            if self.config.discard_saturated {
                let max = t.max_peak_counts();
                if max > self.config.max_counts {
                    return Err(IntegrationFailure::SaturatedPixel(max));
                }
            }
            self.method.compute(&shared[t.peak], &t.region, &t.data)
        };
        let outcomes: Vec<_> = if self.method.is_parallel_safe() {
            targets.par_iter().map(compute).collect()
        } else {
            targets.iter().map(compute).collect()
        };

        for (index, failure) in rejected {
            peaks[index].status = IntegrationStatus::Failed(failure);
            summary.failed += 1;
        }
        for (target, outcome) in targets.iter().zip(outcomes) {
            let peak = &mut peaks[target.peak];
            match outcome {
                Ok(outcome) => {
                    peak.intensity = outcome.intensity;
                    peak.mean_background = outcome.mean_background;
                    peak.rocking_curve = outcome.rocking_curve;
                    peak.rocking_curve_start = outcome.rocking_curve_start;
                    if let Some(shape) = outcome.shape {
                        peak.shape = shape;
                    }
                    peak.status = IntegrationStatus::Integrated;
                    summary.integrated += 1;
                }
                Err(failure) => {
                    tracing::debug!(center = ?peak.center(), "Integration failed: {failure}");
                    peak.status = IntegrationStatus::Failed(failure);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            dataset = %dataset.name(),
            method = self.method.name(),
            integrated = summary.integrated,
            failed = summary.failed,
            skipped = summary.skipped,
            "Integration finished"
        );
        if let Some(handler) = progress {
            handler.set_progress(100.0);
            handler.set_status("Integration finished");
            handler.log(format!(
                "Integrated {} peaks with {} ({} failed, {} skipped)",
                summary.integrated,
                self.method.name(),
                summary.failed,
                summary.skipped
            ));
        }
        Ok(summary)
    }
}
