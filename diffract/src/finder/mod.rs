//! Peak finding across datasets.
//!
//! # Pipeline
//!
//! 1. **Filter**: each frame is correlated with the configured kernel.
//! 2. **Threshold**: filtered pixels at or above an absolute threshold, or
//!    `mean + z * stddev` of the filtered frame, are foreground.
//! 3. **Extract and merge**: foreground pixels are labeled into 2D
//!    components and grown into 3D blobs across consecutive frames.
//! 4. **Filter blobs**: blobs outside the pixel-count bounds are dropped,
//!    colliding blobs are optionally merged.
//! 5. **Peaks**: survivors become peaks shaped by their one-sigma ellipsoid;
//!    implausible, edge, long and masked peaks are flagged and disabled.
//!
//! Frames within a dataset are processed strictly in order. Independent
//! datasets may run in parallel. An abort requested on the progress handler
//! is honored at every frame boundary and discards all partial results.

mod config;


pub use config::{PeakFinderConfig, ThresholdKind};

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use glam::DVec3;

use crate::blob::{merge_colliding, BlobTracker, TrackedBlob};
use crate::convolution::Convolver;
use crate::frame::Dataset;
use crate::geometry::Aabb3;
use crate::peak::{Peak, RejectionFlag};
use crate::progress::{check_abort, ProgressHandler};
use crate::Result;

/// Plausible semi-axis range; peaks outside are flagged `TooSmallOrLarge`.
const MIN_EXTENT: f64 = 1e-5;
const MAX_EXTENT: f64 = 1e5;

/// Result of [`PeakFinder::find`].
#[derive(Debug, Clone, Default)]
pub struct FindResult {
    /// Peaks of all datasets, dataset by dataset in input order, each in
    /// first-seen frame order.
    pub peaks: Vec<Peak>,
    pub diagnostics: FindDiagnostics,
}

/// Counts from each stage of the finder, summed over datasets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindDiagnostics {
    pub datasets: usize,
    pub frames_processed: usize,
    /// 3D blobs finalized by the tracker, before any filtering.
    pub blobs_found: usize,
    /// Blobs absorbed by the collision merge.
    pub blobs_collided: usize,
    /// Blobs whose pixel count is outside `[min_size, max_size]`.
    pub rejected_size: usize,
    /// Blobs with no usable centroid or ellipsoid.
    pub rejected_degenerate: usize,
    pub flagged_too_small_or_large: usize,
    pub flagged_outside_frame_range: usize,
    pub flagged_outside_detector: usize,
    pub flagged_masked: usize,
    /// Peaks returned, flagged ones included.
    pub peaks: usize,
}

impl FindDiagnostics {
    fn accumulate(&mut self, other: &FindDiagnostics) {
        self.datasets += other.datasets;
        self.frames_processed += other.frames_processed;
        self.blobs_found += other.blobs_found;
        self.blobs_collided += other.blobs_collided;
        self.rejected_size += other.rejected_size;
        self.rejected_degenerate += other.rejected_degenerate;
        self.flagged_too_small_or_large += other.flagged_too_small_or_large;
        self.flagged_outside_frame_range += other.flagged_outside_frame_range;
        self.flagged_outside_detector += other.flagged_outside_detector;
        self.flagged_masked += other.flagged_masked;
        self.peaks += other.peaks;
    }

    /// Peaks that passed every check.
    pub fn accepted(&self) -> usize {
        self.peaks
            - self.flagged_too_small_or_large
            - self.flagged_outside_frame_range
            - self.flagged_outside_detector
            - self.flagged_masked
    }
}

/// Frames processed across all datasets of one `find` call.
struct ProgressCounter<'a> {
    handler: Option<&'a ProgressHandler>,
    done: AtomicUsize,
    total: usize,
}

impl ProgressCounter<'_> {
    fn frame_done(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(handler) = self.handler {
            handler.set_progress(100.0 * done as f64 / self.total.max(1) as f64);
        }
    }
}

/// Detects peaks in frame stacks.
#[derive(Debug, Clone, Default)]
pub struct PeakFinder {
    config: PeakFinderConfig,
}

impl PeakFinder {
    pub fn new(config: PeakFinderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PeakFinderConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PeakFinderConfig {
        &mut self.config
    }

    /// Default peak-region scale for integrating the found peaks.
    pub fn integration_scale(&self) -> f64 {
        self.config.integration_scale()
    }

    /// Find peaks in every dataset.
    ///
    /// Fails with a configuration error before touching any frame if the
    /// configuration is invalid, and with [`Error::Cancelled`](crate::Error::Cancelled)
    /// if `progress` is aborted; no partial peak list is returned in that
    /// case.
    pub fn find(&self, datasets: &[Dataset], progress: Option<&ProgressHandler>) -> Result<FindResult> {
        self.config.validate()?;
        let convolver = Convolver::new(self.config.build_kernel()?)?;

        let counter = ProgressCounter {
            handler: progress,
            done: AtomicUsize::new(0),
            total: datasets.iter().map(|d| self.frame_range(d).len()).sum(),
        };
        if let Some(handler) = progress {
            handler.set_progress(0.0);
            handler.set_status(format!("Finding peaks in {} dataset(s)", datasets.len()));
        }

        let run = |dataset: &Dataset| self.find_in_dataset(dataset, &convolver, &counter);
        let per_dataset = if self.config.parallel_datasets && datasets.len() > 1 {
            common::parallel::try_par_map_limited(datasets, self.config.max_concurrent_datasets, run)?
        } else {
            common::parallel::try_map_sequential(datasets, run)?
        };

        let mut result = FindResult::default();
        for (peaks, diagnostics) in per_dataset {
            result.peaks.extend(peaks);
            result.diagnostics.accumulate(&diagnostics);
        }

        tracing::info!(
            datasets = datasets.len(),
            blobs = result.diagnostics.blobs_found,
            peaks = result.diagnostics.peaks,
            accepted = result.diagnostics.accepted(),
            "Peak search finished"
        );
        if let Some(handler) = progress {
            handler.set_progress(100.0);
            handler.set_status("Peak search finished");
            handler.log(format!(
                "Found {} peaks ({} accepted, {} blobs rejected by size)",
                result.diagnostics.peaks,
                result.diagnostics.accepted(),
                result.diagnostics.rejected_size
            ));
        }
        Ok(result)
    }

    fn frame_range(&self, dataset: &Dataset) -> Range<usize> {
        let count = dataset.frame_count();
        match &self.config.frame_range {
            Some(r) => r.start.min(count)..r.end.min(count),
            None => 0..count,
        }
    }

    fn find_in_dataset(
        &self,
        dataset: &Dataset,
        convolver: &Convolver,
        counter: &ProgressCounter<'_>,
    ) -> Result<(Vec<Peak>, FindDiagnostics)> {
        let config = &self.config;
        let (rows, cols) = dataset.shape();
        let range = self.frame_range(dataset);
        let mut diagnostics = FindDiagnostics {
            datasets: 1,
            ..Default::default()
        };

        let open = dataset.open()?;
        let mut tracker = BlobTracker::new(rows, cols, config.connectivity);
        let search_z = config.search_scale();

        tracing::debug!(dataset = %dataset.name(), frames = ?range, "Scanning frames");
        for frame in open.frames(config.iteration_mode, range) {
            check_abort(counter.handler)?;
            let frame = frame?;
            let filtered = convolver.apply(&frame)?;
            let threshold = match config.threshold_kind {
                ThresholdKind::Absolute => config.threshold,
                ThresholdKind::Confidence => confidence_threshold(&filtered, search_z),
            };
            tracker.push_frame(&frame, &filtered, threshold);
            diagnostics.frames_processed += 1;
            counter.frame_done();
        }
        drop(open);

        let mut blobs = tracker.finish();
        diagnostics.blobs_found = blobs.len();
        tracing::debug!(dataset = %dataset.name(), blobs = blobs.len(), "Blobs finalized");

        if let Some(scale) = config.collision_scale {
            let before = blobs.len();
            blobs = merge_colliding(blobs, scale);
            diagnostics.blobs_collided = before - blobs.len();
        }

        let detector = self.detector_bounds(rows, cols, convolver.kernel().half_size());
        let mut peaks = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let size = blob.blob.count();
            if size < config.min_size || size > config.max_size {
                diagnostics.rejected_size += 1;
                continue;
            }
            match self.make_peak(dataset, &blob, &detector) {
                Ok(peak) => {
                    match peak.rejection {
                        Some(RejectionFlag::TooSmallOrLarge) => diagnostics.flagged_too_small_or_large += 1,
                        Some(RejectionFlag::OutsideFrameRange) => diagnostics.flagged_outside_frame_range += 1,
                        Some(RejectionFlag::OutsideDetector) => diagnostics.flagged_outside_detector += 1,
                        Some(RejectionFlag::Masked) => diagnostics.flagged_masked += 1,
                        None => {}
                    }
                    peaks.push(peak);
                }
                Err(err) => {
                    tracing::debug!(first_frame = blob.first_frame, "Dropping blob: {err}");
                    diagnostics.rejected_degenerate += 1;
                }
            }
        }
        diagnostics.peaks = peaks.len();

        tracing::info!(
            dataset = %dataset.name(),
            frames = diagnostics.frames_processed,
            blobs = diagnostics.blobs_found,
            rejected_size = diagnostics.rejected_size,
            peaks = diagnostics.peaks,
            "Dataset searched"
        );
        Ok((peaks, diagnostics))
    }

    /// Detector area a peak must stay inside, shrunk by the kernel margin.
    fn detector_bounds(&self, rows: usize, cols: usize, margin: usize) -> Aabb3 {
        let m = margin as f64;
        Aabb3 {
            lower: DVec3::new(m, m, f64::NEG_INFINITY),
            upper: DVec3::new(cols as f64 - 1.0 - m, rows as f64 - 1.0 - m, f64::INFINITY),
        }
    }

    fn make_peak(&self, dataset: &Dataset, blob: &TrackedBlob, detector: &Aabb3) -> Result<Peak> {
        let shape = blob.blob.to_ellipsoid(1.0)?;
        let mut peak = Peak::new(dataset.id(), shape);
        peak.pixel_count = blob.blob.count();
        peak.total_counts = blob.blob.mass();

        let extents = shape.semi_axes;
        if extents.min_element() < MIN_EXTENT || extents.max_element() > MAX_EXTENT {
            peak.reject(RejectionFlag::TooSmallOrLarge);
        }
        if blob.frame_span() > self.config.max_frames {
            peak.reject(RejectionFlag::OutsideFrameRange);
        }
        let aabb = shape.aabb();
        if !detector.contains(&aabb) {
            peak.reject(RejectionFlag::OutsideDetector);
        }
        if self.config.masks.iter().any(|mask| mask.intersects(&aabb)) {
            peak.reject(RejectionFlag::Masked);
        }
        Ok(peak)
    }
}

/// `mean + z * stddev` of a filtered frame. A flat frame has no outliers,
/// so its threshold is infinite.
pub(crate) fn confidence_threshold(filtered: &[f64], z: f64) -> f64 {
    if filtered.is_empty() {
        return f64::INFINITY;
    }
    let n = filtered.len() as f64;
    let mean = filtered.iter().sum::<f64>() / n;
    let variance = filtered.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if !stddev.is_finite() || stddev <= 0.0 {
        return f64::INFINITY;
    }
    mean + z * stddev
}
