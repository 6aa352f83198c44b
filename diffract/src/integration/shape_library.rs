//! Per-reflection profile statistics.
//!
//! Profiles live on a fixed cubic grid in whitened coordinates: a detector
//! point is mapped relative to the peak center (optionally through the
//! [`PeakCoordinateSystem`]) and multiplied by the inverse square root of the
//! peak covariance, so one unit is one standard deviation in every
//! direction. Profiles of peaks with different sizes are then comparable and
//! can be averaged per Miller index.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{DMat3, DVec3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{IntegrationOutcome, PeakData, PeakIntegrator};
use crate::error::IntegrationFailure;
use crate::geometry::{Ellipsoid, InstrumentGeometry};
use crate::math::symmetric_eigen;
use crate::peak::{Intensity, IntegrationRegion, MillerIndex, Peak, PeakCoordinateSystem};
use crate::{Error, Result};

/// Profiles whose integral is below this cannot be normalized.
const NORMALIZE_EPSILON: f64 = 1e-12;

pub type SharedShapeLibrary = Arc<RwLock<ShapeLibrary>>;

/// Space the profile grid is laid out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProfileFrame {
    /// Detector axes (x, y, frame) around the peak center.
    #[default]
    Detector,
    /// The peak's local divergence/mosaicity frame. Needs instrument geometry.
    PeakCoordinates,
}

/// Weighting of neighbouring entries when predicting a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    /// Plain average of the neighbours.
    None,
    /// Weight `1 / (1 + d)` with `d` the distance in index space.
    #[default]
    InverseDistance,
}

// ============================================================================
// Profile grid
// ============================================================================

/// Intensity profile sampled on `bins^3` cells covering
/// `[-half_extent, half_extent]^3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile3D {
    bins: usize,
    half_extent: f64,
    frame: ProfileFrame,
    data: Vec<f64>,
}

impl Profile3D {
    pub fn new(bins: usize, half_extent: f64, frame: ProfileFrame) -> Self {
        let bins = bins.max(1);
        Self {
            bins,
            half_extent,
            frame,
            data: vec![0.0; bins * bins * bins],
        }
    }

    /// Normalized standard 3D Gaussian, the prediction of last resort.
    pub fn gaussian(bins: usize, half_extent: f64, frame: ProfileFrame) -> Self {
        let mut profile = Self::new(bins, half_extent, frame);
        let n = profile.bins;
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let local = profile.cell_center(i, j, k);
                    profile.data[(k * n + j) * n + i] = (-0.5 * local.length_squared()).exp();
                }
            }
        }
        profile.normalize();
        profile
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn half_extent(&self) -> f64 {
        self.half_extent
    }

    pub fn frame(&self) -> ProfileFrame {
        self.frame
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn cell_width(&self) -> f64 {
        2.0 * self.half_extent / self.bins as f64
    }

    pub fn cell_volume(&self) -> f64 {
        self.cell_width().powi(3)
    }

    fn cell_center(&self, i: usize, j: usize, k: usize) -> DVec3 {
        let w = self.cell_width();
        DVec3::new(i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5) * w - DVec3::splat(self.half_extent)
    }

    fn cell_index(&self, local: DVec3) -> Option<usize> {
        let u = (local + DVec3::splat(self.half_extent)) / self.cell_width();
        if !u.is_finite() || u.min_element() < 0.0 {
            return None;
        }
        let n = self.bins;
        let (i, j, k) = (u.x as usize, u.y as usize, u.z as usize);
        if i >= n || j >= n || k >= n {
            return None;
        }
        Some((k * n + j) * n + i)
    }

    /// Profile whose cells hold the mean value of the samples falling in
    /// them. Cells without samples stay zero, so the grid should be no finer
    /// than the sample spacing.
    pub fn from_samples(
        bins: usize,
        half_extent: f64,
        frame: ProfileFrame,
        samples: impl IntoIterator<Item = (DVec3, f64)>,
    ) -> Self {
        let mut profile = Self::new(bins, half_extent, frame);
        let mut hits = vec![0u32; profile.data.len()];
        for (local, value) in samples {
            if let Some(index) = profile.cell_index(local) {
                profile.data[index] += value;
                hits[index] += 1;
            }
        }
        for (v, &n) in profile.data.iter_mut().zip(hits.iter()) {
            if n > 1 {
                *v /= n as f64;
            }
        }
        profile
    }

    /// Accumulate `weight` in the cell containing `local`. Points outside
    /// the grid are ignored.
    pub fn add(&mut self, local: DVec3, weight: f64) {
        if let Some(index) = self.cell_index(local) {
            self.data[index] += weight;
        }
    }

    /// Value of the cell containing `local`, zero outside the grid.
    pub fn density(&self, local: DVec3) -> f64 {
        self.cell_index(local).map_or(0.0, |index| self.data[index])
    }

    /// `sum(data) * cell_volume`; 1 for a normalized profile.
    pub fn integral(&self) -> f64 {
        self.data.iter().sum::<f64>() * self.cell_volume()
    }

    /// Scale to unit integral. Returns `false`, leaving the profile
    /// unchanged, when the integral is not positive.
    pub fn normalize(&mut self) -> bool {
        let integral = self.integral();
        if !integral.is_finite() || integral <= NORMALIZE_EPSILON {
            return false;
        }
        for v in &mut self.data {
            *v /= integral;
        }
        true
    }

    pub fn is_compatible(&self, other: &Profile3D) -> bool {
        self.bins == other.bins && self.half_extent == other.half_extent && self.frame == other.frame
    }

    fn add_scaled(&mut self, other: &Profile3D, weight: f64) {
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += weight * b;
        }
    }

    fn scale(&mut self, factor: f64) {
        for v in &mut self.data {
            *v *= factor;
        }
    }
}

// ============================================================================
// Detector to profile mapping
// ============================================================================

/// Maps detector points of one peak into whitened profile coordinates.
pub(crate) struct ProfileMapping {
    center: DVec3,
    whitening: DMat3,
    pcs: Option<PeakCoordinateSystem>,
    voxel_volume: f64,
}

/// `C^-1/2` for a symmetric positive definite `C`.
fn inverse_sqrt(covariance: DMat3) -> Option<DMat3> {
    let (values, vectors) = symmetric_eigen(covariance);
    if values[2].is_nan() || values[2] <= 0.0 || !values[0].is_finite() {
        return None;
    }
    let inv = DVec3::from_array(values.map(|v| 1.0 / v.sqrt()));
    Some(vectors * DMat3::from_diagonal(inv) * vectors.transpose())
}

impl ProfileMapping {
    pub(crate) fn new(
        frame: ProfileFrame,
        shape: &Ellipsoid,
        geometry: Option<&Arc<dyn InstrumentGeometry>>,
    ) -> std::result::Result<Self, IntegrationFailure> {
        let collapsed = || IntegrationFailure::DegenerateGeometry(format!("peak shape {:?} is flat", shape.semi_axes));
        match frame {
            ProfileFrame::Detector => {
                let whitening = inverse_sqrt(shape.covariance()).ok_or_else(collapsed)?;
                Ok(Self {
                    center: shape.center,
                    voxel_volume: whitening.determinant().abs(),
                    whitening,
                    pcs: None,
                })
            }
            ProfileFrame::PeakCoordinates => {
                let geometry = geometry.ok_or_else(|| {
                    IntegrationFailure::DegenerateGeometry("dataset has no instrument geometry".into())
                })?;
                let pcs = PeakCoordinateSystem::new(Arc::clone(geometry), shape.center)
                    .map_err(|e| IntegrationFailure::DegenerateGeometry(e.to_string()))?;
                let j = pcs.jacobian();
                let whitening = inverse_sqrt(j * shape.covariance() * j.transpose()).ok_or_else(collapsed)?;
                Ok(Self {
                    center: shape.center,
                    voxel_volume: (whitening * j).determinant().abs(),
                    whitening,
                    pcs: Some(pcs),
                })
            }
        }
    }

    pub(crate) fn local(&self, p: DVec3) -> DVec3 {
        let relative = match &self.pcs {
            Some(pcs) => pcs.transform(p),
            None => p - self.center,
        };
        self.whitening * relative
    }

    /// Volume of one detector voxel in profile units.
    pub(crate) fn voxel_volume(&self) -> f64 {
        self.voxel_volume
    }
}

// ============================================================================
// Library
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeLibraryConfig {
    pub bins: usize,
    /// Grid half-width in standard deviations.
    pub half_extent: f64,
    pub frame: ProfileFrame,
    /// Entries averaged by [`ShapeLibrary::predict`].
    pub max_neighbors: usize,
    /// Entries farther away in index space are not used for prediction.
    pub max_index_distance: f64,
    pub interpolation: Interpolation,
    /// Peaks integrated with `I / sigma` below this are not added.
    pub min_strength: f64,
}

impl Default for ShapeLibraryConfig {
    fn default() -> Self {
        Self {
            bins: 12,
            half_extent: 4.0,
            frame: ProfileFrame::Detector,
            max_neighbors: 10,
            max_index_distance: 2.0,
            interpolation: Interpolation::InverseDistance,
            min_strength: 3.0,
        }
    }
}

impl ShapeLibraryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bins == 0 {
            return Err(Error::config("shape library needs at least one bin"));
        }
        if !(self.half_extent.is_finite() && self.half_extent > 0.0) {
            return Err(Error::config(format!(
                "shape library half_extent must be positive, got {}",
                self.half_extent
            )));
        }
        if self.max_neighbors == 0 {
            return Err(Error::config("shape library max_neighbors must be positive"));
        }
        if !(self.max_index_distance >= 0.0) {
            return Err(Error::config(format!(
                "shape library max_index_distance must be non-negative, got {}",
                self.max_index_distance
            )));
        }
        if !self.min_strength.is_finite() {
            return Err(Error::config("shape library min_strength must be finite"));
        }
        Ok(())
    }
}

/// Sum of normalized observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LibraryEntry {
    sum: Profile3D,
    observations: usize,
}

impl LibraryEntry {
    fn mean(&self) -> Option<Profile3D> {
        if self.observations == 0 {
            return None;
        }
        let mut mean = self.sum.clone();
        mean.scale(1.0 / self.observations as f64);
        Some(mean)
    }
}

/// Averaged profiles keyed by Miller index, plus a default profile that
/// accumulates every observation.
///
/// Shared between integration runs as a [`SharedShapeLibrary`]; only one
/// writer may add peaks at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LibraryRepr", into = "LibraryRepr")]
pub struct ShapeLibrary {
    config: ShapeLibraryConfig,
    entries: HashMap<MillerIndex, LibraryEntry>,
    default: LibraryEntry,
}

/// Serialized form; JSON maps need string keys.
#[derive(Serialize, Deserialize)]
struct LibraryRepr {
    config: ShapeLibraryConfig,
    default: LibraryEntry,
    entries: Vec<(MillerIndex, LibraryEntry)>,
}

impl From<ShapeLibrary> for LibraryRepr {
    fn from(library: ShapeLibrary) -> Self {
        let mut entries: Vec<_> = library.entries.into_iter().collect();
        entries.sort_by_key(|(hkl, _)| *hkl);
        Self {
            config: library.config,
            default: library.default,
            entries,
        }
    }
}

impl TryFrom<LibraryRepr> for ShapeLibrary {
    type Error = Error;

    fn try_from(repr: LibraryRepr) -> Result<Self> {
        let mut library = ShapeLibrary::new(repr.config)?;
        let template = library.empty_profile();
        let compatible = |entry: &LibraryEntry| entry.sum.is_compatible(&template) && entry.sum.data.len() == template.data.len();
        if !compatible(&repr.default) || !repr.entries.iter().all(|(_, e)| compatible(e)) {
            return Err(Error::config("shape library profiles do not match its grid"));
        }
        library.default = repr.default;
        library.entries = repr.entries.into_iter().collect();
        Ok(library)
    }
}

impl ShapeLibrary {
    pub fn new(config: ShapeLibraryConfig) -> Result<Self> {
        config.validate()?;
        let empty = Profile3D::new(config.bins, config.half_extent, config.frame);
        Ok(Self {
            config,
            entries: HashMap::new(),
            default: LibraryEntry {
                sum: empty,
                observations: 0,
            },
        })
    }

    pub fn into_shared(self) -> SharedShapeLibrary {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &ShapeLibraryConfig {
        &self.config
    }

    /// Number of distinct Miller indices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn observations(&self, hkl: &MillerIndex) -> usize {
        self.entries.get(hkl).map_or(0, |e| e.observations)
    }

    pub fn total_observations(&self) -> usize {
        self.default.observations
    }

    pub fn indices(&self) -> Vec<MillerIndex> {
        let mut indices: Vec<_> = self.entries.keys().copied().collect();
        indices.sort();
        indices
    }

    /// Empty profile on this library's grid.
    pub fn empty_profile(&self) -> Profile3D {
        Profile3D::new(self.config.bins, self.config.half_extent, self.config.frame)
    }

    /// Average `profile` into the entry for `hkl` and into the default.
    ///
    /// Returns `false` if the profile is on a different grid or cannot be
    /// normalized.
    pub fn add_peak(&mut self, hkl: MillerIndex, profile: &Profile3D) -> bool {
        if !profile.is_compatible(&self.default.sum) {
            tracing::debug!(%hkl, "Profile grid does not match the library");
            return false;
        }
        let mut normalized = profile.clone();
        if !normalized.normalize() {
            return false;
        }

        let empty = self.empty_profile();
        let entry = self.entries.entry(hkl).or_insert_with(|| LibraryEntry {
            sum: empty,
            observations: 0,
        });
        entry.sum.add_scaled(&normalized, 1.0);
        entry.observations += 1;
        self.default.sum.add_scaled(&normalized, 1.0);
        self.default.observations += 1;
        true
    }

    /// Mean observed profile of exactly `hkl`.
    pub fn profile(&self, hkl: &MillerIndex) -> Option<Profile3D> {
        self.entries.get(hkl).and_then(LibraryEntry::mean)
    }

    /// Mean of all observations, or a unit Gaussian before any was added.
    pub fn default_profile(&self) -> Profile3D {
        self.default.mean().unwrap_or_else(|| {
            Profile3D::gaussian(self.config.bins, self.config.half_extent, self.config.frame)
        })
    }

    /// Profile expected for `hkl`: the weighted average of up to
    /// `max_neighbors` entries within `max_index_distance`, nearest first.
    /// Falls back to [`default_profile`](Self::default_profile).
    pub fn predict(&self, hkl: &MillerIndex) -> Profile3D {
        let mut neighbours: Vec<(f64, MillerIndex, &LibraryEntry)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.distance(hkl), *key, entry))
            .filter(|(d, _, _)| *d <= self.config.max_index_distance)
            .collect();
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        neighbours.truncate(self.config.max_neighbors);

        let mut prediction = self.empty_profile();
        let mut total_weight = 0.0;
        for (distance, _, entry) in &neighbours {
            let Some(mean) = entry.mean() else { continue };
            let weight = match self.config.interpolation {
                Interpolation::None => 1.0,
                Interpolation::InverseDistance => 1.0 / (1.0 + distance),
            };
            prediction.add_scaled(&mean, weight);
            total_weight += weight;
        }

        if total_weight > 0.0 {
            prediction.scale(1.0 / total_weight);
            prediction
        } else {
            self.default_profile()
        }
    }
}

// ============================================================================
// Integrator
// ============================================================================

/// Least-squares scale of the predicted profile to the background-subtracted
/// peak counts. Strong peaks with a Miller index are added to the library.
#[derive(Debug, Clone)]
pub struct ShapeLibraryIntegrator {
    library: SharedShapeLibrary,
}

impl ShapeLibraryIntegrator {
    pub fn new(library: SharedShapeLibrary) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &SharedShapeLibrary {
        &self.library
    }
}

impl PeakIntegrator for ShapeLibraryIntegrator {
    fn name(&self) -> &'static str {
        "shape_library"
    }

    fn compute(
        &self,
        peak: &Peak,
        region: &IntegrationRegion,
        data: &PeakData,
    ) -> std::result::Result<IntegrationOutcome, IntegrationFailure> {
        let background = data.mean_background().ok_or(IntegrationFailure::NoBackground)?;
        let b = background.mean;

        let (frame, min_strength, predicted) = {
            let library = self.library.read();
            let predicted = match &peak.miller_index {
                Some(hkl) => library.predict(hkl),
                None => library.default_profile(),
            };
            (library.config().frame, library.config().min_strength, predicted)
        };
        let mapping = ProfileMapping::new(frame, region.shape(), data.geometry.as_ref())?;
        let voxel = mapping.voxel_volume();

        // Counts are modelled as I * w with w the predicted fraction in the
        // voxel; I = sum(w s) / sum(w^2), var(I) = sum(w^2 var(s)) / sum(w^2)^2.
        let (mut sum_ws, mut sum_ww, mut sum_var) = (0.0, 0.0, 0.0);
        let mut samples = Vec::new();
        for pixel in data.peak_pixels() {
            let local = mapping.local(pixel.position);
            let w = predicted.density(local) * voxel;
            let signal = pixel.counts - b.value;
            sum_ws += w * signal;
            sum_ww += w * w;
            sum_var += w * w * (pixel.counts.max(0.0) + b.variance);
            samples.push((local, signal));
        }
        let pixels = samples.len();
        if pixels == 0 {
            return Err(IntegrationFailure::NoPeakPixels);
        }
        if !(sum_ww > 0.0 && sum_ww.is_finite()) {
            return Err(IntegrationFailure::EmptyProfile);
        }

        let intensity = Intensity::new(sum_ws / sum_ww, sum_var / (sum_ww * sum_ww));

        if let Some(hkl) = peak.miller_index {
            if intensity.strength() >= min_strength {
                let observed = Profile3D::from_samples(predicted.bins, predicted.half_extent, predicted.frame, samples);
                if !self.library.write().add_peak(hkl, &observed) {
                    tracing::debug!(%hkl, "Observed profile could not be normalized");
                }
            }
        }

        Ok(IntegrationOutcome {
            intensity,
            mean_background: Some(b),
            ..Default::default()
        })
    }

    fn is_parallel_safe(&self) -> bool {
        false
    }
}
