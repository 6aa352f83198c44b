use super::*;

use std::sync::Arc;

use glam::DMat3;

use crate::error::IntegrationFailure;
use crate::testing::FlatDetector;
use crate::Error;

fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() < tol, "{a} vs {b} (tol {tol})");
}

// ============================================================================
// Peak and intensity
// ============================================================================

#[test]
fn test_intensity_arithmetic() {
    let a = Intensity::new(100.0, 100.0);
    let b = Intensity::new(30.0, 44.0);
    assert_eq!(a + b, Intensity::new(130.0, 144.0));
    assert_eq!(a - b, Intensity::new(70.0, 144.0));
    assert_eq!(a.sigma(), 10.0);
    assert_eq!(a.strength(), 10.0);
    assert_eq!(Intensity::new(5.0, 0.0).strength(), 0.0);
}

#[test]
fn test_reject_keeps_first_flag_and_disables() {
    let mut peak = Peak::new(crate::frame::DatasetId(1), Ellipsoid::sphere(DVec3::ZERO, 1.0));
    assert!(peak.is_usable());
    peak.reject(RejectionFlag::OutsideDetector);
    peak.reject(RejectionFlag::Masked);
    assert_eq!(peak.rejection, Some(RejectionFlag::OutsideDetector));
    assert!(peak.masked);
    assert!(!peak.enabled);
    assert!(!peak.is_usable());
}

#[test]
fn test_peak_failure_accessor() {
    let mut peak = Peak::new(crate::frame::DatasetId(1), Ellipsoid::sphere(DVec3::ZERO, 1.0));
    assert!(peak.failure().is_none());
    peak.status = IntegrationStatus::Failed(IntegrationFailure::NoBackground);
    assert_eq!(peak.failure(), Some(&IntegrationFailure::NoBackground));
    assert!(!peak.is_integrated());
}

#[test]
fn test_miller_index_distance_and_display() {
    let a = MillerIndex(1, 2, 3);
    let b = MillerIndex(1, 0, 3);
    assert_eq!(a.distance(&b), 2.0);
    assert_eq!(a.to_string(), "(1 2 3)");
}

// ============================================================================
// Integration region
// ============================================================================

#[test]
fn test_region_classification() {
    let shape = Ellipsoid::new(DVec3::ZERO, DVec3::new(2.0, 1.0, 1.0), DMat3::IDENTITY);
    let region = IntegrationRegion::new(shape, 3.0, 4.0, 6.0).expect("valid region");
    assert_eq!(region.classify(DVec3::ZERO), RegionType::Peak);
    assert_eq!(region.classify(DVec3::new(6.0, 0.0, 0.0)), RegionType::Peak);
    assert_eq!(region.classify(DVec3::new(0.0, 3.5, 0.0)), RegionType::Neither);
    assert_eq!(region.classify(DVec3::new(0.0, 5.0, 0.0)), RegionType::Background);
    assert_eq!(region.classify(DVec3::new(10.0, 0.0, 0.0)), RegionType::Background);
    assert_eq!(region.classify(DVec3::new(0.0, 0.0, 6.5)), RegionType::Neither);
    assert_eq!(region.aabb().upper, DVec3::new(12.0, 6.0, 6.0));
    assert_eq!(region.peak_aabb().upper, DVec3::new(6.0, 3.0, 3.0));
}

#[test]
fn test_region_rejects_bad_scales() {
    let shape = Ellipsoid::sphere(DVec3::ZERO, 1.0);
    for (p, b0, b1) in [(0.0, 1.0, 2.0), (3.0, 2.0, 4.0), (1.0, 3.0, 3.0), (f64::NAN, 1.0, 2.0)] {
        assert!(
            matches!(IntegrationRegion::new(shape, p, b0, b1), Err(Error::Configuration(_))),
            "scales {p} {b0} {b1}"
        );
    }
    assert!(IntegrationRegion::new(shape, 2.0, 2.0, 3.0).is_ok());
}

#[test]
fn test_region_rejects_collapsed_shape() {
    let flat = Ellipsoid::new(DVec3::ZERO, DVec3::new(1.0, 1.0, 0.0), DMat3::IDENTITY);
    assert!(matches!(
        IntegrationRegion::new(flat, 1.0, 2.0, 3.0),
        Err(Error::DegenerateGeometry(_))
    ));
}

// ============================================================================
// Peak coordinate system
// ============================================================================

fn detector() -> Arc<FlatDetector> {
    Arc::new(FlatDetector::default())
}

#[test]
fn test_center_maps_to_origin() {
    let pcs = PeakCoordinateSystem::new(detector(), DVec3::new(25.0, 25.0, 15.0)).expect("pcs");
    assert!(pcs.transform(DVec3::new(25.0, 25.0, 15.0)).length() < 1e-15);
    assert!(pcs.transform(DVec3::new(26.0, 25.0, 15.0)).length() > 0.0);
    assert!(pcs.scale() > 0.0);
}

#[test]
fn test_out_of_plane_motion_maps_to_first_axis() {
    // The beam runs along z and the peak sits in the xz-plane, so the
    // scattering plane normal is the y axis: detector rows move along e1.
    let pcs = PeakCoordinateSystem::new(detector(), DVec3::new(25.0, 25.0, 15.0)).expect("pcs");
    let j = pcs.jacobian();
    assert!(j.y_axis.x.abs() > 1e3 * j.y_axis.y.abs().max(j.y_axis.z.abs()));
    assert!(j.x_axis.x.abs() < 1e-3 * j.x_axis.length());
    assert!(pcs.voxel_volume() > 0.0);
}

#[test]
fn test_detector_shape_and_estimate_are_consistent() {
    let pcs = PeakCoordinateSystem::new(detector(), DVec3::new(30.0, 20.0, 10.0)).expect("pcs");
    let (sigma_d, sigma_m) = (2e-3, 5e-3);
    let shape = pcs.detector_shape(sigma_d, sigma_m).expect("shape");
    assert_eq!(shape.center, DVec3::new(30.0, 20.0, 10.0));
    assert!(shape.semi_axes.min_element() > 0.0);
    let (d, m) = pcs.estimate_divergence_mosaicity(&shape).expect("estimate");
    assert_close(d, sigma_d, 1e-8);
    assert_close(m, sigma_m, 1e-8);
}

#[test]
fn test_larger_mosaicity_spreads_over_more_frames() {
    let pcs = PeakCoordinateSystem::new(detector(), DVec3::new(30.0, 20.0, 10.0)).expect("pcs");
    let narrow = pcs.detector_shape(2e-3, 1e-3).expect("shape").aabb();
    let wide = pcs.detector_shape(2e-3, 4e-3).expect("shape").aabb();
    assert!(wide.extents().z > narrow.extents().z * 2.0);
}

#[test]
fn test_collinear_beams_are_degenerate() {
    let geometry = detector();
    let on_beam = DVec3::new(geometry.beam_col, geometry.beam_row, 3.0);
    assert!(matches!(
        PeakCoordinateSystem::new(geometry, on_beam),
        Err(Error::DegenerateGeometry(_))
    ));
}

#[test]
fn test_still_crystal_has_singular_jacobian() {
    let geometry = Arc::new(FlatDetector {
        step: 0.0,
        ..FlatDetector::default()
    });
    let pcs = PeakCoordinateSystem::new(geometry, DVec3::new(25.0, 25.0, 15.0)).expect("pcs");
    assert!(matches!(
        pcs.detector_shape(1e-3, 1e-3),
        Err(Error::DegenerateGeometry(_))
    ));
}
