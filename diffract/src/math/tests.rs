use super::*;

#[test]
fn test_erf_known_values() {
    // Reference values from Abramowitz & Stegun table 7.1.
    let cases = [
        (0.0, 0.0),
        (0.5, 0.520_499_877_813_046_5),
        (1.0, 0.842_700_792_949_714_9),
        (2.0, 0.995_322_265_018_952_7),
        (3.0, 0.999_977_909_503_001_4),
    ];
    for (x, expected) in cases {
        let got = erf(x);
        assert!(
            (got - expected).abs() < 1e-14,
            "erf({x}) = {got}, expected {expected}"
        );
        assert!((erf(-x) + expected).abs() < 1e-14, "erf must be odd");
    }
}

#[test]
fn test_erf_saturates() {
    assert_eq!(erf(7.0), 1.0);
    assert_eq!(erf(-12.0), -1.0);
    assert!(erf(f64::NAN).is_nan());
}

#[test]
fn test_erf_inv_domain() {
    assert_eq!(erf_inv(0.0), 0.0);
    assert_eq!(erf_inv(1.0), f64::INFINITY);
    assert_eq!(erf_inv(-1.0), f64::NEG_INFINITY);
    assert!(erf_inv(1.5).is_nan());
    assert!(erf_inv(f64::NAN).is_nan());
}

#[test]
fn test_erf_inv_inverts_erf() {
    for i in -30..=30 {
        let x = i as f64 * 0.1;
        let y = erf(x);
        if y.abs() >= 1.0 - 1e-12 {
            continue;
        }
        let back = erf_inv(y);
        assert!(
            (back - x).abs() < 1e-9,
            "erf_inv(erf({x})) = {back}"
        );
    }
}

#[test]
fn test_one_sigma_confidence() {
    let z = confidence_to_z(0.8413);
    assert!((z - 1.0).abs() < 1e-3, "z for 0.8413 was {z}");
    assert!((z_to_confidence(1.0) - 0.841_344_746_068_543).abs() < 1e-12);
}

#[test]
fn test_confidence_and_z_are_mutual_inverses() {
    let mut c = 0.01;
    while c <= 0.999 {
        let z = confidence_to_z(c);
        let back = z_to_confidence(z);
        assert!(
            (back - c).abs() < 1e-6,
            "confidence {c} -> z {z} -> {back}"
        );
        let z_back = confidence_to_z(z_to_confidence(z));
        assert!((z_back - z).abs() < 1e-6, "z {z} round trip gave {z_back}");
        c += 0.001;
    }
}

#[test]
fn test_confidence_symmetry() {
    assert!(confidence_to_z(0.5).abs() < 1e-15);
    let z = confidence_to_z(0.975);
    assert!((z - 1.959_963_984_540_054).abs() < 1e-9);
    assert!((confidence_to_z(0.025) + z).abs() < 1e-9);
}

#[test]
fn test_symmetric_eigen_diagonal() {
    let m = DMat3::from_diagonal(DVec3::new(1.0, 9.0, 4.0));
    let (values, vectors) = symmetric_eigen(m);
    for (got, expected) in values.iter().zip([9.0, 4.0, 1.0]) {
        assert!((got - expected).abs() < 1e-12, "eigenvalue {got}, expected {expected}");
    }
    assert!((vectors.determinant() - 1.0).abs() < 1e-12);
    assert!(vectors.x_axis.y.abs() > 0.999_999);
}

#[test]
fn test_symmetric_eigen_reconstructs() {
    let m = DMat3::from_cols(
        DVec3::new(4.0, 1.0, 0.5),
        DVec3::new(1.0, 3.0, -0.2),
        DVec3::new(0.5, -0.2, 2.0),
    );
    let (values, vectors) = symmetric_eigen(m);
    assert!(values[0] >= values[1] && values[1] >= values[2]);
    let rebuilt = vectors * DMat3::from_diagonal(DVec3::from_array(values)) * vectors.transpose();
    for (a, b) in rebuilt
        .to_cols_array()
        .iter()
        .zip(m.to_cols_array().iter())
    {
        assert!((a - b).abs() < 1e-10, "rebuilt {a} vs {b}");
    }
}

#[test]
fn test_try_inverse_singular() {
    let singular = DMat3::from_cols(DVec3::X, DVec3::X, DVec3::Z);
    assert!(try_inverse(singular, 1e-12).is_none());
    let inv = try_inverse(DMat3::from_diagonal(DVec3::splat(2.0)), 1e-12).expect("regular");
    assert!((inv.x_axis.x - 0.5).abs() < 1e-15);
}

#[test]
fn test_outer_product() {
    let m = outer(DVec3::new(1.0, 2.0, 3.0), DVec3::new(4.0, 5.0, 6.0));
    // Column j is a * b[j]; row 1, column 2 is 2 * 6.
    assert_eq!(m.z_axis.y, 12.0);
    assert_eq!(m.x_axis.z, 12.0);
}
