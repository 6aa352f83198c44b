use super::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn params(pairs: &[(&str, f64)]) -> KernelParams {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Reference circular correlation, O(n^2) per pixel.
fn direct_correlation(image: &[f64], kernel: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * cols];
    for y in 0..rows {
        for x in 0..cols {
            let mut acc = 0.0;
            for dy in 0..rows {
                for dx in 0..cols {
                    let w = kernel[dy * cols + dx];
                    if w != 0.0 {
                        acc += w * image[((y + dy) % rows) * cols + (x + dx) % cols];
                    }
                }
            }
            out[y * cols + x] = acc;
        }
    }
    out
}

fn random_image(rows: usize, cols: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * cols).map(|_| rng.random_range(0.0..100.0)).collect()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
    }
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_from_name_aliases() {
    let empty = KernelParams::new();
    assert_eq!(ConvolutionKernel::from_name("delta", &empty).unwrap(), ConvolutionKernel::Delta);
    assert_eq!(ConvolutionKernel::from_name("identity", &empty).unwrap(), ConvolutionKernel::Delta);
    assert_eq!(
        ConvolutionKernel::from_name("box", &empty).unwrap(),
        ConvolutionKernel::Constant { rows: 3, cols: 3 }
    );
    assert_eq!(
        ConvolutionKernel::from_name("constant", &params(&[("rows", 5.0)])).unwrap(),
        ConvolutionKernel::Constant { rows: 5, cols: 3 }
    );
}

#[test]
fn test_unknown_kernel_name() {
    let err = ConvolutionKernel::from_name("mexican_hat", &KernelParams::new()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("enhanced_annular"), "{err}");
}

#[test]
fn test_missing_required_parameter() {
    let err = ConvolutionKernel::from_name("gaussian", &params(&[("sigma_x", 2.0)])).unwrap_err();
    assert!(err.to_string().contains("'sigma'"), "{err}");
    assert!(ConvolutionKernel::from_name("annular", &params(&[("r1", 2.0)])).is_err());
    assert!(ConvolutionKernel::from_name("enhanced_annular", &params(&[("r1", 2.0), ("r2", 3.0)])).is_err());
}

#[test]
fn test_unknown_parameters_are_ignored() {
    let k = ConvolutionKernel::from_name("gaussian", &params(&[("sigma", 1.5), ("colour", 3.0)])).unwrap();
    assert_eq!(k, ConvolutionKernel::Gaussian { sigma_x: 1.5, sigma_y: 1.5 });
    let k = ConvolutionKernel::from_name("gaussian", &params(&[("sigma", 1.5), ("sigma_y", 0.5)])).unwrap();
    assert_eq!(k, ConvolutionKernel::Gaussian { sigma_x: 1.5, sigma_y: 0.5 });
}

#[test]
fn test_non_positive_sizes_rejected() {
    assert!(ConvolutionKernel::from_name("constant", &params(&[("rows", 0.0)])).is_err());
    assert!(ConvolutionKernel::from_name("constant", &params(&[("cols", 2.5)])).is_err());
    assert!(ConvolutionKernel::from_name("gaussian", &params(&[("sigma", 0.0)])).is_err());
    assert!(ConvolutionKernel::from_name("annular", &params(&[("r1", 4.0), ("r2", 3.0)])).is_err());
    assert!(ConvolutionKernel::from_name(
        "enhanced_annular",
        &params(&[("r1", 2.0), ("r2", 5.0), ("r3", 4.0)])
    )
    .is_err());
    assert!(ConvolutionKernel::Delta.produce(0, 4).is_err());
}

#[test]
fn test_kind_names_round_trip_through_registry() {
    assert_eq!(
        KernelKind::names(),
        vec!["delta", "constant", "gaussian", "annular", "enhanced_annular"]
    );
}

// ============================================================================
// Produced matrices
// ============================================================================

#[test]
fn test_normalized_kernels_sum_to_one() {
    let kernels = [
        ConvolutionKernel::Delta,
        ConvolutionKernel::Constant { rows: 3, cols: 5 },
        ConvolutionKernel::Gaussian { sigma_x: 1.5, sigma_y: 2.0 },
        ConvolutionKernel::Annular { r1: 2.0, r2: 4.0 },
    ];
    for kernel in kernels {
        let k = kernel.produce(32, 24).unwrap();
        let sum: f64 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12, "{kernel:?} sums to {sum}");
    }
}

#[test]
fn test_enhanced_annular_is_zero_sum() {
    let k = ConvolutionKernel::EnhancedAnnular { r1: 2.0, r2: 4.0, r3: 6.0 }
        .produce(32, 32)
        .unwrap();
    let sum: f64 = k.iter().sum();
    assert!(sum.abs() < 1e-12, "sum {sum}");
    assert!(k[0] > 0.0, "center belongs to the peak disc");
    // Guard ring between r1 and r2 is zero.
    assert_eq!(k[3], 0.0);
    // Offset 5 lies in the background annulus.
    assert!(k[5] < 0.0);
}

#[test]
fn test_annular_excludes_center() {
    let k = ConvolutionKernel::Annular { r1: 2.0, r2: 3.0 }.produce(16, 16).unwrap();
    assert_eq!(k[0], 0.0);
    assert!(k[2] > 0.0);
    assert_eq!(k[4], 0.0);
    // Negative offset -2 wraps to column 14.
    assert_eq!(k[14], k[2]);
}

#[test]
fn test_box_kernel_wraps_negative_offsets() {
    let k = ConvolutionKernel::Constant { rows: 3, cols: 3 }.produce(8, 8).unwrap();
    let w = 1.0 / 9.0;
    for (i, j) in [(0, 0), (0, 1), (0, 7), (7, 0), (7, 7), (1, 1)] {
        assert!((k[i * 8 + j] - w).abs() < 1e-15, "({i}, {j})");
    }
    assert_eq!(k[2], 0.0);
    assert!(ConvolutionKernel::Constant { rows: 9, cols: 3 }.produce(8, 8).is_err());
}

#[test]
fn test_half_size() {
    assert_eq!(ConvolutionKernel::Delta.half_size(), 0);
    assert_eq!(ConvolutionKernel::Constant { rows: 5, cols: 3 }.half_size(), 2);
    assert_eq!(ConvolutionKernel::Gaussian { sigma_x: 1.2, sigma_y: 0.5 }.half_size(), 4);
    assert_eq!(ConvolutionKernel::EnhancedAnnular { r1: 5.0, r2: 10.0, r3: 15.0 }.half_size(), 15);
}

// ============================================================================
// Convolver
// ============================================================================

#[test]
fn test_delta_is_identity() {
    let image = random_image(7, 9, 1);
    let convolver = Convolver::new(ConvolutionKernel::Delta).unwrap();
    assert_eq!(convolver.apply_values(7, 9, &image).unwrap(), image);
}

#[test]
fn test_fft_matches_direct_correlation() {
    let (rows, cols) = (18, 13);
    let image = random_image(rows, cols, 42);
    let kernels = [
        ConvolutionKernel::Constant { rows: 3, cols: 5 },
        ConvolutionKernel::Gaussian { sigma_x: 1.0, sigma_y: 2.0 },
        ConvolutionKernel::Annular { r1: 1.0, r2: 3.0 },
        ConvolutionKernel::EnhancedAnnular { r1: 1.0, r2: 2.0, r3: 4.0 },
    ];
    for kernel in kernels {
        let matrix = kernel.produce(rows, cols).unwrap();
        let expected = direct_correlation(&image, &matrix, rows, cols);
        let got = Convolver::new(kernel.clone()).unwrap().apply_values(rows, cols, &image).unwrap();
        assert_close(&got, &expected, 1e-9);
    }
}

#[test]
fn test_box_filter_of_constant_image_is_constant() {
    let image = vec![5.0; 10 * 10];
    let convolver = Convolver::new(ConvolutionKernel::Constant { rows: 3, cols: 3 }).unwrap();
    let out = convolver.apply_values(10, 10, &image).unwrap();
    assert_close(&out, &image, 1e-10);
}

#[test]
fn test_enhanced_annular_removes_flat_background() {
    let mut image = vec![20.0; 32 * 32];
    image[16 * 32 + 16] += 100.0;
    let convolver =
        Convolver::new(ConvolutionKernel::EnhancedAnnular { r1: 1.0, r2: 3.0, r3: 6.0 }).unwrap();
    let out = convolver.apply_values(32, 32, &image).unwrap();
    // Far from the spike the filtered value is ~0; at the spike it is the
    // spike spread over the 5-pixel disc.
    assert!(out[2 * 32 + 2].abs() < 1e-9);
    assert!((out[16 * 32 + 16] - 20.0).abs() < 1e-9, "got {}", out[16 * 32 + 16]);
}

#[test]
fn test_shape_plan_is_cached() {
    let convolver = Convolver::new(ConvolutionKernel::Gaussian { sigma_x: 1.0, sigma_y: 1.0 }).unwrap();
    let image = random_image(8, 8, 3);
    let a = convolver.apply_values(8, 8, &image).unwrap();
    let b = convolver.apply_values(8, 8, &image).unwrap();
    assert_eq!(a, b);
    assert_eq!(convolver.cached_shapes(), 1);
    convolver.apply_values(4, 8, &image[..32]).unwrap();
    assert_eq!(convolver.cached_shapes(), 2);
}

#[test]
fn test_wrong_length_is_rejected() {
    let convolver = Convolver::new(ConvolutionKernel::Delta).unwrap();
    assert!(matches!(
        convolver.apply_values(3, 3, &[0.0; 8]),
        Err(Error::FrameShape { .. })
    ));
}
