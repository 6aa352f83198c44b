//! Numeric helpers: error function and its inverse, confidence/z-score
//! conversion, symmetric eigendecomposition and small dense solvers.

pub(crate) mod linear_solver;

#[cfg(test)]
mod tests;

use glam::{DMat3, DVec3};
use nalgebra::{Matrix3, SymmetricEigen};

use std::f64::consts::{PI, SQRT_2};

/// `2 / sqrt(pi)`.
const TWO_OVER_SQRT_PI: f64 = 1.128_379_167_095_512_6;

/// Beyond this |x| the error function equals ±1 in double precision.
const ERF_SATURATION: f64 = 6.0;

const ERF_SERIES_MAX_TERMS: usize = 400;

// ============================================================================
// Error function
// ============================================================================

/// Error function.
///
/// Uses the everywhere-convergent series
/// `erf(x) = 2/sqrt(pi) * exp(-x^2) * sum_n 2^n x^(2n+1) / (2n+1)!!`,
/// whose terms are all positive so there is no cancellation.
pub fn erf(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x.abs() > ERF_SATURATION {
        return x.signum();
    }

    let x2 = x * x;
    let mut term = x;
    let mut sum = x;
    for n in 1..ERF_SERIES_MAX_TERMS {
        term *= 2.0 * x2 / (2 * n + 1) as f64;
        sum += term;
        if term.abs() <= sum.abs() * 1e-17 {
            break;
        }
    }

    (TWO_OVER_SQRT_PI * (-x2).exp() * sum).clamp(-1.0, 1.0)
}

/// Inverse error function on `[-1, 1]`.
///
/// Returns `±inf` at `±1` and NaN outside the domain. A polynomial initial
/// guess (Giles, 2010) is polished with Newton steps against [`erf`].
pub fn erf_inv(y: f64) -> f64 {
    if y.is_nan() || y.abs() > 1.0 {
        return f64::NAN;
    }
    if y == 1.0 {
        return f64::INFINITY;
    }
    if y == -1.0 {
        return f64::NEG_INFINITY;
    }

    let mut x = erf_inv_initial(y);
    for _ in 0..3 {
        let slope = TWO_OVER_SQRT_PI * (-x * x).exp();
        if slope <= f64::MIN_POSITIVE {
            break;
        }
        let step = (erf(x) - y) / slope;
        x -= step;
        if step.abs() <= 1e-15 * x.abs().max(1.0) {
            break;
        }
    }
    x
}

fn erf_inv_initial(y: f64) -> f64 {
    let mut w = -((1.0 - y) * (1.0 + y)).ln();
    let p = if w < 5.0 {
        w -= 2.5;
        let mut p = 2.810_226_36e-08;
        p = 3.432_739_39e-07 + p * w;
        p = -3.523_387_7e-06 + p * w;
        p = -4.391_506_54e-06 + p * w;
        p = 0.000_218_580_87 + p * w;
        p = -0.001_253_725_03 + p * w;
        p = -0.004_177_681_64 + p * w;
        p = 0.246_640_727 + p * w;
        1.501_409_41 + p * w
    } else {
        w = w.sqrt() - 3.0;
        let mut p = -0.000_200_214_257;
        p = 0.000_100_950_558 + p * w;
        p = 0.001_349_343_22 + p * w;
        p = -0.003_673_428_44 + p * w;
        p = 0.005_739_507_73 + p * w;
        p = -0.007_622_461_3 + p * w;
        p = 0.009_438_870_47 + p * w;
        p = 1.001_674_06 + p * w;
        2.832_976_82 + p * w
    };
    p * y
}

// ============================================================================
// Confidence <-> z-score
// ============================================================================

/// One-sided normal quantile: the z such that `P(Z <= z) = confidence`.
///
/// `confidence` must lie in the open interval `(0, 1)`; callers validate
/// configuration before converting.
pub fn confidence_to_z(confidence: f64) -> f64 {
    SQRT_2 * erf_inv(2.0 * confidence - 1.0)
}

/// Standard normal CDF, inverse of [`confidence_to_z`].
pub fn z_to_confidence(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// `(2*pi)^(3/2)`, the volume factor of a unit 3D Gaussian.
pub fn gaussian_volume_factor_3d() -> f64 {
    (2.0 * PI).powf(1.5)
}

// ============================================================================
// Linear algebra
// ============================================================================

/// Eigendecomposition of a symmetric 3x3 matrix.
///
/// Returns eigenvalues in descending order and the matching unit eigenvectors
/// as the columns of the returned matrix (a proper rotation, det = +1).
pub fn symmetric_eigen(m: DMat3) -> ([f64; 3], DMat3) {
    let c = m.to_cols_array_2d();
    // glam is column-major; Matrix3::new takes row-major arguments.
    let na = Matrix3::new(
        c[0][0], c[1][0], c[2][0], //
        c[0][1], c[1][1], c[2][1], //
        c[0][2], c[1][2], c[2][2],
    );
    let eigen = SymmetricEigen::new(na);

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values = order.map(|i| eigen.eigenvalues[i]);
    let vector = |i: usize| {
        let v = eigen.eigenvectors.column(i);
        DVec3::new(v[0], v[1], v[2])
    };
    let v0 = vector(order[0]);
    let v1 = vector(order[1]);
    let mut v2 = vector(order[2]);
    if v0.cross(v1).dot(v2) < 0.0 {
        v2 = -v2;
    }

    (values, DMat3::from_cols(v0, v1, v2))
}

/// Inverse of a 3x3 matrix, or `None` when `|det|` is below `min_det`.
pub fn try_inverse(m: DMat3, min_det: f64) -> Option<DMat3> {
    let det = m.determinant();
    if !det.is_finite() || det.abs() < min_det {
        return None;
    }
    Some(m.inverse())
}

/// Outer product `a * b^T`.
pub fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}
