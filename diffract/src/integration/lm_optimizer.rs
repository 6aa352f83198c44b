//! Levenberg-Marquardt optimizer for profile fitting over 3D voxels.

use glam::DVec3;

use crate::math::linear_solver::{inverse_diagonal_element, solve};

#[derive(Debug, Clone)]
pub struct LMConfig {
    pub max_iterations: usize,
    /// Converged once every parameter step is below this, relative to
    /// `|param| + 1`.
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    /// Damping above which the optimizer gives up.
    pub max_lambda: f64,
}

impl Default for LMConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-8,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e12,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LMResult<const N: usize> {
    pub params: [f64; N],
    pub chi2: f64,
    pub converged: bool,
    pub iterations: usize,
    /// Undamped `J^T J` at the final parameters.
    pub hessian: [[f64; N]; N],
}

impl<const N: usize> LMResult<N> {
    /// Variance of parameter `k`, scaling `(J^T J)^-1` by the residual
    /// variance. `None` without spare degrees of freedom or for a singular
    /// Hessian.
    pub fn parameter_variance(&self, k: usize, points: usize) -> Option<f64> {
        if points <= N {
            return None;
        }
        let residual_variance = self.chi2 / (points - N) as f64;
        inverse_diagonal_element(&self.hessian, k).map(|v| v * residual_variance)
    }
}

pub trait LMModel<const N: usize> {
    fn evaluate(&self, p: DVec3, params: &[f64; N]) -> f64;

    fn jacobian_row(&self, p: DVec3, params: &[f64; N]) -> [f64; N];

    /// Apply parameter constraints after an update.
    fn constrain(&self, _params: &mut [f64; N]) {}
}

/// Minimize `sum (value - model(point))^2`.
pub fn optimize<const N: usize, M: LMModel<N>>(
    model: &M,
    points: &[DVec3],
    values: &[f64],
    initial_params: [f64; N],
    config: &LMConfig,
) -> LMResult<N> {
    debug_assert_eq!(points.len(), values.len());

    let mut params = initial_params;
    let mut lambda = config.initial_lambda;
    let mut prev_chi2 = compute_chi2(model, points, values, &params);
    let mut converged = false;
    let mut iterations = 0;

    // Exact fits stop on the residual floor rather than the step size.
    let chi2_floor = 1e-20 * values.iter().map(|v| v * v).sum::<f64>();

    let mut jacobian = Vec::with_capacity(points.len());
    let mut residuals = Vec::with_capacity(points.len());

    for iter in 0..config.max_iterations {
        iterations = iter + 1;
        if prev_chi2 <= chi2_floor {
            converged = true;
            break;
        }

        fill_jacobian_residuals(model, points, values, &params, &mut jacobian, &mut residuals);
        let (hessian, gradient) = compute_hessian_gradient(&jacobian, &residuals);

        let mut damped_hessian = hessian;
        for (i, row) in damped_hessian.iter_mut().enumerate() {
            row[i] *= 1.0 + lambda;
        }

        let Some(delta) = solve(&damped_hessian, &gradient) else {
            break;
        };

        let mut new_params = params;
        for (p, d) in new_params.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        model.constrain(&mut new_params);

        let new_chi2 = compute_chi2(model, points, values, &new_params);
        let small_step = delta
            .iter()
            .zip(params.iter())
            .all(|(d, p)| d.abs() <= config.convergence_threshold * (p.abs() + 1.0));

        if new_chi2 < prev_chi2 {
            params = new_params;
            lambda *= config.lambda_down;
            prev_chi2 = new_chi2;
            if small_step {
                converged = true;
                break;
            }
        } else {
            // No further descent and no room to move: at the minimum.
            if small_step {
                converged = true;
                break;
            }
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                break;
            }
        }
    }

    fill_jacobian_residuals(model, points, values, &params, &mut jacobian, &mut residuals);
    let (hessian, _) = compute_hessian_gradient(&jacobian, &residuals);

    LMResult {
        params,
        chi2: prev_chi2,
        converged,
        iterations,
        hessian,
    }
}

fn compute_chi2<const N: usize, M: LMModel<N>>(model: &M, points: &[DVec3], values: &[f64], params: &[f64; N]) -> f64 {
    points
        .iter()
        .zip(values.iter())
        .map(|(&p, &v)| {
            let residual = v - model.evaluate(p, params);
            residual * residual
        })
        .sum()
}

fn fill_jacobian_residuals<const N: usize, M: LMModel<N>>(
    model: &M,
    points: &[DVec3],
    values: &[f64],
    params: &[f64; N],
    jacobian: &mut Vec<[f64; N]>,
    residuals: &mut Vec<f64>,
) {
    jacobian.clear();
    residuals.clear();

    for (&p, &v) in points.iter().zip(values.iter()) {
        jacobian.push(model.jacobian_row(p, params));
        residuals.push(v - model.evaluate(p, params));
    }
}

/// `J^T J` and `J^T r`, filling the upper triangle and mirroring it.
#[allow(clippy::needless_range_loop)]
pub fn compute_hessian_gradient<const N: usize>(jacobian: &[[f64; N]], residuals: &[f64]) -> ([[f64; N]; N], [f64; N]) {
    let mut hessian = [[0.0f64; N]; N];
    let mut gradient = [0.0f64; N];

    for (row, &r) in jacobian.iter().zip(residuals.iter()) {
        for i in 0..N {
            gradient[i] += row[i] * r;
            for j in i..N {
                hessian[i][j] += row[i] * row[j];
            }
        }
    }

    for i in 1..N {
        for j in 0..i {
            hessian[i][j] = hessian[j][i];
        }
    }

    (hessian, gradient)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `a + b * x` along the x axis.
    struct Line;

    impl LMModel<2> for Line {
        fn evaluate(&self, p: DVec3, params: &[f64; 2]) -> f64 {
            params[0] + params[1] * p.x
        }

        fn jacobian_row(&self, p: DVec3, _params: &[f64; 2]) -> [f64; 2] {
            [1.0, p.x]
        }
    }

    /// `a * exp(-(x - c)^2 / 2)`.
    struct Bump;

    impl LMModel<2> for Bump {
        fn evaluate(&self, p: DVec3, params: &[f64; 2]) -> f64 {
            let d = p.x - params[1];
            params[0] * (-0.5 * d * d).exp()
        }

        fn jacobian_row(&self, p: DVec3, params: &[f64; 2]) -> [f64; 2] {
            let d = p.x - params[1];
            let e = (-0.5 * d * d).exp();
            [e, params[0] * e * d]
        }
    }

    fn axis_points(n: usize) -> Vec<DVec3> {
        (0..n).map(|i| DVec3::new(i as f64 * 0.5 - 5.0, 0.0, 0.0)).collect()
    }

    #[test]
    fn test_exact_line_converges() {
        let points = axis_points(21);
        let values: Vec<f64> = points.iter().map(|p| 3.0 - 2.0 * p.x).collect();
        let result = optimize(&Line, &points, &values, [0.0, 0.0], &LMConfig::default());
        assert!(result.converged);
        assert!((result.params[0] - 3.0).abs() < 1e-8);
        assert!((result.params[1] + 2.0).abs() < 1e-8);
    }

    #[test]
    fn test_nonlinear_bump() {
        let points = axis_points(41);
        let values: Vec<f64> = points
            .iter()
            .map(|p| Bump.evaluate(*p, &[7.0, 0.8]))
            .collect();
        let result = optimize(&Bump, &points, &values, [5.0, 0.0], &LMConfig::default());
        assert!(result.converged, "iterations: {}", result.iterations);
        assert!((result.params[0] - 7.0).abs() < 1e-6);
        assert!((result.params[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_parameter_variance_scales_with_noise() {
        let points = axis_points(21);
        // Alternating +-0.1 residuals around a flat line.
        let values: Vec<f64> = (0..21).map(|i| if i % 2 == 0 { 1.1 } else { 0.9 }).collect();
        let result = optimize(&Line, &points, &values, [0.0, 0.0], &LMConfig::default());
        let variance = result.parameter_variance(0, points.len()).expect("variance");
        assert!(variance > 0.0 && variance < 0.01, "variance {variance}");
        assert!(result.parameter_variance(0, 2).is_none());
    }

    #[test]
    fn test_hessian_is_symmetric() {
        let jacobian = [[1.0, 2.0, 3.0], [0.5, -1.0, 2.0]];
        let residuals = [1.0, 2.0];
        let (h, g) = compute_hessian_gradient(&jacobian, &residuals);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(h[i][j], h[j][i]);
            }
        }
        assert_eq!(g, [2.0, 0.0, 7.0]);
    }
}
