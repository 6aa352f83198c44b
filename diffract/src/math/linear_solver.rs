//! Gaussian elimination with partial pivoting for the small dense systems
//! that come up in Levenberg-Marquardt fitting.

const PIVOT_EPSILON: f64 = 1e-14;

/// Solve the NxN system `a * x = b`.
///
/// Returns `None` if the matrix is singular (pivot too small relative to the
/// largest entry).
#[allow(clippy::needless_range_loop)]
pub fn solve<const N: usize>(a: &[[f64; N]; N], b: &[f64; N]) -> Option<[f64; N]> {
    let mut matrix = *a;
    let mut rhs = *b;

    let scale = matrix
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let tolerance = scale * PIVOT_EPSILON;

    for col in 0..N {
        let mut max_row = col;
        let mut max_val = matrix[col][col].abs();
        for row in (col + 1)..N {
            if matrix[row][col].abs() > max_val {
                max_val = matrix[row][col].abs();
                max_row = row;
            }
        }

        if max_val < tolerance {
            return None;
        }

        if max_row != col {
            matrix.swap(col, max_row);
            rhs.swap(col, max_row);
        }

        for row in (col + 1)..N {
            let factor = matrix[row][col] / matrix[col][col];
            let pivot_row = matrix[col];
            for (j, m) in matrix[row].iter_mut().enumerate().skip(col) {
                *m -= factor * pivot_row[j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        let mut sum = rhs[i];
        for (j, &xj) in x.iter().enumerate().skip(i + 1) {
            sum -= matrix[i][j] * xj;
        }
        x[i] = sum / matrix[i][i];
    }

    Some(x)
}

/// Diagonal element `k` of `a^-1`, or `None` if `a` is singular.
pub fn inverse_diagonal_element<const N: usize>(a: &[[f64; N]; N], k: usize) -> Option<f64> {
    let mut unit = [0.0f64; N];
    unit[k] = 1.0;
    solve(a, &unit).map(|column| column[k])
}
