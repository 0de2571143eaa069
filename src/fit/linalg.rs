//! Symmetric positive-definite solves for the normal equations.
//!
//! Cholesky factorization with explicit failure on non-positive-definite
//! input; a failed factorization is how collinear design columns
//! surface, and the caller turns it into a per-cell NaN result.

use ndarray::{Array1, Array2};

/// Cholesky factor `L` with `A = L Lᵀ`, or `None` when `A` is not
/// positive definite (singular or collinear normal equations).
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n == 0 || a.ncols() != n {
        return None;
    }
    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solve `A x = b` for symmetric positive definite `A` via an already
/// computed Cholesky factor.
fn solve_with_factor(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();

    // Forward substitution: L y = b.
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * y[j];
        }
        y[i] = sum / l[[i, i]];
    }

    // Backward substitution: Lᵀ x = y.
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solve `A x = b` for symmetric positive definite `A`.
pub fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let l = cholesky(a)?;
    Some(solve_with_factor(&l, b))
}

/// Full inverse of a symmetric positive definite matrix, column by
/// column through the Cholesky factor.
pub fn inv_spd(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let l = cholesky(a)?;
    let mut inv = Array2::zeros((n, n));
    let mut unit = Array1::zeros(n);
    for col in 0..n {
        unit.fill(0.0);
        unit[col] = 1.0;
        let x = solve_with_factor(&l, &unit);
        inv.column_mut(col).assign(&x);
    }
    Some(inv)
}
