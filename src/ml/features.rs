//! Vectorized symmetric form of connectivity matrices

#[cfg(test)]
use crate::structs::{FcError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2};
use std::f64::consts::SQRT_2;

/// Upper triangle (diagonal included), row-major
///
/// With `isometric`, off-diagonal entries are scaled by √2 so that the Euclidean norm
/// of the vector equals the Frobenius norm of the matrix.
#[must_use]
pub fn sym_to_vec(m: &ArrayView2<'_, f64>, isometric: bool) -> Array1<f64> {
    let n = m.nrows();
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for i in 0..n {
        for j in i..n {
            let v = m[[i, j]];
            out.push(if isometric && i != j { v * SQRT_2 } else { v });
        }
    }
    Array1::from(out)
}

/// Rebuild the full symmetric matrix from [`sym_to_vec`] output
///
/// # Errors
/// Returns error if the length is not a triangular number
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[cfg(test)]
pub fn vec_to_sym(v: &Array1<f64>, isometric: bool) -> Result<Array2<f64>> {
    let len = v.len();
    // n (n + 1) / 2 = len
    let n = ((((8 * len + 1) as f64).sqrt() - 1.0) / 2.0).round() as usize;
    if n * (n + 1) / 2 != len {
        return Err(FcError::Shape(format!(
            "vector of length {len} is not the upper triangle of a square matrix"
        )));
    }

    let mut m = Array2::zeros((n, n));
    let mut values = v.iter();
    for i in 0..n {
        for j in i..n {
            let Some(&value) = values.next() else {
                break;
            };
            let value = if isometric && i != j { value / SQRT_2 } else { value };
            m[[i, j]] = value;
            m[[j, i]] = value;
        }
    }
    Ok(m)
}

/// One isometric feature row per subject matrix
#[must_use]
pub fn vectorize(matrices: &Array3<f64>) -> Array2<f64> {
    let (n, r, _) = matrices.dim();
    let mut features = Array2::zeros((n, r * (r + 1) / 2));
    for (mut row, m) in features.outer_iter_mut().zip(matrices.outer_iter()) {
        row.assign(&sym_to_vec(&m, true));
    }
    features
}
