//! Functions of symmetric matrices through eigen-decomposition

use crate::structs::{FcError, Result};
use linfa_linalg::eigh::Eigh;
use ndarray::{Array1, Array2, Axis};

/// Eigen-decomposition of the symmetric part of `m`; eigenvectors are columns
///
/// # Errors
/// Returns error if `m` is not square or the decomposition fails
pub fn sym_eig(m: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    if m.nrows() != m.ncols() {
        return Err(FcError::Shape(format!(
            "expected a square matrix, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    let sym = (m + &m.t()) * 0.5;
    Ok(sym.eigh()?)
}

/// `V diag(f(λ)) Vᵀ` for a symmetric matrix `m = V diag(λ) Vᵀ`
fn from_eig(vals: &Array1<f64>, vecs: &Array2<f64>, f: impl Fn(f64) -> f64) -> Array2<f64> {
    let scaled = vecs * &vals.mapv(f);
    scaled.dot(&vecs.t())
}

/// Apply `f` to the eigenvalues of a symmetric matrix
///
/// # Errors
/// Returns error if the decomposition fails
pub fn map_eigenvalues(m: &Array2<f64>, f: impl Fn(f64) -> f64) -> Result<Array2<f64>> {
    let (vals, vecs) = sym_eig(m)?;
    Ok(from_eig(&vals, &vecs, f))
}

fn positive_definite(m: &Array2<f64>, what: &str) -> Result<(Array1<f64>, Array2<f64>)> {
    let (vals, vecs) = sym_eig(m)?;
    if let Some(&min) = vals.iter().min_by(|a, b| a.total_cmp(b)) {
        if min <= 0.0 || !min.is_finite() {
            return Err(FcError::Linalg(format!(
                "{what} needs a positive definite matrix, smallest eigenvalue is {min:e}"
            )));
        }
    }
    Ok((vals, vecs))
}

/// Inverse of a symmetric positive definite matrix
///
/// # Errors
/// Returns error if `m` is not positive definite
pub fn spd_inverse(m: &Array2<f64>) -> Result<Array2<f64>> {
    let (vals, vecs) = positive_definite(m, "inverse")?;
    Ok(from_eig(&vals, &vecs, f64::recip))
}

/// Principal square root of a symmetric positive definite matrix
///
/// # Errors
/// Returns error if `m` is not positive definite
pub fn spd_sqrt(m: &Array2<f64>) -> Result<Array2<f64>> {
    let (vals, vecs) = positive_definite(m, "square root")?;
    Ok(from_eig(&vals, &vecs, f64::sqrt))
}

/// Inverse principal square root of a symmetric positive definite matrix
///
/// # Errors
/// Returns error if `m` is not positive definite
pub fn spd_inv_sqrt(m: &Array2<f64>) -> Result<Array2<f64>> {
    let (vals, vecs) = positive_definite(m, "inverse square root")?;
    Ok(from_eig(&vals, &vecs, |v| v.sqrt().recip()))
}

/// Matrix logarithm of a symmetric positive definite matrix
///
/// # Errors
/// Returns error if `m` is not positive definite
pub fn spd_log(m: &Array2<f64>) -> Result<Array2<f64>> {
    let (vals, vecs) = positive_definite(m, "logarithm")?;
    Ok(from_eig(&vals, &vecs, f64::ln))
}

/// Matrix exponential of a symmetric matrix
///
/// # Errors
/// Returns error if the decomposition fails
pub fn sym_exp(m: &Array2<f64>) -> Result<Array2<f64>> {
    map_eigenvalues(m, f64::exp)
}

/// Moore-Penrose pseudo-inverse of a symmetric positive semi-definite matrix
///
/// Eigenvalues below `rcond` times the largest one are treated as zero.
///
/// # Errors
/// Returns error if the decomposition fails
pub fn psd_pinv(m: &Array2<f64>, rcond: f64) -> Result<Array2<f64>> {
    let (vals, vecs) = sym_eig(m)?;
    let cutoff = vals.iter().fold(0.0_f64, |acc, &v| acc.max(v)) * rcond;
    Ok(from_eig(&vals, &vecs, |v| if v > cutoff { v.recip() } else { 0.0 }))
}

/// Orthonormal basis (as columns) of the column space of `x`
///
/// Rank-deficient inputs yield fewer columns than `x` has.
///
/// # Errors
/// Returns error if the decomposition fails
pub fn orthonormal_basis(x: &Array2<f64>, rcond: f64) -> Result<Array2<f64>> {
    if x.ncols() == 0 {
        return Ok(Array2::zeros((x.nrows(), 0)));
    }
    // x = U S Vᵀ, so U = x V S⁻¹ on the non-null singular directions
    let gram = x.t().dot(x);
    let (vals, vecs) = sym_eig(&gram)?;
    let cutoff = vals.iter().fold(0.0_f64, |acc, &v| acc.max(v)) * rcond;
    let keep: Vec<usize> = (0..vals.len()).filter(|&i| vals[i] > cutoff).collect();

    let mut basis = Array2::zeros((x.nrows(), keep.len()));
    for (j, &i) in keep.iter().enumerate() {
        let column = x.dot(&vecs.column(i)) / vals[i].sqrt();
        basis.column_mut(j).assign(&column);
    }
    Ok(basis)
}

/// Eigenvalues and eigenvectors sorted by decreasing eigenvalue
///
/// # Errors
/// Returns error if the decomposition fails
pub fn sym_eig_desc(m: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let (vals, vecs) = sym_eig(m)?;
    let mut order: Vec<usize> = (0..vals.len()).collect();
    order.sort_by(|&a, &b| vals[b].total_cmp(&vals[a]));
    let sorted_vals = order.iter().map(|&i| vals[i]).collect();
    let sorted_vecs = vecs.select(Axis(1), &order);
    Ok((sorted_vals, sorted_vecs))
}

/// Frobenius norm
#[must_use]
pub fn frobenius(m: &Array2<f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Largest absolute element-wise difference
#[cfg(test)]
pub fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn spd() -> Array2<f64> {
        array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]]
    }

    #[test]
    fn test_inverse() {
        let m = spd();
        let product = m.dot(&spd_inverse(&m).expect("inverse"));
        assert!(max_abs_diff(&product, &Array2::eye(3)) < 1e-10);
    }

    #[test]
    fn test_sqrt_squares_back() {
        let m = spd();
        let root = spd_sqrt(&m).expect("sqrt");
        assert!(max_abs_diff(&root.dot(&root), &m) < 1e-10);

        let inv_root = spd_inv_sqrt(&m).expect("inv sqrt");
        assert!(max_abs_diff(&inv_root.dot(&root), &Array2::eye(3)) < 1e-10);
    }

    #[test]
    fn test_log_exp_inverse_pair() {
        let m = spd();
        let back = sym_exp(&spd_log(&m).expect("log")).expect("exp");
        assert!(max_abs_diff(&back, &m) < 1e-10);
    }

    #[test]
    fn test_not_positive_definite() {
        let m = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(spd_log(&m), Err(FcError::Linalg(_))));
    }

    #[test]
    fn test_orthonormal_basis_rank_deficient() {
        // third column = first + second
        let x = array![[1.0, 0.0, 1.0], [0.0, 1.0, 1.0], [1.0, 1.0, 2.0], [2.0, 0.0, 2.0]];
        let basis = orthonormal_basis(&x, 1e-10).expect("basis");

        assert_eq!(basis.ncols(), 2);
        assert!(max_abs_diff(&basis.t().dot(&basis), &Array2::eye(2)) < 1e-10);
    }

    #[test]
    fn test_pinv_of_singular_matrix() {
        let m = array![[1.0, 1.0], [1.0, 1.0]];
        let p = psd_pinv(&m, 1e-12).expect("pinv");
        assert!(max_abs_diff(&m.dot(&p).dot(&m), &m) < 1e-10);
    }

    #[test]
    fn test_sorted_descending() {
        let (vals, vecs) = sym_eig_desc(&spd()).expect("eig");
        assert!(vals[0] >= vals[1] && vals[1] >= vals[2]);
        assert_eq!(vecs.dim(), (3, 3));
    }
}
