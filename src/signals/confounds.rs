//! High-variance confound regressors computed from the raw scan

use crate::ml::linalg::sym_eig_desc;
use crate::ml::stats::percentile;
use crate::signals::clean::detrend_series;
use crate::structs::{FcError, Result};
use ndarray::{s, Array1, Array2, ArrayView4};

/// Leading temporal components of the highest-variance voxels
///
/// Each voxel series is linearly detrended; voxels whose variance is strictly above the
/// `100 - percentile` percentile are kept, and the `n_confounds` leading left singular
/// vectors of that (time x voxels) matrix are returned as columns.
///
/// # Errors
/// Returns error if the scan has no time points or the decomposition fails
pub fn high_variance_confounds(
    func: &ArrayView4<'_, f64>,
    n_confounds: usize,
    percentile_pct: f64,
) -> Result<Array2<f64>> {
    let (nx, ny, nz, n_frames) = func.dim();
    if n_frames == 0 {
        return Err(FcError::Shape("functional scan has no time points".into()));
    }

    let detrended = |x: usize, y: usize, z: usize| -> Array1<f64> {
        let mut series = func.slice(s![x, y, z, ..]).to_owned();
        detrend_series(series.view_mut());
        series
    };

    #[allow(clippy::cast_precision_loss)]
    let mean_of_squares =
        |series: &Array1<f64>| series.iter().map(|v| v * v).sum::<f64>() / n_frames as f64;

    let mut variances = Vec::with_capacity(nx * ny * nz);
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                variances.push(mean_of_squares(&detrended(x, y, z)));
            }
        }
    }

    let mut sorted = variances.clone();
    sorted.sort_by(f64::total_cmp);
    let threshold = percentile(&sorted, 100.0 - percentile_pct);

    let mut selected: Vec<Array1<f64>> = Vec::new();
    let mut idx = 0;
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                if variances[idx] > threshold {
                    selected.push(detrended(x, y, z));
                }
                idx += 1;
            }
        }
    }

    let n_keep = n_confounds.min(n_frames).min(selected.len());
    if n_keep == 0 {
        return Ok(Array2::zeros((n_frames, 0)));
    }

    let mut series = Array2::zeros((n_frames, selected.len()));
    for (j, voxel) in selected.iter().enumerate() {
        series.column_mut(j).assign(voxel);
    }

    // left singular vectors of `series` are the eigenvectors of series · seriesᵀ
    let gram = series.dot(&series.t());
    let (_, vecs) = sym_eig_desc(&gram)?;
    Ok(vecs.slice(s![.., ..n_keep]).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_picks_up_dominant_fluctuation() {
        let n_frames = 40;
        let pattern: Vec<f64> = (0..n_frames).map(|t| (t as f64 * 0.9).sin()).collect();
        // 4x4x4 grid, one voxel fluctuates strongly, the rest weakly
        let func = Array4::from_shape_fn((4, 4, 4, n_frames), |(x, y, z, t)| {
            let weak = 0.01 * ((x + 2 * y + 3 * z + t) as f64).cos();
            if (x, y, z) == (1, 2, 3) {
                100.0 + 10.0 * pattern[t]
            } else {
                50.0 + weak
            }
        });

        let confounds = high_variance_confounds(&func.view(), 3, 2.0).expect("confounds");

        assert_eq!(confounds.nrows(), n_frames);
        assert!(confounds.ncols() >= 1 && confounds.ncols() <= 3);

        let mut reference = Array1::from(pattern);
        detrend_series(reference.view_mut());
        let norm = reference.dot(&reference).sqrt();
        let cosine = (confounds.column(0).dot(&reference) / norm).abs();
        assert!(cosine > 0.999);
    }

    #[test]
    fn test_columns_are_orthonormal() {
        let func = Array4::from_shape_fn((5, 5, 4, 30), |(x, y, z, t)| {
            ((x * 7 + y * 3 + z + 1) as f64 * t as f64 * 0.05).sin() * (1.0 + x as f64)
        });

        let confounds = high_variance_confounds(&func.view(), 5, 50.0).expect("confounds");
        assert_eq!(confounds.ncols(), 5);

        let gram = confounds.t().dot(&confounds);
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_empty_scan_rejected() {
        let func = Array4::<f64>::zeros((2, 2, 2, 0));
        assert!(high_variance_confounds(&func.view(), 5, 2.0).is_err());
    }
}
