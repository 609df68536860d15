//! Temporal cleaning of region signals (time points x regions)

use crate::ml::linalg::orthonormal_basis;
use crate::structs::{FcError, Result, SignalConfig};
use log::warn;
use ndarray::{concatenate, Array2, ArrayViewMut1, Axis};
use std::f64::consts::PI;

/// Rank cutoff for nuisance regressor bases
const BASIS_RCOND: f64 = 1e-10;

/// Convert each region to percent signal change around its temporal mean
///
/// Regions whose mean is zero are left unscaled.
#[allow(clippy::cast_precision_loss)]
pub fn percent_signal_change(signals: &mut Array2<f64>) {
    for (region, mut column) in signals.columns_mut().into_iter().enumerate() {
        let mean = column.mean().unwrap_or(0.0);
        if mean.abs() < f64::EPSILON {
            warn!("region {region} has zero mean signal, skipping PSC scaling");
            continue;
        }
        column.mapv_inplace(|v| v / mean * 100.0);
    }
}

/// Remove mean and linear trend from one series
#[allow(clippy::cast_precision_loss)]
pub fn detrend_series(mut series: ArrayViewMut1<'_, f64>) {
    let n = series.len();
    if n == 0 {
        return;
    }
    let mean = series.mean().unwrap_or(0.0);
    series.mapv_inplace(|v| v - mean);
    if n < 2 {
        return;
    }

    let t_mean = (n - 1) as f64 / 2.0;
    let denom: f64 = (0..n).map(|i| (i as f64 - t_mean).powi(2)).sum();
    let slope = series
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 - t_mean) * v)
        .sum::<f64>()
        / denom;
    for (i, v) in series.iter_mut().enumerate() {
        *v -= slope * (i as f64 - t_mean);
    }
}

/// Remove mean and linear trend from every column
pub fn detrend(signals: &mut Array2<f64>) {
    for column in signals.columns_mut() {
        detrend_series(column);
    }
}

/// Discrete cosine drift basis (without the constant) for a high-pass cutoff in Hz
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn cosine_drift(n_frames: usize, high_pass: f64, t_r: f64) -> Array2<f64> {
    if n_frames < 2 {
        return Array2::zeros((n_frames, 0));
    }
    let n = n_frames as f64;
    let order = (2.0 * n * high_pass * t_r).floor().max(0.0) as usize;
    let normalizer = (2.0 / n).sqrt();
    Array2::from_shape_fn((n_frames, order), |(t, k)| {
        normalizer * ((PI / n) * (t as f64 + 0.5) * (k + 1) as f64).cos()
    })
}

/// Remove slow drifts below `cutoff` Hz from every column
///
/// # Errors
/// Returns error if the drift projection fails
pub fn high_pass(signals: &mut Array2<f64>, cutoff: f64, t_r: f64) -> Result<()> {
    let drift = cosine_drift(signals.nrows(), cutoff, t_r);
    regress_out(signals, &drift)
}

/// Project `signals` onto the orthogonal complement of the regressors' span
///
/// # Errors
/// Returns error if the row counts differ or the basis computation fails
pub fn regress_out(signals: &mut Array2<f64>, regressors: &Array2<f64>) -> Result<()> {
    if regressors.nrows() != signals.nrows() {
        return Err(FcError::Shape(format!(
            "{} confound rows for {} time points",
            regressors.nrows(),
            signals.nrows()
        )));
    }
    if regressors.ncols() == 0 {
        return Ok(());
    }
    let basis = orthonormal_basis(regressors, BASIS_RCOND)?;
    let fitted = basis.dot(&basis.t().dot(signals));
    *signals -= &fitted;
    Ok(())
}

/// Z-score every column; constant columns become zero
#[allow(clippy::cast_precision_loss)]
pub fn standardize(signals: &mut Array2<f64>) {
    for mut column in signals.columns_mut() {
        let n = column.len() as f64;
        let mean = column.mean().unwrap_or(0.0);
        let std = (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std < f64::EPSILON {
            column.fill(0.0);
        } else {
            column.mapv_inplace(|v| (v - mean) / std);
        }
    }
}

/// Detrend, high-pass filter, regress out confounds, and optionally standardize
///
/// Confounds get the same detrending and filtering as the signals before they are
/// projected out.
///
/// # Errors
/// Returns error if a confound matrix does not match the number of time points
pub fn clean(
    mut signals: Array2<f64>,
    confounds: &[Array2<f64>],
    config: &SignalConfig,
) -> Result<Array2<f64>> {
    let n_frames = signals.nrows();
    for c in confounds {
        if c.nrows() != n_frames {
            return Err(FcError::Shape(format!(
                "confounds have {} rows but the scan has {n_frames} time points",
                c.nrows()
            )));
        }
    }

    detrend(&mut signals);
    if let Some(cutoff) = config.high_pass {
        high_pass(&mut signals, cutoff, config.t_r)?;
    }

    if !confounds.is_empty() {
        let views: Vec<_> = confounds.iter().map(Array2::view).collect();
        let mut regressors = concatenate(Axis(1), &views)
            .map_err(|e| FcError::Shape(format!("cannot stack confounds: {e}")))?;
        detrend(&mut regressors);
        if let Some(cutoff) = config.high_pass {
            high_pass(&mut regressors, cutoff, config.t_r)?;
        }
        regress_out(&mut signals, &regressors)?;
    }

    if config.standardize {
        standardize(&mut signals);
    }
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn config() -> SignalConfig {
        SignalConfig {
            t_r: 2.0,
            high_pass: Some(0.01),
            ..SignalConfig::default()
        }
    }

    #[test]
    fn test_percent_signal_change() {
        let mut signals = array![[90.0, 0.0], [110.0, 0.0]];
        percent_signal_change(&mut signals);

        let means = signals.mean_axis(Axis(0)).expect("column means");
        assert!((means[0] - 100.0).abs() < 1e-12);
        assert!((signals[[0, 0]] - 90.0).abs() < 1e-12);
        // zero-mean region untouched
        assert_eq!(signals[[1, 1]], 0.0);
    }

    #[test]
    fn test_detrend_removes_line() {
        let mut signals = Array2::from_shape_fn((20, 1), |(t, _)| 3.0 + 0.5 * t as f64);
        detrend(&mut signals);

        assert!(signals.iter().all(|v| v.abs() < 1e-10));
    }

    #[test]
    fn test_cosine_drift_order() {
        // 2 * 100 frames * 0.01 Hz * 2 s = 4 regressors
        let drift = cosine_drift(100, 0.01, 2.0);
        assert_eq!(drift.dim(), (100, 4));

        let gram = drift.t().dot(&drift);
        assert!((gram[[0, 0]] - 1.0).abs() < 1e-10);
        assert!(gram[[0, 1]].abs() < 1e-10);
    }

    #[test]
    fn test_regress_out_leaves_orthogonal_residual() {
        let confound = Array2::from_shape_fn((30, 1), |(t, _)| ((t as f64) * 0.7).sin());
        let noise = Array2::from_shape_fn((30, 1), |(t, _)| ((t as f64) * 1.9).cos());
        let mut signals = &confound * 2.0 + &noise;

        regress_out(&mut signals, &confound).expect("regress");

        let dot: f64 = signals.column(0).dot(&confound.column(0));
        assert!(dot.abs() < 1e-9);
    }

    #[test]
    fn test_clean_rejects_confound_length_mismatch() {
        let signals = Array2::zeros((10, 3));
        let confounds = vec![Array2::zeros((9, 2))];

        assert!(matches!(
            clean(signals, &confounds, &config()),
            Err(FcError::Shape(_))
        ));
    }

    #[test]
    fn test_clean_standardizes() {
        let signals = Array2::from_shape_fn((50, 2), |(t, r)| ((t * (r + 2)) as f64 * 0.3).sin());
        let cfg = SignalConfig {
            standardize: true,
            ..config()
        };

        let cleaned = clean(signals, &[], &cfg).expect("clean");

        assert_eq!(cleaned.dim(), (50, 2));
        for column in cleaned.columns() {
            let mean = column.mean().unwrap_or(1.0);
            let var = column.iter().map(|v| v * v).sum::<f64>() / 50.0;
            assert!(mean.abs() < 1e-10);
            assert!((var - 1.0).abs() < 1e-10);
        }
    }
}
