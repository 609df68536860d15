//! Per-subject covariance estimators

use crate::structs::{CovEstimator, FcError, Result};
use ndarray::{Array2, Axis};

impl CovEstimator {
    /// Covariance of a (samples x features) matrix, means removed
    ///
    /// # Errors
    /// Returns error if there are no samples
    pub fn fit(self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let centered = center(x)?;
        let empirical = scatter(&centered);
        Ok(match self {
            Self::Empirical => empirical,
            Self::LedoitWolf => {
                let shrinkage = ledoit_wolf_shrinkage(&centered);
                shrink(&empirical, shrinkage)
            }
        })
    }
}

fn center(x: &Array2<f64>) -> Result<Array2<f64>> {
    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| FcError::Shape("cannot estimate covariance from 0 samples".into()))?;
    Ok(x - &mean)
}

/// Maximum-likelihood covariance of centered data (divisor n)
#[allow(clippy::cast_precision_loss)]
fn scatter(centered: &Array2<f64>) -> Array2<f64> {
    centered.t().dot(centered) / centered.nrows() as f64
}

/// `(1 - s) Σ + s μ I` with `μ = tr(Σ) / p`
#[allow(clippy::cast_precision_loss)]
fn shrink(cov: &Array2<f64>, shrinkage: f64) -> Array2<f64> {
    let p = cov.nrows();
    let mu = cov.diag().sum() / p as f64;
    let mut shrunk = cov * (1.0 - shrinkage);
    for i in 0..p {
        shrunk[[i, i]] += shrinkage * mu;
    }
    shrunk
}

/// Ledoit-Wolf optimal shrinkage coefficient for centered data
#[allow(clippy::cast_precision_loss)]
pub fn ledoit_wolf_shrinkage(centered: &Array2<f64>) -> f64 {
    let (n_samples, n_features) = centered.dim();
    if n_features <= 1 || n_samples == 0 {
        return 0.0;
    }
    let n = n_samples as f64;
    let p = n_features as f64;

    let squared = centered.mapv(|v| v * v);
    let trace_terms = squared.sum_axis(Axis(0)) / n;
    let mu = trace_terms.sum() / p;

    let beta_sum = squared.t().dot(&squared).sum();
    let delta_sum = centered.t().dot(centered).mapv(|v| v * v).sum() / (n * n);

    let beta = (beta_sum / n - delta_sum) / (p * n);
    let delta = (p.mul_add(mu * mu, delta_sum - 2.0 * mu * trace_terms.sum())) / p;
    let beta = beta.min(delta);

    if beta <= 0.0 || delta <= 0.0 {
        0.0
    } else {
        beta / delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn test_empirical_matches_hand_computation() {
        let x = array![[1.0, 2.0], [3.0, 6.0], [5.0, 4.0]];
        let cov = CovEstimator::Empirical.fit(&x).expect("fit");

        // means (3, 4); deviations (-2,-2), (0,2), (2,0)
        assert_abs_diff_eq!(cov[[0, 0]], 8.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 1]], 8.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 0]], cov[[0, 1]], epsilon = 1e-15);
    }

    #[test]
    fn test_ledoit_wolf_shrinks_towards_identity() {
        let x = random_data(15, 6, 3);
        let empirical = CovEstimator::Empirical.fit(&x).expect("empirical");
        let shrunk = CovEstimator::LedoitWolf.fit(&x).expect("ledoit-wolf");

        let s = ledoit_wolf_shrinkage(&center(&x).expect("center"));
        assert!(s > 0.0 && s <= 1.0);

        // trace is preserved, off-diagonal mass shrinks
        assert_abs_diff_eq!(empirical.diag().sum(), shrunk.diag().sum(), epsilon = 1e-10);
        assert_abs_diff_eq!(shrunk[[0, 1]], (1.0 - s) * empirical[[0, 1]], epsilon = 1e-12);
    }

    #[test]
    fn test_single_feature_is_not_shrunk() {
        let x = array![[1.0], [2.0], [4.0]];
        let empirical = CovEstimator::Empirical.fit(&x).expect("empirical");
        let shrunk = CovEstimator::LedoitWolf.fit(&x).expect("ledoit-wolf");
        assert_abs_diff_eq!(empirical[[0, 0]], shrunk[[0, 0]], epsilon = 1e-15);
    }

    #[test]
    fn test_no_samples_rejected() {
        let x = Array2::<f64>::zeros((0, 3));
        assert!(CovEstimator::Empirical.fit(&x).is_err());
    }
}
