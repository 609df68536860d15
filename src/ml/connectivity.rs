//! Connectivity matrices from region time series, with group references

use crate::ml::linalg::{frobenius, spd_inv_sqrt, spd_inverse, spd_log, spd_sqrt, sym_exp};
use crate::structs::{
    AveragingStrategy, Cohort, ConnectivityKind, CovEstimator, FcError, LabelType, Result,
};
use log::{info, warn};
use ndarray::{Array2, Array3, Axis};

const GEOMETRIC_MEAN_MAX_ITER: usize = 10;
const GEOMETRIC_MEAN_TOL: f64 = 1e-7;

/// One connectivity kind on top of a base covariance estimator
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityMeasure {
    pub kind: ConnectivityKind,
    pub cov_estimator: CovEstimator,
}

impl ConnectivityMeasure {
    #[must_use]
    pub const fn new(kind: ConnectivityKind, cov_estimator: CovEstimator) -> Self {
        Self {
            kind,
            cov_estimator,
        }
    }

    /// One (regions x regions) matrix per subject, stacked along axis 0
    ///
    /// The subjects passed in form one group: the tangent kind whitens every subject by
    /// their common geometric mean.
    ///
    /// # Errors
    /// Returns error if there are no subjects or a matrix function fails
    pub fn fit_transform(&self, time_series: &[&Array2<f64>]) -> Result<Array3<f64>> {
        let Some(first) = time_series.first() else {
            return Err(FcError::Shape("no subjects to estimate connectivity".into()));
        };
        let n_regions = first.ncols();

        let covariances = time_series
            .iter()
            .map(|ts| self.cov_estimator.fit(ts))
            .collect::<Result<Vec<_>>>()?;

        let matrices = match self.kind {
            ConnectivityKind::Covariance => covariances,
            ConnectivityKind::Correlation => covariances.iter().map(cov_to_corr).collect(),
            ConnectivityKind::Precision => covariances
                .iter()
                .map(spd_inverse)
                .collect::<Result<Vec<_>>>()?,
            ConnectivityKind::PartialCorrelation => covariances
                .iter()
                .map(|c| spd_inverse(c).map(|p| prec_to_partial(&p)))
                .collect::<Result<Vec<_>>>()?,
            ConnectivityKind::Tangent => {
                let mean = geometric_mean(&covariances)?;
                let whitening = spd_inv_sqrt(&mean)?;
                covariances
                    .iter()
                    .map(|c| spd_log(&whitening.dot(c).dot(&whitening)))
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let mut stacked = Array3::zeros((matrices.len(), n_regions, n_regions));
        for (mut slot, m) in stacked.outer_iter_mut().zip(&matrices) {
            slot.assign(&symmetrize(m));
        }
        Ok(stacked)
    }
}

fn symmetrize(m: &Array2<f64>) -> Array2<f64> {
    (m + &m.t()) * 0.5
}

/// Correlation matrix from a covariance matrix; the diagonal is exactly 1
#[must_use]
pub fn cov_to_corr(cov: &Array2<f64>) -> Array2<f64> {
    let inv_std = cov.diag().mapv(|v| v.sqrt().recip());
    let mut corr = cov * &inv_std * &inv_std.view().insert_axis(Axis(1));
    corr.diag_mut().fill(1.0);
    corr
}

/// Partial correlations `-P_ij / sqrt(P_ii P_jj)` from a precision matrix
#[must_use]
pub fn prec_to_partial(precision: &Array2<f64>) -> Array2<f64> {
    let mut partial = -cov_to_corr(precision);
    partial.diag_mut().fill(1.0);
    partial
}

/// Riemannian geometric mean of symmetric positive definite matrices
///
/// Fixed-point iteration from the arithmetic mean; the step is halved whenever the
/// norm of the mean logarithm grows.
///
/// # Errors
/// Returns error if the list is empty or a matrix is not positive definite
#[allow(clippy::cast_precision_loss)]
pub fn geometric_mean(matrices: &[Array2<f64>]) -> Result<Array2<f64>> {
    let Some(first) = matrices.first() else {
        return Err(FcError::Shape("geometric mean of no matrices".into()));
    };
    let count = matrices.len() as f64;
    let size = first.len() as f64;

    let mut gmean = matrices
        .iter()
        .fold(Array2::zeros(first.raw_dim()), |acc, m| acc + m)
        / count;
    let mut norm_old = f64::INFINITY;
    let mut step = 1.0;

    for _ in 0..GEOMETRIC_MEAN_MAX_ITER {
        let inv_sqrt = spd_inv_sqrt(&gmean)?;
        let sqrt = spd_sqrt(&gmean)?;

        let mut logs_mean = Array2::<f64>::zeros(first.raw_dim());
        for m in matrices {
            logs_mean += &spd_log(&inv_sqrt.dot(m).dot(&inv_sqrt))?;
        }
        logs_mean /= count;
        if logs_mean.iter().any(|v| !v.is_finite()) {
            return Err(FcError::Linalg(
                "geometric mean diverged: non-finite mean logarithm".into(),
            ));
        }

        gmean = sqrt.dot(&sym_exp(&(&logs_mean * step))?).dot(&sqrt);

        let mut norm = frobenius(&logs_mean);
        if norm < norm_old {
            norm_old = norm;
        } else if norm > norm_old {
            step /= 2.0;
            norm = norm_old;
        }
        if norm / size < GEOMETRIC_MEAN_TOL {
            return Ok(symmetrize(&gmean));
        }
    }

    warn!("geometric mean did not converge in {GEOMETRIC_MEAN_MAX_ITER} iterations");
    Ok(symmetrize(&gmean))
}

/// Subject index groups that share a reference under `strategy`
///
/// # Errors
/// Returns error if site blocks do not tile the cohort
pub fn partition(
    strategy: AveragingStrategy,
    diagnosis: &[usize],
    block_size: usize,
) -> Result<Vec<Vec<usize>>> {
    let n = diagnosis.len();
    match strategy {
        AveragingStrategy::Global => Ok(vec![(0..n).collect()]),
        AveragingStrategy::SiteGrouped => {
            if block_size == 0 || n % block_size != 0 {
                return Err(FcError::Config(format!(
                    "{n} subjects cannot be split into site blocks of {block_size}"
                )));
            }
            Ok((0..n)
                .collect::<Vec<_>>()
                .chunks(block_size)
                .map(<[usize]>::to_vec)
                .collect())
        }
        AveragingStrategy::DiagnosisGrouped => {
            let mut flags: Vec<usize> = diagnosis.to_vec();
            flags.sort_unstable();
            flags.dedup();
            Ok(flags
                .into_iter()
                .map(|flag| (0..n).filter(|&i| diagnosis[i] == flag).collect())
                .collect())
        }
    }
}

/// Connectivity of every subject in the cohort under an averaging strategy
///
/// Groups are fitted independently and their matrices written back to the rows of
/// their subjects, so the result is always (subjects x regions x regions).
///
/// # Errors
/// Returns error if the cohort is empty, groups are invalid, or estimation fails
pub fn estimate_connectivity(
    cohort: &Cohort,
    measure: &ConnectivityMeasure,
    strategy: AveragingStrategy,
    block_size: usize,
) -> Result<Array3<f64>> {
    let n = cohort.n_subjects();
    if n == 0 {
        return Err(FcError::Shape("no subjects to estimate connectivity".into()));
    }
    let r = cohort.n_regions();
    info!("-- Estimating {} connectivity ({strategy})", measure.kind);

    let groups = partition(strategy, cohort.labels(LabelType::Diagnosis), block_size)?;
    let mut output = Array3::<f64>::zeros((n, r, r));
    let mut filled = vec![false; n];

    for group in groups.iter().filter(|g| !g.is_empty()) {
        let series: Vec<&Array2<f64>> = group.iter().map(|&i| &cohort.time_series()[i]).collect();
        let matrices = measure.fit_transform(&series)?;
        for (&subject, matrix) in group.iter().zip(matrices.outer_iter()) {
            output.index_axis_mut(Axis(0), subject).assign(&matrix);
            filled[subject] = true;
        }
    }

    if let Some(missing) = filled.iter().position(|&f| !f) {
        return Err(FcError::Shape(format!(
            "subject {missing} belongs to no averaging group"
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::site_labels;
    use crate::ml::linalg::max_abs_diff;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_cohort(n: usize, regions: usize, frames: usize, seed: u64) -> Cohort {
        let mut rng = StdRng::seed_from_u64(seed);
        let series = (0..n)
            .map(|_| Array2::from_shape_fn((frames, regions), |_| rng.gen_range(-1.0..1.0)))
            .collect();
        let diagnosis = (0..n).map(|i| i % 2).collect();
        Cohort::new(series, site_labels(n, 5), diagnosis).expect("cohort")
    }

    #[test]
    fn test_covariance_shape_and_symmetry() {
        let cohort = random_cohort(10, 4, 20, 42);
        let measure = ConnectivityMeasure::new(ConnectivityKind::Covariance, CovEstimator::Empirical);

        let out = estimate_connectivity(&cohort, &measure, AveragingStrategy::Global, 8)
            .expect("connectivity");

        assert_eq!(out.dim(), (10, 4, 4));
        for m in out.outer_iter() {
            let m = m.to_owned();
            assert!(max_abs_diff(&m, &m.t().to_owned()) < 1e-8);
        }
    }

    #[test]
    fn test_every_kind_keeps_shape_in_every_mode() {
        let cohort = random_cohort(10, 4, 20, 7);
        for kind in ConnectivityKind::ALL {
            let measure = ConnectivityMeasure::new(kind, CovEstimator::LedoitWolf);
            for strategy in [
                AveragingStrategy::Global,
                AveragingStrategy::SiteGrouped,
                AveragingStrategy::DiagnosisGrouped,
            ] {
                let out = estimate_connectivity(&cohort, &measure, strategy, 5)
                    .expect("connectivity");
                assert_eq!(out.dim(), (10, 4, 4), "{kind} / {strategy}");
            }
        }
    }

    #[test]
    fn test_site_grouped_matches_global_without_reference() {
        let cohort = random_cohort(10, 4, 20, 11);
        let measure = ConnectivityMeasure::new(ConnectivityKind::Covariance, CovEstimator::Empirical);

        let global = estimate_connectivity(&cohort, &measure, AveragingStrategy::Global, 5)
            .expect("global");
        let grouped = estimate_connectivity(&cohort, &measure, AveragingStrategy::SiteGrouped, 5)
            .expect("grouped");

        assert!(global.iter().zip(grouped.iter()).all(|(a, b)| (a - b).abs() < 1e-12));
    }

    #[test]
    fn test_tangent_grouping_on_uniform_input() {
        let mut rng = StdRng::seed_from_u64(5);
        let shared = Array2::from_shape_fn((30, 3), |_| rng.gen_range(-1.0..1.0));
        let cohort = Cohort::new(vec![shared; 8], site_labels(8, 4), vec![0, 1, 0, 1, 0, 1, 0, 1])
            .expect("cohort");
        let measure = ConnectivityMeasure::new(ConnectivityKind::Tangent, CovEstimator::Empirical);

        let global = estimate_connectivity(&cohort, &measure, AveragingStrategy::Global, 4)
            .expect("global");
        let grouped = estimate_connectivity(&cohort, &measure, AveragingStrategy::SiteGrouped, 4)
            .expect("grouped");

        assert!(global.iter().zip(grouped.iter()).all(|(a, b)| (a - b).abs() < 1e-8));
        // every subject sits on the reference, so the tangent vectors vanish
        assert!(global.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_site_grouped_rejects_partial_block() {
        let cohort = random_cohort(10, 3, 20, 1);
        let measure = ConnectivityMeasure::new(ConnectivityKind::Correlation, CovEstimator::Empirical);

        assert!(matches!(
            estimate_connectivity(&cohort, &measure, AveragingStrategy::SiteGrouped, 8),
            Err(FcError::Config(_))
        ));
    }

    #[test]
    fn test_diagnosis_partition_covers_every_subject_once() {
        let diagnosis = [1, 0, 0, 1, 1, 0, 1];
        let groups = partition(AveragingStrategy::DiagnosisGrouped, &diagnosis, 8)
            .expect("partition");

        let mut seen: Vec<usize> = groups.concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(groups[0], vec![1, 2, 5]);
        assert_eq!(groups[1], vec![0, 3, 4, 6]);
    }

    #[test]
    fn test_single_diagnosis_group() {
        let groups = partition(AveragingStrategy::DiagnosisGrouped, &[0, 0, 0], 8)
            .expect("partition");
        assert_eq!(groups, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_correlation_and_partial_correlation() {
        let cov = array![[4.0, 2.0], [2.0, 9.0]];
        let corr = cov_to_corr(&cov);
        assert!((corr[[0, 1]] - 2.0 / 6.0).abs() < 1e-12);
        assert_eq!(corr[[0, 0]], 1.0);

        let precision = array![[2.0, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 2.0]];
        let partial = prec_to_partial(&precision);
        assert!((partial[[0, 1]] - 0.5).abs() < 1e-12);
        assert!(partial[[0, 2]].abs() < 1e-12);
        assert_eq!(partial[[2, 2]], 1.0);
    }

    #[test]
    fn test_geometric_mean_of_commuting_matrices() {
        // diagonal matrices: the mean is the element-wise geometric mean
        let a = array![[1.0, 0.0], [0.0, 4.0]];
        let b = array![[4.0, 0.0], [0.0, 1.0]];
        let mean = geometric_mean(&[a, b]).expect("mean");
        assert!(max_abs_diff(&mean, &(Array2::eye(2) * 2.0)) < 1e-6);
    }
}
