//! Repeated stratified shuffle-split cross-validation

use crate::ml::classifiers::ClassifierKind;
use crate::structs::{CvConfig, FcError, Result};
use linfa::prelude::ToConfusionMatrix;
use linfa::Dataset;
use log::warn;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One train/test partition of sample indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Random train/test splits preserving class proportions
#[derive(Debug, Clone)]
pub struct StratifiedShuffleSplit {
    pub n_splits: usize,
    pub test_size: f64,
    pub seed: u64,
}

impl From<&CvConfig> for StratifiedShuffleSplit {
    fn from(config: &CvConfig) -> Self {
        Self {
            n_splits: config.n_splits,
            test_size: config.test_size,
            seed: config.seed,
        }
    }
}

impl StratifiedShuffleSplit {
    /// Generate every split for the class labels `y`
    ///
    /// Train and test slots are shared out between classes in proportion to their size;
    /// slots left over by flooring go to the largest remainders, ties broken at random.
    ///
    /// # Errors
    /// Returns error if a class has fewer than 2 members or there are fewer train or
    /// test slots than classes
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn split(&self, y: &[usize]) -> Result<Vec<Split>> {
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(FcError::Config(format!(
                "test size must be in (0, 1), got {}",
                self.test_size
            )));
        }
        let n = y.len();
        let n_test = (self.test_size * n as f64).ceil() as usize;
        let n_train = n.saturating_sub(n_test);

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let members: Vec<Vec<usize>> = classes
            .iter()
            .map(|&c| (0..n).filter(|&i| y[i] == c).collect())
            .collect();

        if let Some((class, m)) = classes.iter().zip(&members).find(|(_, m)| m.len() < 2) {
            return Err(FcError::Ml(format!(
                "class {class} has only {} member(s), stratified splitting needs at least 2",
                m.len()
            )));
        }
        if n_train < classes.len() || n_test < classes.len() {
            return Err(FcError::Ml(format!(
                "{n_train} train / {n_test} test samples cannot hold {} classes",
                classes.len()
            )));
        }

        let counts: Vec<usize> = members.iter().map(Vec::len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut splits = Vec::with_capacity(self.n_splits);
        for _ in 0..self.n_splits {
            let n_i = approximate_mode(&counts, n_train, &mut rng);
            let remaining: Vec<usize> = counts.iter().zip(&n_i).map(|(c, t)| c - t).collect();
            let t_i = approximate_mode(&remaining, n_test, &mut rng);

            let mut train = Vec::with_capacity(n_train);
            let mut test = Vec::with_capacity(n_test);
            for ((m, &n_tr), &n_te) in members.iter().zip(&n_i).zip(&t_i) {
                let mut shuffled = m.clone();
                shuffled.shuffle(&mut rng);
                train.extend_from_slice(&shuffled[..n_tr]);
                test.extend_from_slice(&shuffled[n_tr..n_tr + n_te]);
            }

            train.shuffle(&mut rng);
            test.shuffle(&mut rng);
            splits.push(Split { train, test });
        }
        Ok(splits)
    }
}

/// Integer allocation of `n_draws` over classes closest to proportional
///
/// Never exceeds a class count as long as `n_draws` does not exceed their sum.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn approximate_mode(counts: &[usize], n_draws: usize, rng: &mut StdRng) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return vec![0; counts.len()];
    }
    let continuous: Vec<f64> = counts
        .iter()
        .map(|&c| c as f64 / total as f64 * n_draws as f64)
        .collect();
    let mut floored: Vec<usize> = continuous.iter().map(|v| v.floor() as usize).collect();
    let mut need = n_draws.saturating_sub(floored.iter().sum());

    let remainders: Vec<f64> = continuous
        .iter()
        .zip(&floored)
        .map(|(v, &f)| v - f as f64)
        .collect();
    let mut levels = remainders.clone();
    levels.sort_by(|a, b| b.total_cmp(a));
    levels.dedup_by(|a, b| a.total_cmp(b).is_eq());

    for level in levels {
        if need == 0 {
            break;
        }
        let mut tied: Vec<usize> = (0..counts.len())
            .filter(|&i| remainders[i].total_cmp(&level).is_eq())
            .collect();
        tied.shuffle(rng);
        for &i in tied.iter().take(need) {
            floored[i] += 1;
        }
        need -= need.min(tied.len());
    }
    floored
}

/// Accuracy of `kind` on every split
///
/// Fits that stop before converging are counted and reported once.
///
/// # Errors
/// Returns error if fitting, prediction or scoring fails
pub fn cross_val_score(
    kind: ClassifierKind,
    features: &Array2<f64>,
    labels: &[usize],
    splits: &[Split],
) -> Result<Vec<f64>> {
    if features.nrows() != labels.len() {
        return Err(FcError::Shape(format!(
            "{} feature rows but {} labels",
            features.nrows(),
            labels.len()
        )));
    }
    let dataset = Dataset::new(features.clone(), Array1::from(labels.to_vec()));
    let mut unconverged = 0;

    let scores = splits
        .iter()
        .map(|split| {
            let train_x = dataset.records().select(Axis(0), &split.train);
            let train_y: Vec<usize> = split.train.iter().map(|&i| labels[i]).collect();
            let test_x = dataset.records().select(Axis(0), &split.test);
            let test_y = dataset.targets().select(Axis(0), &split.test);

            let model = kind.fit(&train_x, &train_y)?;
            if !model.converged() {
                unconverged += 1;
            }
            let predicted = model.predict(&test_x)?;
            let cm = predicted
                .confusion_matrix(&test_y)
                .map_err(|e| FcError::Ml(format!("scoring {kind} failed: {e}")))?;
            Ok(f64::from(cm.accuracy()))
        })
        .collect::<Result<Vec<_>>>()?;

    if unconverged > 0 {
        warn!(
            "{kind}: {unconverged}/{} fits stopped before converging",
            splits.len()
        );
    }
    Ok(scores)
}
