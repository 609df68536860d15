//! Classifier roster: linear SVM, linear discriminant analysis, k-nearest neighbours

use crate::ml::linalg::psd_pinv;
use crate::structs::{FcError, Result};
use linfa_nn::distance::L2Dist;
use linfa_nn::{CommonNearestNeighbour, NearestNeighbour};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;

/// Linear SVC parameters (liblinear's L2-regularized L2-loss dual solver)
const SVC_C: f64 = 1.0;
const SVC_TOL: f64 = 1e-4;
const SVC_MAX_ITER: usize = 1000;
const SVC_SEED: u64 = 0;

/// Rank cutoff for the LDA within-class Gram matrix
const LDA_RCOND: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierKind {
    LinearSvc,
    Lda,
    Knn(usize),
}

impl ClassifierKind {
    /// SVM, LDA, then KNN for k = 1..=5
    #[must_use]
    pub fn roster() -> Vec<Self> {
        let mut roster = vec![Self::LinearSvc, Self::Lda];
        roster.extend((1..=5).map(Self::Knn));
        roster
    }

    /// Fit on (samples x features) records with integer class labels
    ///
    /// # Errors
    /// Returns error if records and labels disagree in length or there are no samples
    pub fn fit(self, x: &Array2<f64>, y: &[usize]) -> Result<FittedClassifier> {
        if x.nrows() != y.len() {
            return Err(FcError::Shape(format!(
                "{} samples but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if y.is_empty() {
            return Err(FcError::Ml("cannot fit a classifier on 0 samples".into()));
        }

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();

        match self {
            Self::LinearSvc => Ok(fit_linear_svc(x, y, classes)),
            Self::Lda => fit_lda(x, y, classes),
            Self::Knn(k) => {
                if k == 0 {
                    return Err(FcError::Config("KNN needs k >= 1".into()));
                }
                Ok(FittedClassifier::Knn {
                    data: x.clone(),
                    targets: y.to_vec(),
                    k,
                })
            }
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinearSvc => write!(f, "SVM"),
            Self::Lda => write!(f, "LDA"),
            Self::Knn(k) => write!(f, "KNN n={k}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FittedClassifier {
    /// One decision function per row of `coef`; a single row separates `classes[0]`
    /// (negative side) from `classes[1]`
    Linear {
        classes: Vec<usize>,
        coef: Array2<f64>,
        intercept: Array1<f64>,
        /// False when an iterative solver stopped at its pass limit
        converged: bool,
    },
    Knn {
        data: Array2<f64>,
        targets: Vec<usize>,
        k: usize,
    },
}

impl FittedClassifier {
    /// Whether fitting reached its stopping tolerance
    #[must_use]
    pub const fn converged(&self) -> bool {
        match self {
            Self::Linear { converged, .. } => *converged,
            Self::Knn { .. } => true,
        }
    }

    /// Predicted class of every row of `x`
    ///
    /// # Errors
    /// Returns error if the neighbour search fails
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<usize>> {
        match self {
            Self::Linear {
                classes,
                coef,
                intercept,
                ..
            } => Ok(predict_linear(classes, coef, intercept, x)),
            Self::Knn { data, targets, k } => predict_knn(data, targets, *k, x),
        }
    }
}

fn predict_linear(
    classes: &[usize],
    coef: &Array2<f64>,
    intercept: &Array1<f64>,
    x: &Array2<f64>,
) -> Array1<usize> {
    if classes.len() == 1 || coef.nrows() == 0 {
        return Array1::from_elem(x.nrows(), classes[0]);
    }
    let scores = x.dot(&coef.t()) + intercept;
    if coef.nrows() == 1 {
        return scores.column(0).mapv(|s| if s > 0.0 { classes[1] } else { classes[0] });
    }
    scores
        .outer_iter()
        .map(|row| classes[argmax(&row)])
        .collect()
}

fn argmax(row: &ArrayView1<'_, f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0
}

// ============================================================================
// Linear SVC
// ============================================================================

/// One-vs-rest linear SVMs; two classes share a single model
fn fit_linear_svc(x: &Array2<f64>, y: &[usize], classes: Vec<usize>) -> FittedClassifier {
    let positives: Vec<usize> = match classes.len() {
        1 => Vec::new(),
        2 => vec![classes[1]],
        _ => classes.clone(),
    };

    let mut coef = Array2::zeros((positives.len(), x.ncols()));
    let mut intercept = Array1::zeros(positives.len());
    let mut converged = true;
    for (row, &positive) in positives.iter().enumerate() {
        let signs: Vec<f64> = y
            .iter()
            .map(|&label| if label == positive { 1.0 } else { -1.0 })
            .collect();
        let (w, b, done) = svc_dual_cd(x, &signs, SVC_MAX_ITER);
        coef.row_mut(row).assign(&w);
        intercept[row] = b;
        converged &= done;
    }

    FittedClassifier::Linear {
        classes,
        coef,
        intercept,
        converged,
    }
}

/// Dual coordinate descent for the squared-hinge SVM with a unit bias feature
///
/// Returns the weight vector, the bias, and whether the tolerance was met within
/// `max_iter` passes.
fn svc_dual_cd(x: &Array2<f64>, signs: &[f64], max_iter: usize) -> (Array1<f64>, f64, bool) {
    let (n, p) = x.dim();
    let diag = 0.5 / SVC_C;

    let mut w = Array1::<f64>::zeros(p);
    let mut b = 0.0;
    let mut alpha = vec![0.0; n];
    let q_diag: Vec<f64> = x
        .outer_iter()
        .map(|row| row.dot(&row) + 1.0 + diag)
        .collect();

    let mut rng = StdRng::seed_from_u64(SVC_SEED);
    let mut index: Vec<usize> = (0..n).collect();
    let mut active = n;
    let mut pg_max_old = f64::INFINITY;
    let mut converged = false;

    for _ in 0..max_iter {
        let mut pg_max = f64::NEG_INFINITY;
        let mut pg_min = f64::INFINITY;
        index[..active].shuffle(&mut rng);

        let mut s = 0;
        while s < active {
            let i = index[s];
            let xi = x.row(i);
            let g = signs[i] * (w.dot(&xi) + b) - 1.0 + diag * alpha[i];

            let pg = if alpha[i] == 0.0 {
                if g > pg_max_old {
                    // shrink: this variable is stuck at the bound
                    active -= 1;
                    index.swap(s, active);
                    continue;
                }
                g.min(0.0)
            } else {
                g
            };
            pg_max = pg_max.max(pg);
            pg_min = pg_min.min(pg);

            if pg.abs() > 1e-12 {
                let old = alpha[i];
                alpha[i] = (old - g / q_diag[i]).max(0.0);
                let delta = (alpha[i] - old) * signs[i];
                w.scaled_add(delta, &xi);
                b += delta;
            }
            s += 1;
        }

        if pg_max - pg_min <= SVC_TOL {
            if active == n {
                converged = true;
                break;
            }
            // re-check every variable before stopping
            active = n;
            pg_max_old = f64::INFINITY;
            continue;
        }
        pg_max_old = if pg_max <= 0.0 { f64::INFINITY } else { pg_max };
    }

    (w, b, converged)
}

// ============================================================================
// LDA
// ============================================================================

/// Linear discriminants with a pooled within-class covariance
///
/// The covariance pseudo-inverse is formed in sample space:
/// with centered rows `Xc` and Gram `K = Xc Xcᵀ`, `Σ⁺ = m Xcᵀ (K⁺)² Xc` for `Σ = XcᵀXc / m`.
#[allow(clippy::cast_precision_loss)]
fn fit_lda(x: &Array2<f64>, y: &[usize], classes: Vec<usize>) -> Result<FittedClassifier> {
    let n = x.nrows();
    let p = x.ncols();
    let k = classes.len();

    let mut means = Array2::<f64>::zeros((k, p));
    let mut priors = Array1::<f64>::zeros(k);
    let mut centered = x.clone();
    for (c, &class) in classes.iter().enumerate() {
        let members: Vec<usize> = (0..n).filter(|&i| y[i] == class).collect();
        let mean = x
            .select(Axis(0), &members)
            .mean_axis(Axis(0))
            .ok_or_else(|| FcError::Ml(format!("class {class} has no samples")))?;
        for &i in &members {
            let mut row = centered.row_mut(i);
            row -= &mean;
        }
        priors[c] = members.len() as f64 / n as f64;
        means.row_mut(c).assign(&mean);
    }

    let dof = n.saturating_sub(k).max(1) as f64;
    let gram_pinv = psd_pinv(&centered.dot(&centered.t()), LDA_RCOND)?;
    let gram_pinv_sq = gram_pinv.dot(&gram_pinv);

    // Σ⁺ μ_cᵀ for every class at once: (p x k)
    let projected = centered.dot(&means.t());
    let coef_t = centered.t().dot(&gram_pinv_sq.dot(&projected)) * dof;
    let coef = coef_t.t().to_owned();

    let intercept = Array1::from_iter((0..k).map(|c| {
        -0.5 * means.row(c).dot(&coef.row(c)) + priors[c].ln()
    }));

    Ok(FittedClassifier::Linear {
        classes,
        coef,
        intercept,
        converged: true,
    })
}

// ============================================================================
// KNN
// ============================================================================

/// Majority vote among the `k` nearest training samples; ties go to the smallest label
fn predict_knn(
    data: &Array2<f64>,
    targets: &[usize],
    k: usize,
    x: &Array2<f64>,
) -> Result<Array1<usize>> {
    let index = CommonNearestNeighbour::LinearSearch
        .from_batch(data, L2Dist)
        .map_err(|e| FcError::Ml(format!("neighbour index failed: {e}")))?;
    let k = k.min(targets.len());

    let mut predictions = Vec::with_capacity(x.nrows());
    for point in x.outer_iter() {
        let neighbours = index
            .k_nearest(point, k)
            .map_err(|e| FcError::Ml(format!("neighbour search failed: {e}")))?;

        let mut votes: Vec<(usize, usize)> = Vec::new();
        for (_, i) in neighbours {
            let label = targets[i];
            match votes.iter_mut().find(|(l, _)| *l == label) {
                Some((_, count)) => *count += 1,
                None => votes.push((label, 1)),
            }
        }
        votes.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let winner = votes
            .first()
            .map(|&(label, _)| label)
            .ok_or_else(|| FcError::Ml("no neighbours found".into()))?;
        predictions.push(winner);
    }
    Ok(Array1::from(predictions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::Rng;

    /// One blob per class, raised along that class's own axis
    fn blobs(classes: usize, per_class: usize, seed: u64) -> (Array2<f64>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n_features = classes + 1;
        let mut x = Array2::zeros((classes * per_class, n_features));
        let mut y = Vec::with_capacity(classes * per_class);
        for c in 0..classes {
            for j in 0..per_class {
                let row = c * per_class + j;
                for f in 0..n_features {
                    x[[row, f]] = rng.gen_range(-0.5..0.5);
                }
                x[[row, c]] += 4.0;
                y.push(c);
            }
        }
        (x, y)
    }

    fn accuracy(kind: ClassifierKind, classes: usize) -> f64 {
        let (x, y) = blobs(classes, 12, 9);
        let model = kind.fit(&x, &y).expect("fit");
        let predicted = model.predict(&x).expect("predict");
        let hits = predicted.iter().zip(&y).filter(|(p, t)| p == t).count();
        hits as f64 / y.len() as f64
    }

    #[test]
    fn test_roster_names() {
        let names: Vec<String> = ClassifierKind::roster().iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["SVM", "LDA", "KNN n=1", "KNN n=2", "KNN n=3", "KNN n=4", "KNN n=5"]
        );
    }

    #[test]
    fn test_every_classifier_separates_blobs() {
        for kind in ClassifierKind::roster() {
            assert!(accuracy(kind, 2) > 0.95, "{kind} binary");
            assert!(accuracy(kind, 4) > 0.9, "{kind} multiclass");
        }
    }

    #[test]
    fn test_svm_binary_uses_single_model() {
        let (x, y) = blobs(2, 10, 1);
        match ClassifierKind::LinearSvc.fit(&x, &y).expect("fit") {
            FittedClassifier::Linear { coef, classes, .. } => {
                assert_eq!(coef.nrows(), 1);
                assert_eq!(classes, vec![0, 1]);
            }
            FittedClassifier::Knn { .. } => panic!("expected a linear model"),
        }
    }

    #[test]
    fn test_svm_reports_convergence() {
        let (x, y) = blobs(3, 10, 6);
        let model = ClassifierKind::LinearSvc.fit(&x, &y).expect("fit");
        assert!(model.converged());

        // one pass from zero cannot meet the tolerance on overlapping classes
        let mut rng = StdRng::seed_from_u64(8);
        let noisy = Array2::from_shape_fn((30, 3), |_| rng.gen_range(-1.0..1.0));
        let signs: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let (_, _, converged) = svc_dual_cd(&noisy, &signs, 1);
        assert!(!converged);
    }

    #[test]
    fn test_single_class_predicts_it() {
        let x = array![[0.0, 1.0], [1.0, 0.0]];
        for kind in [ClassifierKind::LinearSvc, ClassifierKind::Lda] {
            let model = kind.fit(&x, &[3, 3]).expect("fit");
            let predicted = model.predict(&array![[5.0, 5.0]]).expect("predict");
            assert_eq!(predicted[0], 3);
        }
    }

    #[test]
    fn test_knn_tie_goes_to_smallest_label() {
        let x = array![[0.0], [1.0], [10.0]];
        let model = ClassifierKind::Knn(2).fit(&x, &[4, 2, 4]).expect("fit");
        let predicted = model.predict(&array![[0.5]]).expect("predict");
        assert_eq!(predicted[0], 2);
    }

    #[test]
    fn test_lda_with_more_features_than_samples() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = Array2::from_shape_fn((8, 20), |(i, j)| {
            let shift = if i < 4 { 2.0 } else { -2.0 };
            (if j == 0 { shift } else { 0.0 }) + rng.gen_range(-0.3..0.3)
        });
        let y = [0, 0, 0, 0, 1, 1, 1, 1];
        let model = ClassifierKind::Lda.fit(&x, &y).expect("fit");
        let predicted = model.predict(&x).expect("predict");
        assert_eq!(predicted.to_vec(), y.to_vec());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let x = Array2::zeros((3, 2));
        assert!(matches!(
            ClassifierKind::Lda.fit(&x, &[0, 1]),
            Err(FcError::Shape(_))
        ));
    }
}
