//! Analysis pipeline that orchestrates signal extraction, connectivity and classification

use crate::cache::DiskCache;
use crate::datasets::Dataset;
use crate::ml::classifiers::ClassifierKind;
use crate::ml::connectivity::{estimate_connectivity, ConnectivityMeasure};
use crate::ml::cross_validation::{cross_val_score, StratifiedShuffleSplit};
use crate::ml::features::vectorize;
use crate::ml::stats::mean_std;
use crate::signals::SignalExtractor;
use crate::structs::{
    AnalysisConfig, AtlasImage, AveragingStrategy, Cohort, ConnectivityKind, FcError, LabelType,
    Result, ScoreEntry, ScoreTable,
};
use log::info;
use ndarray::Array3;

impl AnalysisConfig {
    /// Check the configuration against the number of subjects it will run on
    ///
    /// # Errors
    /// Returns a configuration error describing the first invalid setting
    pub fn validate(&self, n_subjects: usize) -> Result<()> {
        if self.site_block_size == 0 {
            return Err(FcError::Config("site block size must be positive".into()));
        }
        if self.averaging == AveragingStrategy::SiteGrouped && n_subjects % self.site_block_size != 0
        {
            return Err(FcError::Config(format!(
                "site-grouped averaging needs a multiple of {} subjects, got {n_subjects}",
                self.site_block_size
            )));
        }
        if self.kinds.is_empty() {
            return Err(FcError::Config("no connectivity kinds selected".into()));
        }
        if !(self.cv.test_size > 0.0 && self.cv.test_size < 1.0) {
            return Err(FcError::Config(format!(
                "test size must be in (0, 1), got {}",
                self.cv.test_size
            )));
        }
        if self.cv.n_splits == 0 {
            return Err(FcError::Config("at least one split is required".into()));
        }
        if self.signal.t_r <= 0.0 {
            return Err(FcError::Config(format!(
                "repetition time must be positive, got {}",
                self.signal.t_r
            )));
        }
        if let Some(cutoff) = self.signal.high_pass {
            if cutoff <= 0.0 {
                return Err(FcError::Config(format!(
                    "high-pass cutoff must be positive, got {cutoff}"
                )));
            }
        }
        if !(self.signal.hv_percentile > 0.0 && self.signal.hv_percentile <= 100.0) {
            return Err(FcError::Config(format!(
                "high-variance percentile must be in (0, 100], got {}",
                self.signal.hv_percentile
            )));
        }
        Ok(())
    }
}

/// Validate the configuration and extract every subject's cleaned series
///
/// # Errors
/// Returns error if the configuration is invalid or any subject fails
pub fn build_cohort(
    dataset: &Dataset,
    atlas: &AtlasImage,
    config: &AnalysisConfig,
    cache: &DiskCache,
) -> Result<Cohort> {
    config.validate(dataset.len())?;
    info!(
        "Extracting {} regions for {} subjects",
        atlas.atlas.n_regions(),
        dataset.len()
    );
    let extractor = SignalExtractor::new(atlas, &config.signal, cache);
    extractor.extract_cohort(dataset, config.site_block_size)
}

/// Connectivity matrices of every configured kind
///
/// # Errors
/// Returns error if estimation fails for any kind
pub fn compute_connectivity(
    cohort: &Cohort,
    config: &AnalysisConfig,
) -> Result<Vec<(ConnectivityKind, Array3<f64>)>> {
    config
        .kinds
        .iter()
        .map(|&kind| {
            let measure = ConnectivityMeasure::new(kind, config.cov_estimator);
            let matrices = estimate_connectivity(
                cohort,
                &measure,
                config.averaging,
                config.site_block_size,
            )?;
            Ok((kind, matrices))
        })
        .collect()
}

/// Cross-validated accuracy for every (label, kind, classifier) combination
///
/// Splits are stratified on the joint site/diagnosis key and drawn once, so every
/// combination is scored on the same partitions.
///
/// # Errors
/// Returns error if splitting or any classifier fails
pub fn evaluate(
    cohort: &Cohort,
    connectivity: &[(ConnectivityKind, Array3<f64>)],
    config: &AnalysisConfig,
) -> Result<ScoreTable> {
    let splits = StratifiedShuffleSplit::from(&config.cv).split(&cohort.joint_labels())?;
    info!("Drew {} stratified splits", splits.len());

    let features: Vec<_> = connectivity
        .iter()
        .map(|(kind, matrices)| (*kind, vectorize(matrices)))
        .collect();

    let mut table = ScoreTable::default();
    for label in LabelType::ALL {
        info!("-- {} classification ...", label.display_name());
        let y = cohort.labels(label);
        for (kind, x) in &features {
            for classifier in ClassifierKind::roster() {
                let scores = cross_val_score(classifier, x, y, &splits)?;
                let (mean, std) = mean_std(&scores);
                table.entries.push(ScoreEntry {
                    label,
                    kind: *kind,
                    classifier: classifier.to_string(),
                    mean,
                    std,
                });
            }
        }
    }
    Ok(table)
}

/// Run the full analysis on a dataset
///
/// # Errors
/// Returns error if any stage fails; no partial results are returned
pub fn run_pipeline(
    dataset: &Dataset,
    atlas: &AtlasImage,
    config: &AnalysisConfig,
    cache: &DiskCache,
) -> Result<ScoreTable> {
    let cohort = build_cohort(dataset, atlas, config, cache)?;
    let connectivity = compute_connectivity(&cohort, config)?;
    evaluate(&cohort, &connectivity, config)
}
