//! Consolidated public types for the fconn crate
//!
//! This module contains all public structs, enums, and traits used across the crate.

use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum FcError {
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("HTTP error: {0}")]
    Http(Box<ureq::Error>),

    #[error("Linear algebra error: {0}")]
    Linalg(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("ML error: {0}")]
    Ml(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ureq::Error> for FcError {
    fn from(e: ureq::Error) -> Self {
        FcError::Http(Box::new(e))
    }
}

impl From<linfa_linalg::LinalgError> for FcError {
    fn from(e: linfa_linalg::LinalgError) -> Self {
        FcError::Linalg(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FcError>;

// ============================================================================
// CSV Types
// ============================================================================

/// Represents a parsed CSV/TSV file with headers and rows
#[derive(Debug, Clone)]
pub struct CsvData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvData {
    /// Get number of rows
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get number of columns
    #[must_use]
    pub fn col_count(&self) -> usize {
        self.headers.len()
    }

    /// Get column index by name (case-insensitive)
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }

    /// Get a column as a vector of strings
    #[must_use]
    pub fn column(&self, index: usize) -> Option<Vec<&str>> {
        if index >= self.headers.len() {
            return None;
        }
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).map_or("", |s| s.trim()))
                .collect(),
        )
    }

    /// Find columns that contain numeric data
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn numeric_column_indices(&self) -> Vec<usize> {
        (0..self.col_count())
            .filter(|&i| {
                self.column(i).is_some_and(|col| {
                    // Consider numeric if at least 50% of non-empty values parse as numbers
                    let non_empty: Vec<_> = col.iter().filter(|s| !s.is_empty()).collect();
                    if non_empty.is_empty() {
                        return false;
                    }
                    let numeric_count = non_empty
                        .iter()
                        .filter(|s| s.parse::<f64>().is_ok())
                        .count();
                    numeric_count as f64 / non_empty.len() as f64 >= 0.5
                })
            })
            .collect()
    }
}

// ============================================================================
// Dataset Types
// ============================================================================

/// One subject of the dataset: where its scan lives and its diagnosis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    pub id: String,
    /// 4-D functional scan
    pub func: PathBuf,
    /// Motion/physiological regressors, one row per scan volume
    pub confounds: Option<PathBuf>,
    /// 1 = diagnosed, 0 = control
    pub diagnosis: usize,
}

/// Brain atlas reducing voxels to regions. Shared read-only by every subject.
#[derive(Debug, Clone)]
pub enum Atlas {
    /// Integer label image; 0 is background, other labels are regions (ascending order)
    Labels { labels: Array3<i64>, regions: Vec<i64> },
    /// Probabilistic maps, one map per region along the last axis
    Maps { maps: Array4<f64> },
}

/// Voxel-to-world transform of an image grid: `world = linear · voxel + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub linear: [[f64; 3]; 3],
    pub offset: [f64; 3],
}

/// An atlas on its grid, plus the key identifying its file in the disk cache
#[derive(Debug, Clone)]
pub struct AtlasImage {
    pub atlas: Atlas,
    pub affine: Affine,
    pub key: String,
}

/// Cleaned time series and labels, index-aligned by subject
///
/// All three vectors are built together and never reordered independently.
#[derive(Debug, Clone)]
pub struct Cohort {
    time_series: Vec<Array2<f64>>,
    sites: Vec<usize>,
    diagnosis: Vec<usize>,
}

impl Cohort {
    /// Bundle per-subject series with their labels
    ///
    /// # Errors
    /// Returns error if the vectors are not the same length, or subjects disagree on
    /// time-point or region counts
    pub fn new(
        time_series: Vec<Array2<f64>>,
        sites: Vec<usize>,
        diagnosis: Vec<usize>,
    ) -> Result<Self> {
        if time_series.len() != sites.len() || time_series.len() != diagnosis.len() {
            return Err(FcError::Shape(format!(
                "{} subjects but {} site labels and {} diagnosis labels",
                time_series.len(),
                sites.len(),
                diagnosis.len()
            )));
        }
        if let Some(first) = time_series.first() {
            let expected = first.dim();
            for (i, ts) in time_series.iter().enumerate() {
                if ts.dim() != expected {
                    return Err(FcError::Shape(format!(
                        "subject {i} has {}x{} time series, expected {}x{}",
                        ts.nrows(),
                        ts.ncols(),
                        expected.0,
                        expected.1
                    )));
                }
            }
        }
        Ok(Self {
            time_series,
            sites,
            diagnosis,
        })
    }

    #[must_use]
    pub fn n_subjects(&self) -> usize {
        self.time_series.len()
    }

    #[must_use]
    pub fn n_regions(&self) -> usize {
        self.time_series.first().map_or(0, Array2::ncols)
    }

    #[must_use]
    pub fn time_series(&self) -> &[Array2<f64>] {
        &self.time_series
    }

    #[must_use]
    pub fn labels(&self, label: LabelType) -> &[usize] {
        match label {
            LabelType::Sites => &self.sites,
            LabelType::Diagnosis => &self.diagnosis,
        }
    }

    /// Joint stratification key `site * 2 + diagnosis`
    #[must_use]
    pub fn joint_labels(&self) -> Vec<usize> {
        self.sites
            .iter()
            .zip(&self.diagnosis)
            .map(|(&site, &dx)| site * 2 + dx)
            .collect()
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Base covariance estimator applied to each subject's time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovEstimator {
    /// Maximum-likelihood covariance
    Empirical,
    /// Ledoit-Wolf shrinkage towards a scaled identity
    LedoitWolf,
}

impl fmt::Display for CovEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empirical => write!(f, "EmpiricalCovariance"),
            Self::LedoitWolf => write!(f, "LedoitWolf"),
        }
    }
}

/// Which subjects share a group reference when fitting connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AveragingStrategy {
    /// One reference over all subjects
    Global,
    /// One reference per contiguous block of `site_block_size` subjects
    SiteGrouped,
    /// One reference for diagnosed subjects, one for controls
    DiagnosisGrouped,
}

impl fmt::Display for AveragingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::SiteGrouped => write!(f, "per-site"),
            Self::DiagnosisGrouped => write!(f, "per-diagnosis"),
        }
    }
}

/// Connectivity matrix kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectivityKind {
    Correlation,
    PartialCorrelation,
    Tangent,
    Covariance,
    Precision,
}

impl ConnectivityKind {
    /// Every kind, in report order
    pub const ALL: [Self; 5] = [
        Self::Correlation,
        Self::PartialCorrelation,
        Self::Tangent,
        Self::Covariance,
        Self::Precision,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Correlation => "correlation",
            Self::PartialCorrelation => "partial correlation",
            Self::Tangent => "tangent",
            Self::Covariance => "covariance",
            Self::Precision => "precision",
        }
    }

    /// Parse a kind name; `partial-correlation` and `partial_correlation` are accepted too
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace(['-', '_'], " ");
        Self::ALL.into_iter().find(|k| k.name() == normalized)
    }
}

impl fmt::Display for ConnectivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Label vectors predicted by the classifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LabelType {
    Sites,
    Diagnosis,
}

impl LabelType {
    pub const ALL: [Self; 2] = [Self::Sites, Self::Diagnosis];

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Sites => "sites",
            Self::Diagnosis => "ADHD/controls",
        }
    }

    /// File-name friendly name
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::Sites => "sites",
            Self::Diagnosis => "adhd",
        }
    }
}

/// Signal extraction and cleaning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Repetition time in seconds
    pub t_r: f64,
    /// High-pass cutoff in Hz, `None` disables the filter
    pub high_pass: Option<f64>,
    /// Number of high-variance confounds extracted from each scan
    pub n_confounds: usize,
    /// Percentage of highest-variance voxels used for those confounds
    pub hv_percentile: f64,
    /// Z-score each region's cleaned series
    pub standardize: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            t_r: 2.5,
            high_pass: Some(0.01),
            n_confounds: 5,
            hv_percentile: 2.0,
            standardize: false,
        }
    }
}

/// Stratified shuffle-split parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvConfig {
    pub n_splits: usize,
    pub test_size: f64,
    pub seed: u64,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            n_splits: 10_000,
            test_size: 0.33,
            seed: 0,
        }
    }
}

/// Configuration for the analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Cap on the number of subjects taken from the manifest
    pub n_subjects: Option<usize>,
    pub site_block_size: usize,
    pub averaging: AveragingStrategy,
    pub cov_estimator: CovEstimator,
    pub kinds: Vec<ConnectivityKind>,
    pub signal: SignalConfig,
    pub cv: CvConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            n_subjects: Some(40),
            site_block_size: 8,
            averaging: AveragingStrategy::Global,
            cov_estimator: CovEstimator::Empirical,
            kinds: ConnectivityKind::ALL.to_vec(),
            signal: SignalConfig::default(),
            cv: CvConfig::default(),
        }
    }
}

// ============================================================================
// Score Types
// ============================================================================

/// Cross-validated accuracy of one (label, kind, classifier) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub label: LabelType,
    pub kind: ConnectivityKind,
    pub classifier: String,
    pub mean: f64,
    pub std: f64,
}

/// Every evaluated configuration, in evaluation order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreTable {
    pub entries: Vec<ScoreEntry>,
}

impl ScoreTable {
    #[must_use]
    pub fn get(
        &self,
        label: LabelType,
        kind: ConnectivityKind,
        classifier: &str,
    ) -> Option<&ScoreEntry> {
        self.entries
            .iter()
            .find(|e| e.label == label && e.kind == kind && e.classifier == classifier)
    }

    /// Entries for one label type
    pub fn for_label(&self, label: LabelType) -> impl Iterator<Item = &ScoreEntry> {
        self.entries.iter().filter(move |e| e.label == label)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
