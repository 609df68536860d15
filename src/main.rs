#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::uninlined_format_args)]

mod cache;
mod csv_reader;
mod datasets;
mod ml;
mod signals;
mod structs;

use cache::DiskCache;
use clap::{Parser, Subcommand, ValueEnum};
use datasets::Dataset;
use env_logger::Env;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use structs::{
    AnalysisConfig, AtlasImage, AveragingStrategy, ConnectivityKind, CovEstimator, CvConfig,
    FcError, Result, SignalConfig,
};

/// fconn - functional connectivity estimation and site/diagnosis classification
#[derive(Parser, Debug)]
#[command(name = "fconn")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download every remote file of a dataset manifest
    Fetch {
        /// Dataset manifest (CSV with func, confounds, adhd columns)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Directory downloaded files are stored in
        #[arg(short, long, default_value = "./fconn_data")]
        data_dir: PathBuf,

        /// Atlas image path or URL to fetch alongside the scans
        #[arg(short, long)]
        atlas: Option<String>,
    },

    /// Run the full analysis: signals, connectivity, cross-validated classification
    Analyze {
        #[command(flatten)]
        input: InputArgs,

        /// Output directory for scores and charts
        #[arg(short, long, default_value = "./fconn_output")]
        output_dir: PathBuf,

        /// Connectivity kinds to evaluate (default: all)
        #[arg(long, value_delimiter = ',', value_parser = parse_kind)]
        kinds: Vec<ConnectivityKind>,

        /// Number of stratified shuffle splits
        #[arg(long, default_value = "10000")]
        n_splits: usize,

        /// Held-out fraction of each split
        #[arg(long, default_value = "0.33")]
        test_size: f64,

        /// Seed of the split generator
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Estimate one connectivity kind and write the per-subject matrices as CSV
    Connectivity {
        #[command(flatten)]
        input: InputArgs,

        /// Connectivity kind (correlation, partial-correlation, tangent, covariance, precision)
        #[arg(short, long, value_parser = parse_kind)]
        kind: ConnectivityKind,

        /// Output directory for the matrices
        #[arg(short, long, default_value = "./fconn_matrices")]
        output_dir: PathBuf,
    },
}

/// Options shared by every phase that extracts signals
#[derive(clap::Args, Debug)]
struct InputArgs {
    /// Dataset manifest (CSV with func, confounds, adhd columns)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Atlas image path or URL (3-D labels or 4-D probabilistic maps)
    #[arg(short, long)]
    atlas: String,

    /// Directory remote files are downloaded to
    #[arg(short, long, default_value = "./fconn_data")]
    data_dir: PathBuf,

    /// Directory for memoized confounds and region signals
    #[arg(long, default_value = "./fconn_cache")]
    cache_dir: PathBuf,

    /// Recompute everything instead of using the disk cache
    #[arg(long)]
    no_cache: bool,

    /// Number of subjects to process (0 = all)
    #[arg(short, long, default_value = "40")]
    n_subjects: usize,

    /// Subjects per acquisition site block
    #[arg(long, default_value = "8")]
    site_block_size: usize,

    /// Which subjects share a group reference
    #[arg(long, value_enum, default_value = "global")]
    averaging: AveragingArg,

    /// Base covariance estimator
    #[arg(long, value_enum, default_value = "empirical")]
    estimator: EstimatorArg,

    /// Z-score each cleaned region series
    #[arg(long)]
    standardize: bool,

    /// Repetition time in seconds
    #[arg(long, default_value = "2.5")]
    t_r: f64,

    /// High-pass cutoff in Hz (0 = no filter)
    #[arg(long, default_value = "0.01")]
    high_pass: f64,

    /// High-variance confounds extracted per scan
    #[arg(long, default_value = "5")]
    n_confounds: usize,

    /// Percentage of highest-variance voxels used for those confounds
    #[arg(long, default_value = "2.0")]
    hv_percentile: f64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AveragingArg {
    Global,
    SiteGrouped,
    DiagnosisGrouped,
}

impl From<AveragingArg> for AveragingStrategy {
    fn from(arg: AveragingArg) -> Self {
        match arg {
            AveragingArg::Global => Self::Global,
            AveragingArg::SiteGrouped => Self::SiteGrouped,
            AveragingArg::DiagnosisGrouped => Self::DiagnosisGrouped,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EstimatorArg {
    Empirical,
    LedoitWolf,
}

impl From<EstimatorArg> for CovEstimator {
    fn from(arg: EstimatorArg) -> Self {
        match arg {
            EstimatorArg::Empirical => Self::Empirical,
            EstimatorArg::LedoitWolf => Self::LedoitWolf,
        }
    }
}

fn parse_kind(value: &str) -> std::result::Result<ConnectivityKind, String> {
    ConnectivityKind::from_name(value).ok_or_else(|| format!("unknown connectivity kind '{value}'"))
}

impl InputArgs {
    fn config(&self) -> AnalysisConfig {
        AnalysisConfig {
            n_subjects: (self.n_subjects > 0).then_some(self.n_subjects),
            site_block_size: self.site_block_size,
            averaging: self.averaging.into(),
            cov_estimator: self.estimator.into(),
            kinds: ConnectivityKind::ALL.to_vec(),
            signal: SignalConfig {
                t_r: self.t_r,
                high_pass: (self.high_pass > 0.0).then_some(self.high_pass),
                n_confounds: self.n_confounds,
                hv_percentile: self.hv_percentile,
                standardize: self.standardize,
            },
            cv: CvConfig::default(),
        }
    }

    fn cache(&self) -> DiskCache {
        if self.no_cache {
            DiskCache::disabled()
        } else {
            DiskCache::new(&self.cache_dir)
        }
    }
}

/// Dataset and atlas, loaded for a signal-extracting phase
struct Inputs {
    dataset: Dataset,
    atlas: AtlasImage,
}

fn load_inputs(input: &InputArgs, config: &AnalysisConfig) -> Result<Inputs> {
    if !input.manifest.exists() {
        return Err(FcError::Config(format!(
            "Manifest not found: {}",
            input.manifest.display()
        )));
    }

    let dataset = Dataset::load(&input.manifest, &input.data_dir, config.n_subjects)?;
    if dataset.is_empty() {
        return Err(FcError::Config(format!(
            "{} lists no subjects",
            input.manifest.display()
        )));
    }
    info!("Loaded {} subjects from {}", dataset.len(), input.manifest.display());

    let atlas_path = datasets::resolve_entry(&input.atlas, Path::new("."), &input.data_dir)?;
    let (atlas, affine) = signals::image::load_atlas(&atlas_path)?;
    let key = DiskCache::file_key(&atlas_path)?;
    info!(
        "Atlas {} has {} regions",
        atlas_path.display(),
        atlas.n_regions()
    );

    Ok(Inputs {
        dataset,
        atlas: AtlasImage { atlas, affine, key },
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Fetch {
            manifest,
            data_dir,
            atlas,
        }) => run_fetch(&manifest, &data_dir, atlas.as_deref()),

        Some(Commands::Analyze {
            input,
            output_dir,
            kinds,
            n_splits,
            test_size,
            seed,
        }) => {
            let mut config = input.config();
            if !kinds.is_empty() {
                config.kinds = kinds;
            }
            config.cv = CvConfig {
                n_splits,
                test_size,
                seed,
            };
            run_analyze(&input, &output_dir, &config)
        }

        Some(Commands::Connectivity {
            input,
            kind,
            output_dir,
        }) => run_connectivity(&input, kind, &output_dir),

        None => {
            eprintln!(
                "No subcommand provided. Use 'fconn fetch', 'fconn analyze' or 'fconn connectivity'."
            );
            eprintln!("Run 'fconn --help' for usage information.");
            std::process::exit(1);
        }
    }
}

/// Download the dataset and write a localized manifest
fn run_fetch(manifest: &Path, data_dir: &Path, atlas: Option<&str>) -> Result<()> {
    if !manifest.exists() {
        return Err(FcError::Config(format!(
            "Manifest not found: {}",
            manifest.display()
        )));
    }

    let localized = datasets::localize_manifest(manifest, data_dir)?;
    if let Some(atlas) = atlas {
        let path = datasets::resolve_entry(atlas, Path::new("."), data_dir)?;
        info!("Atlas available at {}", path.display());
    }

    info!("Dataset ready, use --manifest {}", localized.display());
    Ok(())
}

/// Run the analysis phase and write the report
fn run_analyze(input: &InputArgs, output_dir: &Path, config: &AnalysisConfig) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    let inputs = load_inputs(input, config)?;

    let scores = ml::pipeline::run_pipeline(
        &inputs.dataset,
        &inputs.atlas,
        config,
        &input.cache(),
    )?;

    info!("Scored {} configurations", scores.len());
    ml::output::print_scores(&scores);

    info!("Writing output files...");
    let json = ml::output::write_scores_json(output_dir, &scores, config)?;
    let charts = ml::output::plot_scores(output_dir, &scores, config)?;

    info!("Output written to {}", output_dir.display());
    for path in std::iter::once(&json).chain(&charts) {
        info!("  - {}", path.display());
    }
    Ok(())
}

/// Estimate one connectivity kind and dump the matrices
fn run_connectivity(input: &InputArgs, kind: ConnectivityKind, output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    let mut config = input.config();
    config.kinds = vec![kind];
    let inputs = load_inputs(input, &config)?;

    let cohort = ml::pipeline::build_cohort(
        &inputs.dataset,
        &inputs.atlas,
        &config,
        &input.cache(),
    )?;
    let measure = ml::connectivity::ConnectivityMeasure::new(kind, config.cov_estimator);
    let matrices = ml::connectivity::estimate_connectivity(
        &cohort,
        &measure,
        config.averaging,
        config.site_block_size,
    )?;

    let ids: Vec<String> = inputs
        .dataset
        .subjects
        .iter()
        .map(|s| s.id.clone())
        .collect();
    let written = ml::output::write_matrices(output_dir, &ids, kind, &matrices)?;
    info!(
        "Wrote {} {} matrices to {}",
        written.len(),
        kind,
        output_dir.display()
    );
    Ok(())
}
