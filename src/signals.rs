//! Per-subject signal extraction: atlas masking, confound computation and cleaning

pub mod clean;
pub mod confounds;
pub mod image;
pub mod masker;
pub mod resample;

use crate::cache::DiskCache;
use crate::csv_reader::read_confounds;
use crate::datasets::Dataset;
use crate::structs::{Affine, AtlasImage, Cohort, FcError, Result, SignalConfig, SubjectRecord};
use log::info;
use ndarray::{Array2, Array4};
use std::path::Path;

/// Turns subject scans into cleaned region time series with one shared atlas
pub struct SignalExtractor<'a> {
    atlas: &'a AtlasImage,
    config: &'a SignalConfig,
    cache: &'a DiskCache,
}

impl<'a> SignalExtractor<'a> {
    #[must_use]
    pub const fn new(atlas: &'a AtlasImage, config: &'a SignalConfig, cache: &'a DiskCache) -> Self {
        Self {
            atlas,
            config,
            cache,
        }
    }

    /// Cleaned (time points x regions) series of one subject
    ///
    /// High-variance confounds come from the scan as acquired; region signals are taken
    /// after resampling the scan onto the atlas grid. Both are memoized in the disk
    /// cache. The scan is read at most once, and not at all when both are cached.
    ///
    /// # Errors
    /// Returns error if a file is missing or malformed, or shapes disagree
    pub fn extract(&self, subject: &SubjectRecord) -> Result<Array2<f64>> {
        let func_key = DiskCache::file_key(&subject.func)?;
        let mut volume: Option<(Array4<f64>, Affine)> = None;

        info!("-- Computing confounds for {}", subject.id);
        let confound_args = vec![
            func_key.clone(),
            self.config.n_confounds.to_string(),
            self.config.hv_percentile.to_string(),
        ];
        let hv_confounds: Array2<f64> =
            self.cache
                .cached("high_variance_confounds", &confound_args, || {
                    let (func, _) = volume.insert(image::load_functional(&subject.func)?);
                    confounds::high_variance_confounds(
                        &func.view(),
                        self.config.n_confounds,
                        self.config.hv_percentile,
                    )
                })?;

        info!("-- Computing region signals for {}", subject.id);
        let atlas = &self.atlas.atlas;
        let signal_args = vec![func_key, self.atlas.key.clone()];
        let mut signals: Array2<f64> = self.cache.cached("region_signals", &signal_args, || {
            let (func, affine) = match volume.take() {
                Some(v) => v,
                None => image::load_functional(&subject.func)?,
            };
            let func = resample::resample_to_grid(
                func,
                &affine,
                &self.atlas.affine,
                atlas.spatial_shape(),
            )?;
            atlas.transform(&func.view())
        })?;

        if signals.ncols() != atlas.n_regions() {
            return Err(FcError::Shape(format!(
                "{}: {} region signals for an atlas of {} regions",
                subject.id,
                signals.ncols(),
                atlas.n_regions()
            )));
        }

        let mut all_confounds = vec![hv_confounds];
        if let Some(path) = &subject.confounds {
            all_confounds.push(read_confounds(path)?);
        }

        clean::percent_signal_change(&mut signals);
        clean::clean(signals, &all_confounds, self.config)
            .map_err(|e| with_subject(e, &subject.id))
    }

    /// Extract every subject of the dataset, keeping manifest order
    ///
    /// # Errors
    /// Returns error on the first subject that fails, or if subjects disagree on shape
    pub fn extract_cohort(&self, dataset: &Dataset, site_block_size: usize) -> Result<Cohort> {
        let mut time_series = Vec::with_capacity(dataset.len());
        for (i, subject) in dataset.subjects.iter().enumerate() {
            info!(
                "Processing subject {}/{}: {}",
                i + 1,
                dataset.len(),
                display_name(&subject.func)
            );
            time_series.push(self.extract(subject)?);
        }
        Cohort::new(
            time_series,
            dataset.site_labels(site_block_size),
            dataset.diagnosis(),
        )
    }
}

fn with_subject(e: FcError, id: &str) -> FcError {
    match e {
        FcError::Shape(msg) => FcError::Shape(format!("{id}: {msg}")),
        other => other,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::Atlas;
    use nifti::writer::WriterOptions;
    use nifti::NiftiHeader;
    use ndarray::Array3;
    use std::fs::{self, File};
        use tempfile::TempDir;

    const FRAMES: usize = 30;

    /// Two label regions splitting a 4x4x2 grid along x
    fn label_atlas(affine: Affine) -> AtlasImage {
        let labels = Array3::from_shape_fn((4, 4, 2), |(x, _, _)| if x < 2 { 1 } else { 2 });
        AtlasImage {
            atlas: Atlas::from_labels(labels).expect("atlas"),
            affine,
            key: "labels-4x4x2".into(),
        }
    }

    /// Write a scan with an explicit voxel-to-world transform in its sform
    fn write_scan(path: &Path, shape: (usize, usize, usize), zoom: f32, phase: f64) {
        let data = Array4::from_shape_fn((shape.0, shape.1, shape.2, FRAMES), |(x, y, z, t)| {
            let drive = ((t as f64 + phase) * (0.3 + 0.1 * x as f64)).sin();
            100.0 + (x + 2 * y + z) as f64 + 5.0 * drive
        });
        let mut header = NiftiHeader::default();
        header.sform_code = 1;
        header.srow_x = [zoom, 0.0, 0.0, 0.0];
        header.srow_y = [0.0, zoom, 0.0, 0.0];
        header.srow_z = [0.0, 0.0, zoom, 0.0];
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&data)
            .expect("write scan");
    }

    fn subject(dir: &Path, i: usize) -> SubjectRecord {
        SubjectRecord {
            id: format!("sub-{i:03}"),
            func: dir.join(format!("sub-{i:03}.nii")),
            confounds: None,
            diagnosis: i % 2,
        }
    }

    #[test]
    fn test_cohort_series_match_atlas_and_scan_length() {
        let dir = TempDir::new().expect("create temp dir");
        let subjects: Vec<SubjectRecord> = (0..4).map(|i| subject(dir.path(), i)).collect();
        for (i, s) in subjects.iter().enumerate() {
            write_scan(&s.func, (4, 4, 2), 1.0, i as f64);
        }
        let dataset = Dataset { subjects };
        let atlas = label_atlas(Affine::identity());
        let config = SignalConfig::default();
        let cache = DiskCache::new(&dir.path().join("cache"));

        let cohort = SignalExtractor::new(&atlas, &config, &cache)
            .extract_cohort(&dataset, 2)
            .expect("extract");

        assert_eq!(cohort.n_subjects(), 4);
        for series in cohort.time_series() {
            assert_eq!(series.dim(), (FRAMES, 2));
            assert!(series.iter().all(|v| v.is_finite()));
        }
        assert_eq!(cohort.labels(crate::structs::LabelType::Sites), &[0, 0, 1, 1]);
    }

    #[test]
    fn test_second_run_reads_the_cache() {
        let dir = TempDir::new().expect("create temp dir");
        let s = subject(dir.path(), 0);
        write_scan(&s.func, (4, 4, 2), 1.0, 0.0);
        let atlas = label_atlas(Affine::identity());
        let config = SignalConfig::default();
        let cache = DiskCache::new(&dir.path().join("cache"));
        let extractor = SignalExtractor::new(&atlas, &config, &cache);

        let first = extractor.extract(&s).expect("first run");
        let modified = fs::metadata(&s.func).and_then(|m| m.modified()).expect("mtime");

        // same size and timestamp but different voxels: only a cache hit returns the old series
        write_scan(&s.func, (4, 4, 2), 1.0, 17.0);
        File::options()
            .write(true)
            .open(&s.func)
            .and_then(|f| f.set_modified(modified))
            .expect("restore mtime");
        let second = extractor.extract(&s).expect("second run");

        assert_eq!(first, second);
        let entries = fs::read_dir(dir.path().join("cache/region_signals")).expect("entries");
        assert_eq!(entries.count(), 1);

        // without the cache the rewritten scan gives a different series
        let uncached = DiskCache::disabled();
        let fresh = SignalExtractor::new(&atlas, &config, &uncached)
            .extract(&s)
            .expect("fresh run");
        assert_ne!(first, fresh);
    }

    #[test]
    fn test_scan_is_resampled_onto_the_atlas_grid() {
        let dir = TempDir::new().expect("create temp dir");
        let s = subject(dir.path(), 0);
        // 8x8x4 scan of 1 mm voxels under an atlas of 2 mm voxels
        write_scan(&s.func, (8, 8, 4), 1.0, 0.0);
        let atlas = label_atlas(Affine::scaled([2.0, 2.0, 2.0], [0.5, 0.5, 0.5]));
        let config = SignalConfig::default();
        let cache = DiskCache::disabled();

        let series = SignalExtractor::new(&atlas, &config, &cache)
            .extract(&s)
            .expect("extract");

        assert_eq!(series.dim(), (FRAMES, 2));
    }

    #[test]
    fn test_missing_scan_is_io_error() {
        let atlas = label_atlas(Affine::identity());
        let config = SignalConfig::default();
        let cache = DiskCache::disabled();
        let extractor = SignalExtractor::new(&atlas, &config, &cache);

        let subject = SubjectRecord {
            id: "sub-000".into(),
            func: "/nonexistent/scan.nii.gz".into(),
            confounds: None,
            diagnosis: 0,
        };

        assert!(matches!(extractor.extract(&subject), Err(FcError::Io(_))));
    }

    #[test]
    fn test_shape_errors_name_the_subject() {
        let e = with_subject(FcError::Shape("bad rows".into()), "sub-007");
        assert_eq!(e.to_string(), "Shape mismatch: sub-007: bad rows");
    }
}
