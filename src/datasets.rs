//! Dataset acquisition: manifest parsing and remote file fetching

use crate::structs::{CsvData, FcError, Result, SubjectRecord};
use log::info;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Subjects listed by a dataset manifest, in manifest order
#[derive(Debug, Clone)]
pub struct Dataset {
    pub subjects: Vec<SubjectRecord>,
}

impl Dataset {
    /// Load a manifest, fetching remote entries into `data_dir`
    ///
    /// The manifest is a CSV with columns `func` and `adhd` (0/1), and optionally
    /// `confounds` and `subject`. Only the first `n_subjects` rows are used.
    ///
    /// # Errors
    /// Returns error if the manifest is malformed or a file cannot be fetched
    pub fn load(manifest: &Path, data_dir: &Path, n_subjects: Option<usize>) -> Result<Self> {
        let csv = CsvData::from_file_sniffed(manifest)?;
        let base = manifest.parent().unwrap_or_else(|| Path::new("."));

        let func_col = required_column(&csv, "func")?;
        let adhd_col = required_column(&csv, "adhd")?;
        let confounds_col = csv.column_index("confounds");
        let subject_col = csv.column_index("subject");

        let limit = n_subjects.unwrap_or(csv.row_count());
        if limit > csv.row_count() {
            return Err(FcError::Config(format!(
                "{limit} subjects requested but the manifest lists {}",
                csv.row_count()
            )));
        }

        let mut subjects = Vec::with_capacity(limit);
        for (i, row) in csv.rows.iter().take(limit).enumerate() {
            let cell = |col: usize| row.get(col).map_or("", |s| s.trim());

            let func = resolve_entry(cell(func_col), base, data_dir)?;
            let confounds = match confounds_col.map(cell) {
                Some(entry) if !entry.is_empty() => Some(resolve_entry(entry, base, data_dir)?),
                _ => None,
            };
            let diagnosis = parse_flag(cell(adhd_col)).ok_or_else(|| {
                FcError::Config(format!(
                    "manifest row {}: adhd must be 0 or 1, got '{}'",
                    i + 1,
                    cell(adhd_col)
                ))
            })?;
            let id = subject_col
                .map(cell)
                .filter(|s| !s.is_empty())
                .map_or_else(|| format!("sub-{i:03}"), ToString::to_string);

            subjects.push(SubjectRecord {
                id,
                func,
                confounds,
                diagnosis,
            });
        }

        Ok(Self { subjects })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Diagnosis flags, index-aligned with `subjects`
    #[must_use]
    pub fn diagnosis(&self) -> Vec<usize> {
        self.subjects.iter().map(|s| s.diagnosis).collect()
    }

    /// Site index of each subject under the contiguous-block convention
    #[must_use]
    pub fn site_labels(&self, block_size: usize) -> Vec<usize> {
        site_labels(self.subjects.len(), block_size)
    }
}

/// Site index `i / block_size` for each of `n` subjects
#[must_use]
pub fn site_labels(n: usize, block_size: usize) -> Vec<usize> {
    (0..n).map(|i| i / block_size.max(1)).collect()
}

fn required_column(csv: &CsvData, name: &str) -> Result<usize> {
    csv.column_index(name)
        .ok_or_else(|| FcError::Config(format!("manifest has no '{name}' column")))
}

fn parse_flag(value: &str) -> Option<usize> {
    match value.parse::<f64>().ok()? {
        v if v == 0.0 => Some(0),
        v if v == 1.0 => Some(1),
        _ => None,
    }
}

#[must_use]
pub fn is_remote(entry: &str) -> bool {
    entry.starts_with("http://") || entry.starts_with("https://")
}

/// Turn a manifest entry into a local path, downloading it if it is a URL
///
/// # Errors
/// Returns error if the entry is empty, missing on disk, or cannot be downloaded
pub fn resolve_entry(entry: &str, base: &Path, data_dir: &Path) -> Result<PathBuf> {
    if entry.is_empty() {
        return Err(FcError::Config("empty file entry in manifest".into()));
    }
    if is_remote(entry) {
        return fetch_file(entry, data_dir);
    }

    let path = Path::new(entry);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    if !path.exists() {
        return Err(FcError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        )));
    }
    Ok(path)
}

/// Where a URL is stored under `data_dir`: `<host>/<path segments>`
///
/// The whole path is kept so that files sharing a basename on different paths stay
/// distinct.
fn url_local_path(url: &str) -> Option<PathBuf> {
    let without_query = url.split(['?', '#']).next()?;
    let rest = without_query.split_once("://").map_or(without_query, |(_, r)| r);
    let mut parts = rest.split('/');
    let host = parts
        .next()
        .filter(|h| !h.is_empty() && *h != "." && *h != ".." && !h.contains('\\'))?;

    let mut local = PathBuf::from(host.replace(':', "_"));
    let mut has_file = false;
    for segment in parts.filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains(['\\', ':']) {
            return None;
        }
        local.push(segment);
        has_file = true;
    }
    // a trailing slash names a directory, not a file
    (has_file && !without_query.ends_with('/')).then_some(local)
}

/// Download `url` into `data_dir` unless it is already there
///
/// # Errors
/// Returns error if the request fails or the file cannot be written
pub fn fetch_file(url: &str, data_dir: &Path) -> Result<PathBuf> {
    let local = url_local_path(url)
        .ok_or_else(|| FcError::Config(format!("cannot derive a file path from {url}")))?;
    let target = data_dir.join(local);
    if target.exists() {
        return Ok(target);
    }

    let parent = target.parent().unwrap_or(data_dir);
    fs::create_dir_all(parent)?;
    info!("Downloading {url}");

    let response = ureq::get(url).timeout(FETCH_TIMEOUT).call()?;
    let mut part_name = target.file_name().unwrap_or_default().to_os_string();
    part_name.push(".part");
    let part = parent.join(part_name);
    {
        let mut reader = response.into_reader();
        let mut file = File::create(&part)?;
        io::copy(&mut reader, &mut file)?;
    }
    fs::rename(&part, &target)?;
    Ok(target)
}

/// Fetch every remote entry of a manifest and write a local copy of it
///
/// Returns the path of the localized manifest (`<data_dir>/manifest.csv`).
///
/// # Errors
/// Returns error if the manifest is malformed or a download fails
pub fn localize_manifest(manifest: &Path, data_dir: &Path) -> Result<PathBuf> {
    let csv = CsvData::from_file_sniffed(manifest)?;
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    let file_cols: Vec<usize> = ["func", "confounds"]
        .iter()
        .filter_map(|name| csv.column_index(name))
        .collect();

    fs::create_dir_all(data_dir)?;
    let out_path = data_dir.join("manifest.csv");
    let mut writer = csv::Writer::from_path(&out_path)?;
    writer.write_record(&csv.headers)?;

    for row in &csv.rows {
        let mut localized = row.clone();
        for &col in &file_cols {
            if let Some(entry) = row.get(col).map(|s| s.trim()).filter(|s| !s.is_empty()) {
                let path = resolve_entry(entry, base, data_dir)?;
                localized[col] = fs::canonicalize(&path)?.display().to_string();
            }
        }
        writer.write_record(&localized)?;
    }
    writer.flush()?;

    info!(
        "Localized {} manifest rows into {}",
        csv.row_count(),
        out_path.display()
    );
    Ok(out_path)
}
