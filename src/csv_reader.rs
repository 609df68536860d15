use crate::structs::{CsvData, FcError, Result};
use csv::ReaderBuilder;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

impl CsvData {
    /// Parse a CSV or TSV file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path, is_tsv: bool) -> Result<Self> {
        let delimiter = if is_tsv { b'\t' } else { b',' };

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|s| s.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            let row: Vec<String> = record.iter().map(ToString::to_string).collect();
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    /// Parse a file whose delimiter (tab or comma) is sniffed from its header line
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file_sniffed(path: &Path) -> Result<Self> {
        let mut header = String::new();
        BufReader::new(File::open(path)?).read_line(&mut header)?;
        Self::from_file(path, header.contains('\t'))
    }

    /// Numeric columns as a (rows x columns) matrix
    ///
    /// # Errors
    /// Returns error if there are no numeric columns or a numeric column holds a
    /// value that does not parse
    pub fn numeric_matrix(&self) -> Result<Array2<f64>> {
        let numeric_cols = self.numeric_column_indices();
        if numeric_cols.is_empty() {
            return Err(FcError::Shape("No numeric columns found".into()));
        }

        let mut matrix = Array2::zeros((self.row_count(), numeric_cols.len()));
        for (j, &col_idx) in numeric_cols.iter().enumerate() {
            let column = self.column(col_idx).unwrap_or_default();
            for (i, value) in column.iter().enumerate() {
                matrix[[i, j]] = value.parse::<f64>().map_err(|_| {
                    FcError::Shape(format!(
                        "row {} column '{}' is not numeric: '{value}'",
                        i + 1,
                        self.headers[col_idx]
                    ))
                })?;
            }
        }
        Ok(matrix)
    }
}

/// Read a confound file into a (time points x regressors) matrix
///
/// # Errors
/// Returns error if the file is missing, has no numeric columns, or holds malformed values
pub fn read_confounds(path: &Path) -> Result<Array2<f64>> {
    CsvData::from_file_sniffed(path)?.numeric_matrix()
}

/// Write a square matrix as headerless CSV
///
/// # Errors
/// Returns error if the file cannot be written
pub fn write_matrix(path: &Path, matrix: &Array2<f64>) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for row in matrix.rows() {
        writer.write_record(row.iter().map(|v| format!("{v:.10e}")))?;
    }
    writer.flush()?;
    Ok(())
}
