//! Report writers for the analyze and connectivity phases

use crate::csv_reader::write_matrix;
use crate::ml::classifiers::ClassifierKind;
use crate::structs::{
    AnalysisConfig, ConnectivityKind, FcError, LabelType, Result, ScoreEntry, ScoreTable,
};
use ndarray::Array3;
use plotters::prelude::*;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Bar colour per kind, in `ConnectivityKind::ALL` order
const KIND_COLORS: [RGBColor; 5] = [BLACK, CYAN, GREEN, BLUE, RED];
const ERROR_BAR_COLOR: RGBColor = RGBColor(110, 110, 110);
const BAR_WIDTH: f64 = 0.15;

/// One result line, as printed under a label header
#[must_use]
pub fn format_score(entry: &ScoreEntry) -> String {
    format!(
        " {}, classifier {}: score is {:.2} +- {:.2}",
        entry.kind, entry.classifier, entry.mean, entry.std
    )
}

/// Print every score, grouped by label type
pub fn print_scores(table: &ScoreTable) {
    if table.is_empty() {
        println!("No configurations were scored");
        return;
    }
    for label in LabelType::ALL {
        let mut entries = table.for_label(label).peekable();
        if entries.peek().is_none() {
            continue;
        }
        println!("-- {} classification ...", label.display_name());
        for entry in entries {
            println!("{}", format_score(entry));
        }
    }
}

/// Write `scores.json` - the score table and the configuration that produced it
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_scores_json(
    output_dir: &Path,
    table: &ScoreTable,
    config: &AnalysisConfig,
) -> Result<PathBuf> {
    let path = output_dir.join("scores.json");
    let output = ScoresOutput {
        config,
        scores: &table.entries,
    };
    let json = serde_json::to_string_pretty(&output)?;
    fs::write(&path, json)?;
    Ok(path)
}

/// Write one `<subject>_<kind>.csv` per subject
///
/// # Errors
/// Returns error if ids and matrices disagree in count or a file cannot be written
pub fn write_matrices(
    output_dir: &Path,
    subject_ids: &[String],
    kind: ConnectivityKind,
    matrices: &Array3<f64>,
) -> Result<Vec<PathBuf>> {
    if subject_ids.len() != matrices.dim().0 {
        return Err(FcError::Shape(format!(
            "{} subject ids for {} matrices",
            subject_ids.len(),
            matrices.dim().0
        )));
    }
    let slug = kind.name().replace(' ', "_");

    let mut written = Vec::with_capacity(subject_ids.len());
    for (id, matrix) in subject_ids.iter().zip(matrices.outer_iter()) {
        let path = output_dir.join(format!("{id}_{slug}.csv"));
        write_matrix(&path, &matrix.to_owned())?;
        written.push(path);
    }
    Ok(written)
}

/// Draw `<label>_accuracy.svg` for every label type present in the table
///
/// Bars are grouped by classifier, one bar per connectivity kind, with the standard
/// deviation as error bar.
///
/// # Errors
/// Returns error if a chart cannot be rendered or written
pub fn plot_scores(
    output_dir: &Path,
    table: &ScoreTable,
    config: &AnalysisConfig,
) -> Result<Vec<PathBuf>> {
    let classifiers: Vec<String> = ClassifierKind::roster()
        .iter()
        .map(ToString::to_string)
        .collect();

    let mut written = Vec::new();
    for label in LabelType::ALL {
        if table.for_label(label).next().is_none() {
            continue;
        }
        let path = output_dir.join(format!("{}_accuracy.svg", label.slug()));
        draw_label_chart(&path, table, label, &classifiers, config)?;
        written.push(path);
    }
    Ok(written)
}

#[allow(clippy::cast_precision_loss)]
fn draw_label_chart(
    path: &Path,
    table: &ScoreTable,
    label: LabelType,
    classifiers: &[String],
    config: &AnalysisConfig,
) -> Result<()> {
    let root = SVGBackend::new(path, (960, 540)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let title = format!(
        "{} classification ({}, standardize={})",
        label.display_name(),
        config.cov_estimator,
        config.signal.standardize
    );
    let n = classifiers.len() as f64;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20))
        .margin(12)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-0.5..n - 0.5, 0.0..1.05)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(classifiers.len())
        .x_label_formatter(&|x| tick_label(classifiers, *x))
        .y_desc("accuracy")
        .draw()
        .map_err(plot_err)?;

    let group_width = BAR_WIDTH * config.kinds.len() as f64;
    for kind in &config.kinds {
        let slot = ConnectivityKind::ALL
            .iter()
            .position(|k| k == kind)
            .unwrap_or(0);
        let color = KIND_COLORS[slot % KIND_COLORS.len()];
        let order = config.kinds.iter().position(|k| k == kind).unwrap_or(0);
        let offset = order as f64 * BAR_WIDTH - group_width / 2.0;

        let bars: Vec<(f64, f64, f64)> = classifiers
            .iter()
            .enumerate()
            .filter_map(|(c, name)| {
                table
                    .get(label, *kind, name)
                    .map(|e| (c as f64 + offset, e.mean, e.std))
            })
            .collect();

        chart
            .draw_series(bars.iter().map(|&(x, mean, _)| {
                Rectangle::new([(x, 0.0), (x + BAR_WIDTH, mean)], color.filled())
            }))
            .map_err(plot_err)?
            .label(kind.name())
            .legend(move |(x, y)| {
                Rectangle::new([(x, y - 5), (x + 10, y + 5)], color.filled())
            });

        chart
            .draw_series(bars.iter().map(|&(x, mean, std)| {
                ErrorBar::new_vertical(
                    x + BAR_WIDTH / 2.0,
                    (mean - std).max(0.0),
                    mean,
                    (mean + std).min(1.0),
                    ERROR_BAR_COLOR.stroke_width(1),
                    6,
                )
            }))
            .map_err(plot_err)?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

/// Classifier name at integer ticks, nothing in between
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn tick_label(classifiers: &[String], x: f64) -> String {
    let rounded = x.round();
    if rounded < 0.0 || (x - rounded).abs() > 1e-6 {
        return String::new();
    }
    classifiers
        .get(rounded as usize)
        .cloned()
        .unwrap_or_default()
}

fn plot_err<E: std::fmt::Display>(e: E) -> FcError {
    FcError::Io(io::Error::other(format!("chart rendering failed: {e}")))
}

// JSON output structures

#[derive(Serialize)]
struct ScoresOutput<'a> {
    config: &'a AnalysisConfig,
    scores: &'a [ScoreEntry],
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_table() -> ScoreTable {
        let mut table = ScoreTable::default();
        for label in LabelType::ALL {
            for kind in ConnectivityKind::ALL {
                for clf in ClassifierKind::roster() {
                    table.entries.push(ScoreEntry {
                        label,
                        kind,
                        classifier: clf.to_string(),
                        mean: 0.61,
                        std: 0.087,
                    });
                }
            }
        }
        table
    }

    #[test]
    fn test_format_score() {
        let entry = ScoreEntry {
            label: LabelType::Sites,
            kind: ConnectivityKind::PartialCorrelation,
            classifier: "KNN n=3".to_string(),
            mean: 0.456,
            std: 0.1,
        };
        assert_eq!(
            format_score(&entry),
            " partial correlation, classifier KNN n=3: score is 0.46 +- 0.10"
        );
    }

    #[test]
    fn test_write_scores_json() {
        let dir = TempDir::new().expect("create temp dir");
        let path = write_scores_json(dir.path(), &sample_table(), &AnalysisConfig::default())
            .expect("write scores");

        let content = fs::read_to_string(path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&content).expect("parse");
        assert_eq!(value["scores"].as_array().map(Vec::len), Some(70));
        assert_eq!(value["config"]["site_block_size"], 8);
        assert_eq!(value["scores"][0]["classifier"], "SVM");
    }

    #[test]
    fn test_plot_scores_writes_one_chart_per_label() {
        let dir = TempDir::new().expect("create temp dir");
        let written = plot_scores(dir.path(), &sample_table(), &AnalysisConfig::default())
            .expect("plot");

        assert_eq!(written.len(), 2);
        assert!(dir.path().join("sites_accuracy.svg").exists());
        let svg = fs::read_to_string(dir.path().join("adhd_accuracy.svg")).expect("read svg");
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_write_matrices() {
        let dir = TempDir::new().expect("create temp dir");
        let matrices = Array3::from_shape_fn((2, 3, 3), |(s, i, j)| (s + i * j) as f64);
        let ids = vec!["sub-000".to_string(), "sub-001".to_string()];

        let written =
            write_matrices(dir.path(), &ids, ConnectivityKind::PartialCorrelation, &matrices)
                .expect("write");

        assert_eq!(written.len(), 2);
        let content = fs::read_to_string(dir.path().join("sub-001_partial_correlation.csv"))
            .expect("read");
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.lines().next().map(|l| l.split(',').count()), Some(3));
    }

    #[test]
    fn test_tick_labels_only_at_integers() {
        let names = vec!["SVM".to_string(), "LDA".to_string()];
        assert_eq!(tick_label(&names, 1.0), "LDA");
        assert_eq!(tick_label(&names, 0.5), "");
        assert_eq!(tick_label(&names, 7.0), "");
    }
}
