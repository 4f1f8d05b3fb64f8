//! Aggregation Step
//!
//! Pivots per-sample, per-stage count files into one table.
//!
//! Each input is named `<sample>.<stage><extension>`, e.g.
//! `counts/A.trimmed.count`, and starts with a number. The stage suffix is
//! mapped to a column label through the pipeline's stage convention:
//!
//! ```yaml
//! stages:
//!   extension: .count
//!   labels:
//!     - { suffix: raw, label: Raw }
//!     - { suffix: trimmed, label: Trimmed }
//! ```
//!
//! The stage is always the part after the last `.`, so sample keys may
//! themselves contain dots (`S.1.raw.count` is sample `S.1`). Constrain the
//! collected rule's `stage` wildcard to `[^/.]+` so its bindings split file
//! names the same way.
//!
//! Two artifacts are written: a TSV table (one row per sample, values in
//! millions) and a JSON summary record for report tools.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

fn default_extension() -> String {
    ".count".to_string()
}

/// Maps a stage suffix to its column label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLabel {
    pub suffix: String,
    pub label: String,
}

/// Ordered suffix → label table plus the extension stripped from inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConvention {
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default)]
    pub labels: Vec<StageLabel>,
}

impl Default for StageConvention {
    fn default() -> Self {
        Self {
            extension: default_extension(),
            labels: Vec::new(),
        }
    }
}

impl StageConvention {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, suffix: impl Into<String>, label: impl Into<String>) -> Self {
        self.labels.push(StageLabel {
            suffix: suffix.into(),
            label: label.into(),
        });
        self
    }

    /// Returns the label for a stage suffix.
    pub fn label_for(&self, suffix: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.suffix == suffix)
            .map(|l| l.label.as_str())
    }

    /// Splits an input path into `(sample, stage suffix)`.
    ///
    /// The configured extension is removed from the file name, then the rest
    /// is split at its last `.`.
    pub fn split_stage_key<'a>(&self, path: &'a str) -> Result<(&'a str, &'a str), AggregationError> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let stem = name.strip_suffix(self.extension.as_str()).unwrap_or(name);

        match stem.rsplit_once('.') {
            Some((sample, suffix)) if !sample.is_empty() && !suffix.is_empty() => {
                Ok((sample, suffix))
            }
            _ => Err(AggregationError::MalformedPath {
                path: path.to_string(),
            }),
        }
    }
}

/// Descriptive fields of the summary record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryInfo {
    pub id: String,
    pub section_name: String,
    pub description: String,
    pub plot_type: String,
}

/// Structured summary written next to the table.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub id: String,
    pub section_name: String,
    pub description: String,
    pub plot_type: String,
    pub columns: Vec<String>,
    pub samples: Vec<String>,
    pub data: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Samples × stage labels, values in millions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageTable {
    columns: Vec<String>,
    rows: BTreeMap<String, BTreeMap<String, f64>>,
}

impl StageTable {
    /// Builds the table from `(input path, raw count)` pairs.
    pub fn build(
        entries: &[(String, f64)],
        convention: &StageConvention,
    ) -> Result<Self, AggregationError> {
        let mut rows: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

        for (path, count) in entries {
            let (sample, suffix) = convention.split_stage_key(path)?;
            let label = convention.label_for(suffix).ok_or_else(|| {
                AggregationError::UnknownStageSuffix {
                    path: path.clone(),
                    suffix: suffix.to_string(),
                }
            })?;

            let row = rows.entry(sample.to_string()).or_default();
            if row.insert(label.to_string(), count / 1e6).is_some() {
                return Err(AggregationError::DuplicateEntry {
                    sample: sample.to_string(),
                    stage: label.to_string(),
                });
            }
        }

        // Labels in convention order, only those that occur.
        let columns = convention
            .labels
            .iter()
            .map(|l| l.label.clone())
            .filter(|label| rows.values().any(|row| row.contains_key(label)))
            .collect();

        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Sample names in sorted order.
    pub fn samples(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    pub fn value(&self, sample: &str, label: &str) -> Option<f64> {
        self.rows.get(sample)?.get(label).copied()
    }

    /// Renders the table as TSV. Missing cells are empty.
    pub fn to_tsv(&self) -> String {
        let mut out = String::from("sample");
        for column in &self.columns {
            out.push('\t');
            out.push_str(column);
        }
        out.push('\n');

        for (sample, row) in &self.rows {
            out.push_str(sample);
            for column in &self.columns {
                out.push('\t');
                if let Some(value) = row.get(column) {
                    out.push_str(&value.to_string());
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn summary(&self, info: &SummaryInfo) -> SummaryRecord {
        SummaryRecord {
            id: info.id.clone(),
            section_name: info.section_name.clone(),
            description: info.description.clone(),
            plot_type: info.plot_type.clone(),
            columns: self.columns.clone(),
            samples: self.samples(),
            data: self.rows.clone(),
        }
    }
}

/// Reads the first whitespace-separated token of a file as a number.
pub fn read_count(path: &Path, display: &str) -> Result<f64, AggregationError> {
    let content = fs::read_to_string(path).map_err(|source| AggregationError::Io {
        path: display.to_string(),
        source,
    })?;

    let token = content.split_whitespace().next().unwrap_or("");
    token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AggregationError::InvalidValue {
            path: display.to_string(),
            content: token.to_string(),
        })
}

/// Runs the aggregation over `inputs` (relative to `root`) and writes the
/// TSV table and JSON summary to the given paths.
pub fn aggregate(
    root: &Path,
    inputs: &[String],
    convention: &StageConvention,
    info: &SummaryInfo,
    table_path: &Path,
    summary_path: &Path,
) -> Result<StageTable, AggregationError> {
    if inputs.is_empty() {
        warn!("Aggregation '{}' has no inputs; writing an empty table", info.id);
    }

    let mut entries = Vec::with_capacity(inputs.len());
    for input in inputs {
        let count = read_count(&root.join(input), input)?;
        debug!("{}: {}", input, count);
        entries.push((input.clone(), count));
    }

    let table = StageTable::build(&entries, convention)?;

    fs::write(table_path, table.to_tsv()).map_err(|source| AggregationError::Io {
        path: table_path.display().to_string(),
        source,
    })?;

    let summary = serde_json::to_string_pretty(&table.summary(info))?;
    fs::write(summary_path, summary).map_err(|source| AggregationError::Io {
        path: summary_path.display().to_string(),
        source,
    })?;

    info!(
        "Aggregated {} file(s) into {} sample(s) x {} stage(s)",
        inputs.len(),
        table.rows.len(),
        table.columns.len()
    );

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::wildcards::Template;
    use tempfile::tempdir;

    fn convention() -> StageConvention {
        StageConvention::new(".count")
            .with_label("raw", "Raw")
            .with_label("trimmed", "Trimmed")
    }

    fn info() -> SummaryInfo {
        SummaryInfo {
            id: "read_counts".to_string(),
            section_name: "Read counts".to_string(),
            description: "Reads per stage".to_string(),
            plot_type: "bargraph".to_string(),
        }
    }

    #[test]
    fn test_split_stage_key() {
        let c = convention();
        assert_eq!(
            c.split_stage_key("counts/A.trimmed.count").unwrap(),
            ("A", "trimmed")
        );
        assert_eq!(
            c.split_stage_key("counts/S.1.raw.count").unwrap(),
            ("S.1", "raw")
        );
        assert!(matches!(
            c.split_stage_key("counts/A.count"),
            Err(AggregationError::MalformedPath { .. })
        ));
    }

    #[test]
    fn test_pivot_two_samples_two_stages() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("counts")).unwrap();
        let files = [
            ("counts/A.raw.count", "10\n"),
            ("counts/A.trimmed.count", "8\n"),
            ("counts/B.raw.count", "12 reads\n"),
            ("counts/B.trimmed.count", "9\n"),
        ];
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let inputs: Vec<String> = files.iter().map(|(n, _)| n.to_string()).collect();

        let table_path = dir.path().join("table.tsv");
        let summary_path = dir.path().join("summary.json");
        let table = aggregate(
            dir.path(),
            &inputs,
            &convention(),
            &info(),
            &table_path,
            &summary_path,
        )
        .unwrap();

        assert_eq!(table.samples(), vec!["A", "B"]);
        assert_eq!(table.columns(), &["Raw", "Trimmed"]);
        assert_eq!(table.value("A", "Raw"), Some(10.0 / 1e6));
        assert_eq!(table.value("A", "Trimmed"), Some(8.0 / 1e6));
        assert_eq!(table.value("B", "Raw"), Some(12.0 / 1e6));
        assert_eq!(table.value("B", "Trimmed"), Some(9.0 / 1e6));

        let tsv = fs::read_to_string(&table_path).unwrap();
        let mut lines = tsv.lines();
        assert_eq!(lines.next(), Some("sample\tRaw\tTrimmed"));
        assert_eq!(lines.next(), Some("A\t0.00001\t0.000008"));
        assert_eq!(lines.next(), Some("B\t0.000012\t0.000009"));

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
        assert_eq!(summary["id"], "read_counts");
        assert_eq!(summary["plot_type"], "bargraph");
        assert_eq!(summary["samples"], serde_json::json!(["A", "B"]));
        assert_eq!(summary["data"]["B"]["Raw"], serde_json::json!(12.0 / 1e6));
    }

    #[test]
    fn test_numbered_stage_columns() {
        let convention = StageConvention::new(".count")
            .with_label("raw", "stage1_raw")
            .with_label("trimmed", "stage2_trimmed");
        let entries = vec![
            ("counts/B.trimmed.count".to_string(), 9.0),
            ("counts/A.raw.count".to_string(), 10.0),
            ("counts/B.raw.count".to_string(), 12.0),
            ("counts/A.trimmed.count".to_string(), 8.0),
        ];

        let table = StageTable::build(&entries, &convention).unwrap();

        assert_eq!(table.samples(), vec!["A", "B"]);
        assert_eq!(table.columns(), &["stage1_raw", "stage2_trimmed"]);
        assert_eq!(table.value("A", "stage1_raw"), Some(10.0 / 1e6));
        assert_eq!(table.value("A", "stage2_trimmed"), Some(8.0 / 1e6));
        assert_eq!(table.value("B", "stage1_raw"), Some(12.0 / 1e6));
        assert_eq!(table.value("B", "stage2_trimmed"), Some(9.0 / 1e6));
        assert_eq!(
            table.to_tsv(),
            "sample\tstage1_raw\tstage2_trimmed\nA\t0.00001\t0.000008\nB\t0.000012\t0.000009\n"
        );
    }

    #[test]
    fn test_split_agrees_with_dotless_stage_wildcard() {
        let mut constraints = BTreeMap::new();
        constraints.insert("stage".to_string(), "[^/.]+".to_string());
        let template =
            Template::with_constraints("counts/{sample}.{stage}.count", &constraints).unwrap();

        for path in ["counts/A.raw.count", "counts/S.1.raw.count"] {
            let bound = template.matches(path).unwrap();
            assert_eq!(
                convention().split_stage_key(path).unwrap(),
                (bound["sample"].as_str(), bound["stage"].as_str())
            );
        }
    }

    #[test]
    fn test_unknown_suffix_is_fatal() {
        let entries = vec![
            ("counts/A.raw.count".to_string(), 10.0),
            ("counts/A.unknownstage.count".to_string(), 3.0),
        ];
        let result = StageTable::build(&entries, &convention());
        assert!(matches!(
            result,
            Err(AggregationError::UnknownStageSuffix { suffix, .. }) if suffix == "unknownstage"
        ));
    }

    #[test]
    fn test_duplicate_entry() {
        let entries = vec![
            ("a/A.raw.count".to_string(), 1.0),
            ("b/A.raw.count".to_string(), 2.0),
        ];
        assert!(matches!(
            StageTable::build(&entries, &convention()),
            Err(AggregationError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_missing_cell_is_empty() {
        let entries = vec![
            ("A.raw.count".to_string(), 1_000_000.0),
            ("B.raw.count".to_string(), 2_000_000.0),
            ("B.trimmed.count".to_string(), 500_000.0),
        ];
        let table = StageTable::build(&entries, &convention()).unwrap();
        assert_eq!(table.to_tsv(), "sample\tRaw\tTrimmed\nA\t1\t\nB\t2\t0.5\n");
    }

    #[test]
    fn test_invalid_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.raw.count");
        fs::write(&path, "n/a\n").unwrap();
        assert!(matches!(
            read_count(&path, "A.raw.count"),
            Err(AggregationError::InvalidValue { content, .. }) if content == "n/a"
        ));
    }

    #[test]
    fn test_empty_inputs_write_header_only() {
        let dir = tempdir().unwrap();
        let table_path = dir.path().join("t.tsv");
        let summary_path = dir.path().join("s.json");
        aggregate(dir.path(), &[], &convention(), &info(), &table_path, &summary_path).unwrap();
        assert_eq!(fs::read_to_string(&table_path).unwrap(), "sample\n");
    }
}
