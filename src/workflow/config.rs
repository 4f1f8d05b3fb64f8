//! Static Configuration
//!
//! The immutable inputs that rule inclusion is decided against: the
//! pipeline's `config` values and its sample table.
//!
//! # Example YAML Format
//!
//! ```yaml
//! config:
//!   deduplicate: true
//!   genome:
//!     index: ref/genome.idx
//!
//! samples:
//!   - { sample: A, accession: SRR001 }
//!   - { sample: B, accession: local }
//!
//! rules:
//!   - id: download
//!     include_if:
//!       column_matches: { column: accession, pattern: "^SRR", more_than: 0 }
//! ```

use std::collections::BTreeMap;

use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{PipelineError, RegistryError};

/// Converts a YAML scalar into its string form.
///
/// Returns `None` for mappings, sequences and null.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rows of named string columns, one row per sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTable {
    columns: Vec<String>,
    rows: Vec<BTreeMap<String, String>>,
}

impl SampleTable {
    /// Builds a table from inline rows. Columns appear in first-seen order.
    pub fn from_rows(rows: Vec<BTreeMap<String, String>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    /// Parses a tab-separated table with a header line.
    ///
    /// Blank lines and lines starting with `#` are skipped. `path` is only
    /// used in error messages.
    pub fn parse_tsv(content: &str, path: &str) -> Result<Self, PipelineError> {
        let mut lines = content
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'));

        let header = lines.next().ok_or_else(|| PipelineError::SampleTable {
            path: path.to_string(),
            reason: "table is empty".to_string(),
        })?;
        let columns: Vec<String> = header.split('\t').map(|c| c.trim().to_string()).collect();

        let mut rows = Vec::new();
        for (index, line) in lines.enumerate() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != columns.len() {
                return Err(PipelineError::SampleTable {
                    path: path.to_string(),
                    reason: format!(
                        "row {} has {} fields, header has {}",
                        index + 1,
                        fields.len(),
                        columns.len()
                    ),
                });
            }
            rows.push(
                columns
                    .iter()
                    .cloned()
                    .zip(fields.iter().map(|f| f.trim().to_string()))
                    .collect(),
            );
        }

        debug!("Sample table '{}': {} rows", path, rows.len());
        Ok(Self { columns, rows })
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values of one column in row order, or `None` if the
    /// column does not exist.
    pub fn column(&self, name: &str) -> Option<Vec<String>> {
        if !self.columns.iter().any(|c| c == name) {
            return None;
        }
        Some(
            self.rows
                .iter()
                .filter_map(|row| row.get(name).cloned())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Static configuration of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Value>,
    samples: SampleTable,
}

impl Config {
    pub fn new(values: BTreeMap<String, Value>, samples: SampleTable) -> Self {
        Self { values, samples }
    }

    /// Looks up a value by dotted key, e.g. `genome.index`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = current.as_mapping()?.get(part)?;
        }
        Some(current)
    }

    /// Returns true if the value at `key` exists and is truthy.
    ///
    /// `false`, `0`, null, empty strings and empty collections are falsy,
    /// as are the strings `"false"`, `"no"` and `"0"`.
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            Some(Value::String(s)) => {
                let s = s.trim().to_ascii_lowercase();
                !(s.is_empty() || s == "false" || s == "no" || s == "0")
            }
            Some(Value::Sequence(seq)) => !seq.is_empty(),
            Some(Value::Mapping(map)) => !map.is_empty(),
            Some(Value::Tagged(tagged)) => !matches!(tagged.value, Value::Null),
        }
    }

    /// Reads a config value as a list of strings. A single scalar counts as
    /// a one-element list.
    pub fn string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Sequence(items) => items.iter().map(scalar_to_string).collect(),
            other => scalar_to_string(other).map(|s| vec![s]),
        }
    }

    pub fn samples(&self) -> &SampleTable {
        &self.samples
    }
}

/// Row-count condition on a sample-table column.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnMatch {
    pub column: String,
    pub pattern: String,
    #[serde(default)]
    pub more_than: usize,
}

/// Inclusion predicate of a rule.
///
/// Written in YAML as a single-key mapping:
/// `config_flag: KEY`, `column_matches: {..}`, `not: P`, `all: [P..]` or
/// `any: [P..]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "PredicateDef")]
pub enum Predicate {
    ConfigFlag(String),
    ColumnMatches(ColumnMatch),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PredicateDef {
    config_flag: Option<String>,
    column_matches: Option<ColumnMatch>,
    not: Option<Box<Predicate>>,
    all: Option<Vec<Predicate>>,
    any: Option<Vec<Predicate>>,
}

impl TryFrom<PredicateDef> for Predicate {
    type Error = String;

    fn try_from(def: PredicateDef) -> Result<Self, Self::Error> {
        let mut found = Vec::new();
        if let Some(key) = def.config_flag {
            found.push(Predicate::ConfigFlag(key));
        }
        if let Some(m) = def.column_matches {
            found.push(Predicate::ColumnMatches(m));
        }
        if let Some(inner) = def.not {
            found.push(Predicate::Not(inner));
        }
        if let Some(all) = def.all {
            found.push(Predicate::All(all));
        }
        if let Some(any) = def.any {
            found.push(Predicate::Any(any));
        }

        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err("predicate needs one of config_flag, column_matches, not, all, any".to_string()),
            _ => Err("predicate must have exactly one key".to_string()),
        }
    }
}

impl Predicate {
    /// Evaluates the predicate. `rule` is only used in error messages.
    pub fn evaluate(&self, config: &Config, rule: &str) -> Result<bool, RegistryError> {
        match self {
            Predicate::ConfigFlag(key) => Ok(config.is_truthy(key)),
            Predicate::ColumnMatches(m) => {
                let regex = Regex::new(&m.pattern).map_err(|source| RegistryError::Predicate {
                    rule: rule.to_string(),
                    pattern: m.pattern.clone(),
                    source,
                })?;
                let values = match config.samples().column(&m.column) {
                    Some(values) => values,
                    None => {
                        warn!(
                            "Rule '{}': sample table has no column '{}'",
                            rule, m.column
                        );
                        Vec::new()
                    }
                };
                let count = values.iter().filter(|v| regex.is_match(v)).count();
                debug!(
                    "Rule '{}': {} row(s) of '{}' match '{}'",
                    rule, count, m.column, m.pattern
                );
                Ok(count > m.more_than)
            }
            Predicate::Not(inner) => Ok(!inner.evaluate(config, rule)?),
            Predicate::All(items) => {
                for item in items {
                    if !item.evaluate(config, rule)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any(items) => {
                for item in items {
                    if item.evaluate(config, rule)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str, samples: SampleTable) -> Config {
        let values: BTreeMap<String, Value> = serde_yaml::from_str(yaml).unwrap();
        Config::new(values, samples)
    }

    fn accession_table() -> SampleTable {
        SampleTable::parse_tsv(
            "sample\taccession\nA\tSRR001\nB\tSRR002\nC\tlocal\n",
            "samples.tsv",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_tsv() {
        let table = accession_table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.columns(), &["sample", "accession"]);
        assert_eq!(
            table.column("sample").unwrap(),
            vec!["A", "B", "C"]
        );
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn test_parse_tsv_ragged_row() {
        let result = SampleTable::parse_tsv("sample\taccession\nA\n", "s.tsv");
        assert!(matches!(result, Err(PipelineError::SampleTable { .. })));
    }

    #[test]
    fn test_dotted_lookup_and_truthiness() {
        let cfg = config(
            "dedup: true\nskip: 'no'\ngenome:\n  index: ref.idx\nlanes: []\n",
            SampleTable::default(),
        );
        assert!(cfg.is_truthy("dedup"));
        assert!(!cfg.is_truthy("skip"));
        assert!(!cfg.is_truthy("lanes"));
        assert!(!cfg.is_truthy("missing"));
        assert!(cfg.is_truthy("genome.index"));
        assert_eq!(
            cfg.get("genome.index").and_then(Value::as_str),
            Some("ref.idx")
        );
    }

    #[test]
    fn test_string_list() {
        let cfg = config("stages: [raw, trimmed]\nsingle: 3\n", SampleTable::default());
        assert_eq!(cfg.string_list("stages").unwrap(), vec!["raw", "trimmed"]);
        assert_eq!(cfg.string_list("single").unwrap(), vec!["3"]);
        assert!(cfg.string_list("nope").is_none());
    }

    #[test]
    fn test_column_matches_counts_rows() {
        let cfg = config("{}", accession_table());
        let predicate: Predicate = serde_yaml::from_str(
            "column_matches: { column: accession, pattern: '^SRR', more_than: 1 }",
        )
        .unwrap();
        assert!(predicate.evaluate(&cfg, "download").unwrap());

        let strict: Predicate = serde_yaml::from_str(
            "column_matches: { column: accession, pattern: '^SRR', more_than: 2 }",
        )
        .unwrap();
        assert!(!strict.evaluate(&cfg, "download").unwrap());
    }

    #[test]
    fn test_combinators() {
        let cfg = config("dedup: true\nreport: false\n", SampleTable::default());
        let predicate: Predicate = serde_yaml::from_str(
            "all:\n  - config_flag: dedup\n  - not:\n      config_flag: report\n",
        )
        .unwrap();
        assert!(predicate.evaluate(&cfg, "r").unwrap());

        let any: Predicate =
            serde_yaml::from_str("any:\n  - config_flag: report\n  - config_flag: missing\n")
                .unwrap();
        assert!(!any.evaluate(&cfg, "r").unwrap());
    }

    #[test]
    fn test_predicate_needs_exactly_one_key() {
        let both: Result<Predicate, _> =
            serde_yaml::from_str("config_flag: a\nnot:\n  config_flag: b\n");
        assert!(both.is_err());

        let none: Result<Predicate, _> = serde_yaml::from_str("{}");
        assert!(none.is_err());
    }

    #[test]
    fn test_invalid_predicate_pattern() {
        let cfg = config("{}", accession_table());
        let predicate = Predicate::ColumnMatches(ColumnMatch {
            column: "accession".to_string(),
            pattern: "(".to_string(),
            more_than: 0,
        });
        assert!(matches!(
            predicate.evaluate(&cfg, "download"),
            Err(RegistryError::Predicate { .. })
        ));
    }
}
