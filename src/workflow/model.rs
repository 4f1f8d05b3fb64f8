//! Pipeline Data Model
//!
//! Serde structures for pipeline definitions, as written in YAML.
//!
//! # Example YAML Format
//!
//! ```yaml
//! wildcard_constraints:
//!   sample: "[^/.]+"
//!
//! samples:
//!   - { sample: A }
//!   - { sample: B }
//!
//! targets:
//!   - pattern: bigwig/{sample}.bw
//!     expand:
//!       sample: { column: sample }
//!
//! rules:
//!   - id: trim
//!     input: reads/{sample}.fastq
//!     output: trimmed/{sample}.fastq
//!     threads: 2
//!     resources: { mem_mb: 2000, runtime: 30 }
//!     shell: trimmer -t {threads} {input} > {output}
//!
//!   - id: align
//!     input:
//!       - rule: trim
//!     output: aligned/{sample}.bam
//!     max_attempts: 3
//!     tool: aligner
//!     args: ["--threads", "{threads}", "{input}", "-o", "{output}"]
//! ```

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::execution::aggregate::StageConvention;
use crate::execution::retry::{ResourceSpec, Scaling};
use crate::workflow::config::{scalar_to_string, Predicate};

/// One input of a rule: a path template, or an output of another rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    Path(String),
    RuleOutput {
        rule: String,
        #[serde(default)]
        output: usize,
    },
}

/// Aggregation action: collects every expansion of another rule's output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregateSpec {
    /// Rule whose outputs are collected
    pub rule: String,

    /// Index of the collected output template
    #[serde(default)]
    pub output: usize,

    #[serde(default)]
    pub section_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_plot_type")]
    pub plot_type: String,
}

fn default_plot_type() -> String {
    "bargraph".to_string()
}

impl AggregateSpec {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            output: 0,
            section_name: None,
            description: None,
            plot_type: default_plot_type(),
        }
    }
}

/// A rule: output templates, inputs, resources and exactly one action.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub id: String,

    #[serde(deserialize_with = "one_or_many", default)]
    pub input: Vec<InputSpec>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub output: Vec<String>,

    /// Log file template; defaults to `.seqflow/logs/<rule>/<task>.log`
    #[serde(default)]
    pub log: Option<String>,

    /// Parameter templates, available as `{params.NAME}`
    #[serde(deserialize_with = "scalar_map", default)]
    pub params: BTreeMap<String, String>,

    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub resources: ResourceSpec,

    /// Overrides the run-wide attempt limit
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Shell command template
    #[serde(default)]
    pub shell: Option<String>,

    /// External program, run with `args` without a shell
    #[serde(default)]
    pub tool: Option<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,

    #[serde(default)]
    pub include_if: Option<Predicate>,
}

/// Default thread count for rules that don't specify
fn default_threads() -> usize {
    1
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Deserializes either one item or a list of items.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Many first: derived structs also accept sequences.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(item)) => vec![item],
        Some(OneOrMany::Many(items)) => items,
    })
}

/// Deserializes a mapping whose values are scalars into strings.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            scalar_to_string(&value)
                .map(|s| (key.clone(), s))
                .ok_or_else(|| de::Error::custom(format!("parameter '{}' must be a scalar", key)))
        })
        .collect()
}

impl Rule {
    /// Creates a rule with no inputs, outputs or action.
    ///
    /// # Example
    ///
    /// ```
    /// use seqflow::workflow::Rule;
    ///
    /// let rule = Rule::new("trim")
    ///     .with_input("reads/{sample}.fastq")
    ///     .with_output("trimmed/{sample}.fastq")
    ///     .with_shell("trimmer {input} > {output}")
    ///     .with_threads(2);
    /// assert_eq!(rule.output, vec!["trimmed/{sample}.fastq"]);
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            input: Vec::new(),
            output: Vec::new(),
            log: None,
            params: BTreeMap::new(),
            threads: 1,
            resources: ResourceSpec::default(),
            max_attempts: None,
            shell: None,
            tool: None,
            args: Vec::new(),
            aggregate: None,
            include_if: None,
        }
    }

    /// Adds an input path template.
    pub fn with_input(mut self, template: impl Into<String>) -> Self {
        self.input.push(InputSpec::Path(template.into()));
        self
    }

    /// Adds a reference to output `output` of rule `rule`.
    pub fn with_rule_input(mut self, rule: impl Into<String>, output: usize) -> Self {
        self.input.push(InputSpec::RuleOutput {
            rule: rule.into(),
            output,
        });
        self
    }

    /// Adds an output path template.
    pub fn with_output(mut self, template: impl Into<String>) -> Self {
        self.output.push(template.into());
        self
    }

    pub fn with_log(mut self, template: impl Into<String>) -> Self {
        self.log = Some(template.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_resources(mut self, mem_mb: u64, runtime: u64) -> Self {
        self.resources = ResourceSpec {
            mem_mb,
            runtime,
            scaling: self.resources.scaling,
        };
        self
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.resources.scaling = scaling;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_shell(mut self, command: impl Into<String>) -> Self {
        self.shell = Some(command.into());
        self
    }

    pub fn with_tool(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.tool = Some(program.into());
        self.args = args;
        self
    }

    pub fn with_aggregate(mut self, spec: AggregateSpec) -> Self {
        self.aggregate = Some(spec);
        self
    }

    pub fn include_if(mut self, predicate: Predicate) -> Self {
        self.include_if = Some(predicate);
        self
    }

    /// Number of actions declared (shell, tool, aggregate).
    pub fn action_count(&self) -> usize {
        [
            self.shell.is_some(),
            self.tool.is_some(),
            self.aggregate.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// Path templates among the inputs.
    pub fn path_inputs(&self) -> impl Iterator<Item = &str> {
        self.input.iter().filter_map(|i| match i {
            InputSpec::Path(p) => Some(p.as_str()),
            InputSpec::RuleOutput { .. } => None,
        })
    }
}

/// Values a target template is expanded over.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ValueSource {
    Values(Vec<String>),
    Column { column: String },
    Config { config: String },
}

/// A default target: a concrete path or a template expanded over values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Path(String),
    Pattern {
        pattern: String,
        #[serde(default)]
        expand: BTreeMap<String, ValueSource>,
    },
}

/// A complete pipeline file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pipeline {
    /// Static configuration values
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,

    /// Inline sample rows
    #[serde(default)]
    pub samples: Vec<BTreeMap<String, serde_yaml::Value>>,

    /// Path of a TSV sample table, relative to the pipeline file
    #[serde(default)]
    pub sample_table: Option<String>,

    #[serde(default)]
    pub wildcard_constraints: BTreeMap<String, String>,

    #[serde(default)]
    pub stages: StageConvention,

    #[serde(default)]
    pub targets: Vec<TargetSpec>,

    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_creation() {
        let rule = Rule::new(" align ")
            .with_rule_input("trim", 0)
            .with_output("aligned/{sample}.bam")
            .with_tool("aligner", vec!["{input}".to_string()])
            .with_threads(8)
            .with_resources(4000, 90)
            .with_max_attempts(3);

        assert_eq!(rule.id, "align");
        assert_eq!(rule.threads, 8);
        assert_eq!(rule.resources.mem_mb, 4000);
        assert_eq!(rule.max_attempts, Some(3));
        assert_eq!(rule.action_count(), 1);
        assert_eq!(rule.path_inputs().count(), 0);
    }

    #[test]
    fn test_rule_yaml_single_values() {
        let rule: Rule = serde_yaml::from_str(
            "id: trim\ninput: reads/{sample}.fastq\noutput: trimmed/{sample}.fastq\nshell: cp {input} {output}\n",
        )
        .unwrap();

        assert_eq!(rule.input, vec![InputSpec::Path("reads/{sample}.fastq".to_string())]);
        assert_eq!(rule.output, vec!["trimmed/{sample}.fastq"]);
        assert_eq!(rule.threads, 1);
        assert_eq!(rule.resources, ResourceSpec::default());
    }

    #[test]
    fn test_rule_yaml_mixed_inputs() {
        let rule: Rule = serde_yaml::from_str(
            r#"
id: align
input:
  - ref/genome.idx
  - rule: trim
  - { rule: trim, output: 1 }
output: ["aligned/{sample}.bam", "aligned/{sample}.bai"]
params:
  seed: 42
  mode: fast
resources: { mem_mb: 8000, scaling: constant }
tool: aligner
args: ["--seed", "{params.seed}"]
"#,
        )
        .unwrap();

        assert_eq!(rule.input.len(), 3);
        assert_eq!(
            rule.input[1],
            InputSpec::RuleOutput {
                rule: "trim".to_string(),
                output: 0
            }
        );
        assert_eq!(
            rule.input[2],
            InputSpec::RuleOutput {
                rule: "trim".to_string(),
                output: 1
            }
        );
        assert_eq!(rule.params["seed"], "42");
        assert_eq!(rule.resources.scaling, Scaling::Constant);
        assert_eq!(rule.resources.runtime, 60);
        assert_eq!(rule.args, vec!["--seed", "{params.seed}"]);
    }

    #[test]
    fn test_rule_yaml_single_element_input_list() {
        let rule: Rule =
            serde_yaml::from_str("id: sort\ninput: [\"aligned/{sample}.bam\"]\nshell: echo\n").unwrap();
        assert_eq!(
            rule.input,
            vec![InputSpec::Path("aligned/{sample}.bam".to_string())]
        );
    }

    #[test]
    fn test_rule_yaml_with_predicate() {
        let rule: Rule = serde_yaml::from_str(
            "id: dedup\ninclude_if:\n  config_flag: deduplicate\nshell: echo\n",
        )
        .unwrap();
        assert_eq!(
            rule.include_if,
            Some(Predicate::ConfigFlag("deduplicate".to_string()))
        );
    }

    #[test]
    fn test_targets_yaml() {
        let targets: Vec<TargetSpec> = serde_yaml::from_str(
            r#"
- report/table.tsv
- pattern: counts/{sample}.{stage}.count
  expand:
    sample: { column: sample }
    stage: [raw, trimmed]
- pattern: qc/{lane}.html
  expand:
    lane: { config: lanes }
"#,
        )
        .unwrap();

        assert_eq!(targets[0], TargetSpec::Path("report/table.tsv".to_string()));
        match &targets[1] {
            TargetSpec::Pattern { expand, .. } => {
                assert_eq!(
                    expand["sample"],
                    ValueSource::Column {
                        column: "sample".to_string()
                    }
                );
                assert_eq!(
                    expand["stage"],
                    ValueSource::Values(vec!["raw".to_string(), "trimmed".to_string()])
                );
            }
            other => panic!("unexpected target {:?}", other),
        }
        assert!(matches!(
            &targets[2],
            TargetSpec::Pattern { expand, .. }
                if expand["lane"] == ValueSource::Config { config: "lanes".to_string() }
        ));
    }

    #[test]
    fn test_aggregate_spec_defaults() {
        let rule: Rule = serde_yaml::from_str(
            "id: report\noutput: [report/table.tsv, report/summary.json]\naggregate:\n  rule: count\n",
        )
        .unwrap();
        let spec = rule.aggregate.unwrap();
        assert_eq!(spec.rule, "count");
        assert_eq!(spec.output, 0);
        assert_eq!(spec.plot_type, "bargraph");
    }

    #[test]
    fn test_empty_pipeline() {
        let pipeline: Pipeline = serde_yaml::from_str("rules: []").unwrap();
        assert!(pipeline.rules.is_empty());
        assert_eq!(pipeline.stages.extension, ".count");
    }
}
