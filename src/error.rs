//! Error Types
//!
//! One enum per layer: templates, pipeline loading, registry construction,
//! graph construction, task execution, aggregation and whole runs.
//! Graph errors abort a run before anything executes; task errors stay
//! local to the failing branch.

use thiserror::Error;

use crate::workflow::validator::ValidationError;

/// Errors raised while parsing or filling a `{wildcard}` template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template '{template}': unclosed '{{' at byte {position}")]
    Unclosed { template: String, position: usize },

    #[error("Template '{template}': unmatched '}}' at byte {position}")]
    Unmatched { template: String, position: usize },

    #[error("Template '{template}': empty placeholder")]
    EmptyPlaceholder { template: String },

    #[error("Template '{template}': invalid pattern for wildcard '{name}': {source}")]
    Constraint {
        template: String,
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("Template '{template}': no value for wildcard '{name}'")]
    Unbound { template: String, name: String },

    #[error("Template '{template}': unknown placeholder '{{{name}}}'")]
    UnknownPlaceholder { template: String, name: String },
}

/// Errors raised while loading a pipeline definition.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Sample table '{path}': {reason}")]
    SampleTable { path: String, reason: String },

    #[error("Target '{target}': unknown sample table column '{column}'")]
    UnknownColumn { target: String, column: String },

    #[error("Target '{target}': config value '{key}' is not a list of strings")]
    ConfigValues { target: String, key: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors raised while freezing the rule registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Rule '{0}' is registered twice")]
    DuplicateRule(String),

    #[error("Invalid pipeline:\n{}", join_lines(.0))]
    Invalid(Vec<ValidationError>),

    #[error("Rule '{rule}': referenced rule '{reference}' is excluded by its include_if predicate")]
    ExcludedReference { rule: String, reference: String },

    #[error("Rule '{rule}': predicate pattern '{pattern}' is invalid: {source}")]
    Predicate {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule '{rule}': {source}")]
    Template {
        rule: String,
        #[source]
        source: TemplateError,
    },
}

/// Errors raised while expanding targets into a task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Ambiguous producer for '{path}': rules {} all match it", .rules.join(", "))]
    AmbiguousProducer { path: String, rules: Vec<String> },

    #[error("No rule produces '{path}' and the file does not exist{}", requester_suffix(.requested_by))]
    NoProducer {
        path: String,
        requested_by: Option<String>,
    },

    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Expanding '{path}' exceeded the maximum depth of {limit}")]
    ExpansionTooDeep { path: String, limit: usize },

    #[error("Failed to inspect '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Errors raised by one attempt of one task.
///
/// Process and IO failures are retried; see [`TaskError::is_retryable`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("exited with {}; see {log}", describe_exit(.code))]
    ExitStatus { code: Option<i32>, log: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("declared output '{0}' was not produced")]
    MissingOutput(String),

    #[error("rule '{0}' is not registered")]
    UnknownRule(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl TaskError {
    /// Returns false for failures another attempt cannot fix: bad
    /// aggregation inputs, unrenderable commands and unknown rules.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Aggregation(AggregationError::Io { .. }) => true,
            TaskError::Aggregation(_) | TaskError::Template(_) | TaskError::UnknownRule(_) => false,
            _ => true,
        }
    }
}

/// Errors raised by the aggregation step.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("'{path}': unknown stage suffix '{suffix}'")]
    UnknownStageSuffix { path: String, suffix: String },

    #[error("'{path}': file name does not follow <sample>.<stage>")]
    MalformedPath { path: String },

    #[error("'{path}': expected a number, found '{content}'")]
    InvalidValue { path: String, content: String },

    #[error("sample '{sample}' has more than one value for stage '{stage}'")]
    DuplicateEntry { sample: String, stage: String },

    #[error("'{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode summary: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that stop a run as a whole.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("worker channel closed while {0} task(s) were running")]
    Disconnected(usize),
}

fn join_lines(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

fn requester_suffix(requested_by: &Option<String>) -> String {
    match requested_by {
        Some(task) => format!(" (required by {})", task),
        None => String::new(),
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_producer_mentions_requester() {
        let err = GraphError::NoProducer {
            path: "reads/A.fastq".to_string(),
            requested_by: Some("trim[sample=A]".to_string()),
        };
        let message = err.to_string();
        assert!(message.contains("reads/A.fastq"));
        assert!(message.contains("required by trim[sample=A]"));
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["a.txt".to_string(), "b.txt".to_string(), "a.txt".to_string()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a.txt -> b.txt -> a.txt");
    }

    #[test]
    fn test_deterministic_failures_are_not_retryable() {
        let unknown = TaskError::Aggregation(AggregationError::UnknownStageSuffix {
            path: "counts/A.unknownstage.count".to_string(),
            suffix: "unknownstage".to_string(),
        });
        assert!(!unknown.is_retryable());
        assert!(!TaskError::UnknownRule("gone".to_string()).is_retryable());

        let exit = TaskError::ExitStatus {
            code: Some(1),
            log: "logs/x.log".to_string(),
        };
        assert!(exit.is_retryable());
        assert!(TaskError::MissingOutput("out.txt".to_string()).is_retryable());
        let unreadable = TaskError::Aggregation(AggregationError::Io {
            path: "counts/A.raw.count".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "busy"),
        });
        assert!(unreadable.is_retryable());
    }

    #[test]
    fn test_exit_status_without_code() {
        let err = TaskError::ExitStatus {
            code: None,
            log: "logs/x.log".to_string(),
        };
        assert!(err.to_string().contains("a signal"));
    }

    #[test]
    fn test_template_error_braces() {
        let err = TemplateError::Unclosed {
            template: "{sample".to_string(),
            position: 0,
        };
        assert!(err.to_string().contains("unclosed '{'"));
    }
}
