//! Rule Validation
//!
//! Static checks on a rule set before it is compiled into a registry:
//! - Rule field validation (ids, outputs, exactly one action)
//! - Template syntax and wildcard constraints
//! - No undetermined wildcards on the input side
//! - Command placeholders refer to something a task provides
//! - Rule and aggregation references point to existing rules

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::{debug, info};

use super::model::{InputSpec, Rule};
use super::wildcards::{parse_indexed, parse_segments, Segment, Template};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPipeline,
    EmptyRuleId,
    DuplicateRuleId(String),
    NoOutputs(String),
    ActionCount { rule: String, count: usize },
    EmptyCommand(String),
    InvalidThreads(String),
    InvalidTemplate { rule: String, message: String },
    InconsistentOutputs(String),
    UndeterminedWildcard { rule: String, template: String, wildcard: String },
    UnknownPlaceholder { rule: String, placeholder: String },
    InvalidReference { rule: String, reference: String },
    AggregateShape(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPipeline => write!(f, "Pipeline has no rules"),
            Self::EmptyRuleId => write!(f, "Rule has empty or whitespace-only ID"),
            Self::DuplicateRuleId(id) => write!(f, "Duplicate rule ID: '{}'", id),
            Self::NoOutputs(rule) => write!(f, "Rule '{}' declares no outputs", rule),
            Self::ActionCount { rule, count } => write!(
                f,
                "Rule '{}' must have exactly one of shell, tool or aggregate (found {})",
                rule, count
            ),
            Self::EmptyCommand(rule) => write!(f, "Rule '{}' has an empty command", rule),
            Self::InvalidThreads(rule) => write!(f, "Rule '{}' requests zero threads", rule),
            Self::InvalidTemplate { rule, message } => write!(f, "Rule '{}': {}", rule, message),
            Self::InconsistentOutputs(rule) => write!(
                f,
                "Rule '{}': all outputs must use the same wildcards",
                rule
            ),
            Self::UndeterminedWildcard {
                rule,
                template,
                wildcard,
            } => write!(
                f,
                "Rule '{}': wildcard '{{{}}}' in '{}' does not appear in the outputs",
                rule, wildcard, template
            ),
            Self::UnknownPlaceholder { rule, placeholder } => {
                write!(f, "Rule '{}': unknown placeholder '{{{}}}'", rule, placeholder)
            }
            Self::InvalidReference { rule, reference } => {
                write!(f, "Rule '{}' references unknown rule output '{}'", rule, reference)
            }
            Self::AggregateShape(rule) => write!(
                f,
                "Rule '{}': an aggregation needs exactly two outputs (table, summary) without wildcards",
                rule
            ),
        }
    }
}

/// What a command template may refer to.
#[derive(Debug)]
pub struct PlaceholderScope<'a> {
    pub inputs: usize,
    pub outputs: usize,
    pub params: &'a BTreeMap<String, String>,
    pub wildcards: &'a BTreeSet<String>,
}

impl PlaceholderScope<'_> {
    /// Returns true if a task of this rule can fill `name`.
    pub fn knows(&self, name: &str) -> bool {
        match name {
            "input" | "inputs" | "output" | "outputs" | "log" | "threads" | "attempt"
            | "resources.mem_mb" | "resources.runtime" => return true,
            _ => {}
        }
        if let Some(param) = name.strip_prefix("params.") {
            return self.params.contains_key(param);
        }
        if let Some(wildcard) = name.strip_prefix("wildcards.") {
            return self.wildcards.contains(wildcard);
        }
        if let Some((base, index)) = parse_indexed(name) {
            return match base {
                "input" => index < self.inputs,
                "output" => index < self.outputs,
                _ => false,
            };
        }
        self.wildcards.contains(name)
    }
}

/// Validates a single rule's fields and templates.
fn validate_rule(
    rule: &Rule,
    constraints: &BTreeMap<String, String>,
    known: &HashMap<&str, &Rule>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // Check ID
    if rule.id.trim().is_empty() {
        errors.push(ValidationError::EmptyRuleId);
        return errors; // Can't validate further without ID
    }

    if rule.output.is_empty() {
        errors.push(ValidationError::NoOutputs(rule.id.clone()));
    }

    let actions = rule.action_count();
    if actions != 1 {
        errors.push(ValidationError::ActionCount {
            rule: rule.id.clone(),
            count: actions,
        });
    }

    if rule.threads == 0 {
        errors.push(ValidationError::InvalidThreads(rule.id.clone()));
    }

    let invalid = |message: String| ValidationError::InvalidTemplate {
        rule: rule.id.clone(),
        message,
    };

    // Output wildcards
    let mut output_sets = Vec::new();
    for output in &rule.output {
        match Template::with_constraints(output, constraints) {
            Ok(t) => output_sets.push(t.wildcard_set()),
            Err(e) => errors.push(invalid(e.to_string())),
        }
    }
    let wildcards = output_sets.first().cloned().unwrap_or_default();
    if output_sets.iter().any(|set| *set != wildcards) {
        errors.push(ValidationError::InconsistentOutputs(rule.id.clone()));
    }

    let mut check_determined = |template: &str, names: BTreeSet<String>| {
        for name in names.difference(&wildcards) {
            errors.push(ValidationError::UndeterminedWildcard {
                rule: rule.id.clone(),
                template: template.to_string(),
                wildcard: name.clone(),
            });
        }
    };

    // Inputs, log and params may only use output wildcards
    let mut dependent: Vec<&str> = rule.path_inputs().collect();
    dependent.extend(rule.log.as_deref());
    dependent.extend(rule.params.values().map(String::as_str));
    let mut template_errors = Vec::new();
    for template in dependent {
        match Template::with_constraints(template, constraints) {
            Ok(t) => check_determined(template, t.wildcard_set()),
            Err(e) => template_errors.push(invalid(e.to_string())),
        }
    }

    for input in &rule.input {
        if let InputSpec::RuleOutput {
            rule: target,
            output,
        } = input
        {
            match known.get(target.as_str()).and_then(|r| r.output.get(*output)) {
                Some(template) => match Template::with_constraints(template, constraints) {
                    Ok(t) => check_determined(template, t.wildcard_set()),
                    Err(e) => template_errors.push(invalid(e.to_string())),
                },
                None => template_errors.push(ValidationError::InvalidReference {
                    rule: rule.id.clone(),
                    reference: format!("{}[{}]", target, output),
                }),
            }
        }
    }
    errors.extend(template_errors);

    // Command placeholders
    let scope = PlaceholderScope {
        inputs: rule.input.len(),
        outputs: rule.output.len(),
        params: &rule.params,
        wildcards: &wildcards,
    };
    let mut commands: Vec<&str> = Vec::new();
    if let Some(shell) = &rule.shell {
        if shell.trim().is_empty() {
            errors.push(ValidationError::EmptyCommand(rule.id.clone()));
        }
        commands.push(shell);
    }
    if let Some(tool) = &rule.tool {
        if tool.trim().is_empty() {
            errors.push(ValidationError::EmptyCommand(rule.id.clone()));
        }
        commands.extend(rule.args.iter().map(String::as_str));
    }
    for command in commands {
        match parse_segments(command) {
            Ok(segments) => {
                for segment in segments {
                    if let Segment::Placeholder { name, constraint } = segment {
                        if constraint.is_some() || !scope.knows(&name) {
                            errors.push(ValidationError::UnknownPlaceholder {
                                rule: rule.id.clone(),
                                placeholder: name,
                            });
                        }
                    }
                }
            }
            Err(e) => errors.push(invalid(e.to_string())),
        }
    }

    // Aggregations
    if let Some(spec) = &rule.aggregate {
        if rule.output.len() != 2 || !wildcards.is_empty() {
            errors.push(ValidationError::AggregateShape(rule.id.clone()));
        }
        let collected = known.get(spec.rule.as_str());
        if collected.and_then(|r| r.output.get(spec.output)).is_none() {
            errors.push(ValidationError::InvalidReference {
                rule: rule.id.clone(),
                reference: format!("{}[{}]", spec.rule, spec.output),
            });
        }
    }

    if rule.input.is_empty() && rule.aggregate.is_none() {
        debug!("Rule '{}' has no inputs", rule.id);
    }

    errors
}

/// Validates a rule set.
///
/// Performs the following checks:
/// 1. At least one rule
/// 2. No duplicate rule IDs
/// 3. Every rule's fields and templates are valid
/// 4. Every reference points to an existing rule output
///
/// Returns every problem found; an empty list means the rules are valid.
pub fn validate_rules(rules: &[Rule], constraints: &BTreeMap<String, String>) -> Vec<ValidationError> {
    info!("Validating {} rules", rules.len());

    if rules.is_empty() {
        return vec![ValidationError::EmptyPipeline];
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for rule in rules {
        if !seen_ids.insert(rule.id.as_str()) {
            errors.push(ValidationError::DuplicateRuleId(rule.id.clone()));
        }
    }

    let known: HashMap<&str, &Rule> = rules.iter().map(|r| (r.id.as_str(), r)).collect();
    for rule in rules {
        errors.extend(validate_rule(rule, constraints, &known));
    }

    if errors.is_empty() {
        debug!("All {} rules are valid", rules.len());
    }
    errors
}
