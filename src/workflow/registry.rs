//! Rule Registry
//!
//! Rules are collected in a [`RegistryBuilder`], then frozen into a
//! [`RuleRegistry`] by [`RegistryBuilder::build`]. Building evaluates every
//! inclusion predicate exactly once, validates the surviving rules and
//! compiles their templates. The registry is immutable afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};

use super::config::Config;
use super::model::{InputSpec, Rule};
use super::validator::validate_rules;
use super::wildcards::{Binding, Template};
use crate::error::{GraphError, RegistryError, TemplateError};
use crate::execution::aggregate::{StageConvention, SummaryInfo};
use crate::execution::retry::ResourceSpec;

/// What a task of a rule runs.
#[derive(Debug, Clone)]
pub enum RuleAction {
    Shell {
        command: String,
    },
    Tool {
        program: String,
        args: Vec<String>,
    },
    /// Collects every resolved expansion of `template`, an output of `rule`
    Aggregate {
        rule: String,
        template: Template,
        convention: StageConvention,
        info: SummaryInfo,
    },
}

/// A validated rule with compiled templates.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub outputs: Vec<Template>,
    pub inputs: Vec<Template>,
    pub log: Option<Template>,
    pub params: BTreeMap<String, Template>,
    pub threads: usize,
    pub resources: ResourceSpec,
    pub max_attempts: Option<u32>,
    pub action: RuleAction,
}

impl CompiledRule {
    pub fn is_aggregate(&self) -> bool {
        matches!(self.action, RuleAction::Aggregate { .. })
    }

    /// Returns the binding if any output template matches `path`.
    pub fn match_output(&self, path: &str) -> Option<Binding> {
        self.outputs.iter().find_map(|t| t.matches(path))
    }
}

/// Collects rules before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    rules: Vec<Rule>,
    constraints: BTreeMap<String, String>,
    stages: StageConvention,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets pipeline-wide wildcard constraints.
    pub fn with_constraints(mut self, constraints: BTreeMap<String, String>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Sets the stage convention used by aggregation rules.
    pub fn with_stages(mut self, stages: StageConvention) -> Self {
        self.stages = stages;
        self
    }

    /// Adds a rule. Ids must be unique.
    pub fn register(&mut self, rule: Rule) -> Result<(), RegistryError> {
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(RegistryError::DuplicateRule(rule.id));
        }
        debug!("Registered rule '{}'", rule.id);
        self.rules.push(rule);
        Ok(())
    }

    /// Returns the rules whose inclusion predicate holds, in registration
    /// order. Rules without a predicate are always included.
    pub fn rules_with_predicate_true(&self, config: &Config) -> Result<Vec<&Rule>, RegistryError> {
        let mut included = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let keep = match &rule.include_if {
                Some(predicate) => predicate.evaluate(config, &rule.id)?,
                None => true,
            };
            if keep {
                included.push(rule);
            } else {
                info!("Rule '{}' excluded by its include_if predicate", rule.id);
            }
        }
        Ok(included)
    }

    /// Evaluates predicates, validates and compiles the included rules.
    pub fn build(self, config: &Config) -> Result<RuleRegistry, RegistryError> {
        let included: Vec<Rule> = self
            .rules_with_predicate_true(config)?
            .into_iter()
            .cloned()
            .collect();

        let included_ids: HashSet<&str> = included.iter().map(|r| r.id.as_str()).collect();
        let excluded: HashSet<&str> = self
            .rules
            .iter()
            .map(|r| r.id.as_str())
            .filter(|id| !included_ids.contains(id))
            .collect();

        for rule in &included {
            let mut references: Vec<&str> = rule
                .input
                .iter()
                .filter_map(|i| match i {
                    InputSpec::RuleOutput { rule, .. } => Some(rule.as_str()),
                    InputSpec::Path(_) => None,
                })
                .collect();
            references.extend(rule.aggregate.as_ref().map(|a| a.rule.as_str()));

            if let Some(reference) = references.into_iter().find(|r| excluded.contains(r)) {
                return Err(RegistryError::ExcludedReference {
                    rule: rule.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }

        let errors = validate_rules(&included, &self.constraints);
        if !errors.is_empty() {
            return Err(RegistryError::Invalid(errors));
        }

        let mut compiled = Vec::with_capacity(included.len());
        for rule in &included {
            compiled.push(
                self.compile(rule, &included)
                    .map_err(|source| RegistryError::Template {
                        rule: rule.id.clone(),
                        source,
                    })?,
            );
        }

        info!(
            "Rule registry frozen: {} of {} rules included",
            compiled.len(),
            self.rules.len()
        );
        Ok(RuleRegistry::new(compiled))
    }

    fn compile(&self, rule: &Rule, all: &[Rule]) -> Result<CompiledRule, TemplateError> {
        let template = |raw: &str| Template::with_constraints(raw, &self.constraints);

        let outputs = rule
            .output
            .iter()
            .map(|o| template(o.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let inputs = rule
            .input
            .iter()
            .map(|input| match input {
                InputSpec::Path(path) => template(path.as_str()),
                InputSpec::RuleOutput { rule, output } => {
                    template(referenced_output(all, rule, *output))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let log = rule.log.as_deref().map(template).transpose()?;

        let params = rule
            .params
            .iter()
            .map(|(name, value)| Ok((name.clone(), template(value.as_str())?)))
            .collect::<Result<BTreeMap<_, _>, TemplateError>>()?;

        let action = if let Some(command) = &rule.shell {
            RuleAction::Shell {
                command: command.clone(),
            }
        } else if let Some(program) = &rule.tool {
            RuleAction::Tool {
                program: program.clone(),
                args: rule.args.clone(),
            }
        } else if let Some(spec) = &rule.aggregate {
            RuleAction::Aggregate {
                rule: spec.rule.clone(),
                template: template(referenced_output(all, &spec.rule, spec.output))?,
                convention: self.stages.clone(),
                info: SummaryInfo {
                    id: rule.id.clone(),
                    section_name: spec.section_name.clone().unwrap_or_else(|| rule.id.clone()),
                    description: spec.description.clone().unwrap_or_default(),
                    plot_type: spec.plot_type.clone(),
                },
            }
        } else {
            RuleAction::Shell {
                command: String::new(),
            }
        };

        Ok(CompiledRule {
            id: rule.id.clone(),
            outputs,
            inputs,
            log,
            params,
            threads: rule.threads,
            resources: rule.resources.clone(),
            max_attempts: rule.max_attempts,
            action,
        })
    }
}

/// Output template `index` of rule `id`. References are validated before
/// compilation, so a miss only yields an empty template.
fn referenced_output<'a>(rules: &'a [Rule], id: &str, index: usize) -> &'a str {
    rules
        .iter()
        .find(|r| r.id == id)
        .and_then(|r| r.output.get(index))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Frozen set of compiled rules.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<CompiledRule>,
    index: HashMap<String, usize>,
}

impl RuleRegistry {
    fn new(rules: Vec<CompiledRule>) -> Self {
        let index = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self { rules, index }
    }

    pub fn get(&self, id: &str) -> Option<&CompiledRule> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    /// Rules in registration order.
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Finds the single rule with an output template matching `path`.
    ///
    /// Returns `Ok(None)` if no rule matches, and
    /// [`GraphError::AmbiguousProducer`] if more than one does.
    pub fn find_producer(&self, path: &str) -> Result<Option<(&CompiledRule, Binding)>, GraphError> {
        let mut matches: Vec<(&CompiledRule, Binding)> = self
            .rules
            .iter()
            .filter_map(|rule| rule.match_output(path).map(|b| (rule, b)))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(GraphError::AmbiguousProducer {
                path: path.to_string(),
                rules: matches.iter().map(|(r, _)| r.id.clone()).collect(),
            }),
        }
    }
}
