//! Dependency Graph Builder
//!
//! Expands requested target paths backwards into a DAG of task instances.
//!
//! # Phases
//!
//! 1. **Concrete rules**: each requested path is matched against the
//!    registry, the producer is bound and its inputs are requested in turn.
//!    Fresh producers are not instantiated and their inputs are not
//!    expanded. Aggregation tasks are created with their inputs deferred.
//! 2. **Aggregations**: each deferred task receives one input per binding
//!    resolved for the collected rule during phase 1, fresh or not.
//!    Aggregations with nothing to rebuild are dropped.
//!
//! The finished [`TaskGraph`] holds dependency and dependent adjacency, a
//! path → producer index and a topological order (Kahn's algorithm).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};

use super::registry::{CompiledRule, RuleAction, RuleRegistry};
use super::wildcards::{describe, Binding};
use crate::error::GraphError;

/// Expansion depth after which a request chain is considered runaway.
pub const MAX_EXPANSION_DEPTH: usize = 200;

/// Index of a task in its [`TaskGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Concrete,
    Aggregate,
}

/// A rule bound to concrete wildcard values.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub id: TaskId,
    pub rule: String,
    pub binding: Binding,
    pub kind: TaskKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub log: String,
    pub params: BTreeMap<String, String>,
}

impl TaskInstance {
    /// Human-readable name, e.g. `trim[sample=A]`.
    pub fn label(&self) -> String {
        task_label(&self.rule, &self.binding)
    }
}

fn task_label(rule: &str, binding: &Binding) -> String {
    if binding.is_empty() {
        rule.to_string()
    } else {
        format!("{}[{}]", rule, describe(binding))
    }
}

/// Default log location: `.seqflow/logs/<rule>/<task>.log`.
fn default_log(rule: &str, binding: &Binding) -> String {
    let name = if binding.is_empty() {
        rule.to_string()
    } else {
        describe(binding).replace('/', "_")
    };
    format!(".seqflow/logs/{}/{}.log", rule, name)
}

/// Strips leading `./` so equal paths compare equal.
pub fn normalize_path(path: &str) -> String {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

/// Finished task DAG.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<TaskInstance>,
    dependencies: Vec<Vec<TaskId>>,
    dependents: Vec<Vec<TaskId>>,
    producers: HashMap<String, TaskId>,
    targets: Vec<String>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskInstance] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &TaskInstance {
        &self.tasks[id.0]
    }

    /// Producers that must succeed before `id` can run.
    pub fn dependencies(&self, id: TaskId) -> &[TaskId] {
        &self.dependencies[id.0]
    }

    /// Tasks that consume an output of `id`.
    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        &self.dependents[id.0]
    }

    /// Returns the task that produces `path`, if one is scheduled.
    pub fn producer_of(&self, path: &str) -> Option<TaskId> {
        self.producers.get(&normalize_path(path)).copied()
    }

    /// Requested target paths, normalized.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Finds a task by its label.
    pub fn find(&self, label: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| t.label() == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    /// Exists on disk, no rule produces it
    Source,
    /// Produced by a rule whose outputs are up to date
    Fresh,
    Produced(usize),
}

/// Builds a [`TaskGraph`] from target paths.
pub struct GraphBuilder<'a> {
    registry: &'a RuleRegistry,
    root: PathBuf,
    max_depth: usize,
    tasks: Vec<TaskInstance>,
    index: HashMap<(String, Binding), usize>,
    paths: HashMap<String, PathState>,
    stack: Vec<String>,
    resolved: HashMap<String, BTreeSet<Binding>>,
    deferred: Vec<usize>,
    dropped: HashSet<usize>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder. File freshness is checked relative to `root`.
    pub fn new(registry: &'a RuleRegistry, root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            root: root.into(),
            max_depth: MAX_EXPANSION_DEPTH,
            tasks: Vec::new(),
            index: HashMap::new(),
            paths: HashMap::new(),
            stack: Vec::new(),
            resolved: HashMap::new(),
            deferred: Vec::new(),
            dropped: HashSet::new(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Expands `targets` and returns the finished graph.
    pub fn build(mut self, targets: &[String]) -> Result<TaskGraph, GraphError> {
        info!("Building task graph for {} target(s)", targets.len());
        let targets: Vec<String> = targets.iter().map(|t| normalize_path(t)).collect();

        for target in &targets {
            self.request(target, None)?;
        }

        self.resolve_aggregations()?;
        self.finish(targets)
    }

    fn request(&mut self, path: &str, requested_by: Option<&str>) -> Result<(), GraphError> {
        let path = normalize_path(path);

        if let Some(position) = self.stack.iter().position(|p| *p == path) {
            let mut cycle = self.stack[position..].to_vec();
            cycle.push(path);
            return Err(GraphError::CyclicDependency { cycle });
        }
        if self.paths.contains_key(&path) {
            return Ok(());
        }
        if self.stack.len() >= self.max_depth {
            return Err(GraphError::ExpansionTooDeep {
                path,
                limit: self.max_depth,
            });
        }

        let registry = self.registry;
        let (rule, binding) = match registry.find_producer(&path)? {
            Some(found) => found,
            None => {
                if self.root.join(&path).exists() {
                    debug!("'{}' is a source file", path);
                    self.paths.insert(path, PathState::Source);
                    return Ok(());
                }
                return Err(GraphError::NoProducer {
                    path,
                    requested_by: requested_by.map(str::to_string),
                });
            }
        };

        self.resolved
            .entry(rule.id.clone())
            .or_default()
            .insert(binding.clone());

        let outputs = rule
            .outputs
            .iter()
            .map(|t| t.instantiate(&binding).map(|p| normalize_path(&p)))
            .collect::<Result<Vec<_>, _>>()?;

        if rule.is_aggregate() {
            let index = self.create_task(rule, binding, outputs, Vec::new())?;
            self.deferred.push(index);
            return Ok(());
        }

        let inputs = rule
            .inputs
            .iter()
            .map(|t| t.instantiate(&binding).map(|p| normalize_path(&p)))
            .collect::<Result<Vec<_>, _>>()?;

        if self.is_fresh(&outputs, &inputs)? {
            debug!("{} is up to date", task_label(&rule.id, &binding));
            for output in outputs {
                self.paths.insert(output, PathState::Fresh);
            }
            return Ok(());
        }

        let label = task_label(&rule.id, &binding);
        self.create_task(rule, binding, outputs.clone(), inputs.clone())?;

        // Every output of the instance sits on the stack while its inputs expand.
        let depth = self.stack.len();
        self.stack.push(path.clone());
        self.stack.extend(outputs.into_iter().filter(|o| *o != path));

        for input in &inputs {
            if let Err(e) = self.request(input, Some(&label)) {
                self.stack.truncate(depth);
                return Err(e);
            }
        }
        self.stack.truncate(depth);

        debug!("Expanded {} ({} inputs)", label, inputs.len());
        Ok(())
    }

    fn create_task(
        &mut self,
        rule: &CompiledRule,
        binding: Binding,
        outputs: Vec<String>,
        inputs: Vec<String>,
    ) -> Result<usize, GraphError> {
        let key = (rule.id.clone(), binding.clone());
        if let Some(&existing) = self.index.get(&key) {
            return Ok(existing);
        }

        let log = match &rule.log {
            Some(template) => template.instantiate(&binding)?,
            None => default_log(&rule.id, &binding),
        };
        let params = rule
            .params
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.instantiate(&binding)?)))
            .collect::<Result<BTreeMap<_, _>, GraphError>>()?;

        let index = self.tasks.len();
        for output in &outputs {
            self.paths.insert(output.clone(), PathState::Produced(index));
        }
        self.tasks.push(TaskInstance {
            id: TaskId(index),
            rule: rule.id.clone(),
            binding,
            kind: if rule.is_aggregate() {
                TaskKind::Aggregate
            } else {
                TaskKind::Concrete
            },
            inputs,
            outputs,
            log,
            params,
        });
        self.index.insert(key, index);
        Ok(index)
    }

    /// Phase 2: fills deferred aggregation inputs from resolved bindings.
    fn resolve_aggregations(&mut self) -> Result<(), GraphError> {
        while let Some(index) = self.deferred.pop() {
            let registry = self.registry;
            let task_rule = self.tasks[index].rule.clone();
            let (collected, template) = match registry.get(&task_rule).map(|r| &r.action) {
                Some(RuleAction::Aggregate { rule, template, .. }) => (rule.clone(), template),
                _ => continue,
            };

            let mut inputs: Vec<String> = Vec::new();
            if let Some(bindings) = self.resolved.get(&collected) {
                for binding in bindings {
                    let path = normalize_path(&template.instantiate(binding)?);
                    if !inputs.contains(&path) {
                        inputs.push(path);
                    }
                }
            }

            let label = self.tasks[index].label();
            if inputs.is_empty() {
                warn!("{} collects no outputs of rule '{}'", label, collected);
            } else {
                info!("{} collects {} output(s) of rule '{}'", label, inputs.len(), collected);
            }

            for input in &inputs {
                self.request(input, Some(&label))?;
            }

            let upstream_pending = inputs
                .iter()
                .any(|i| matches!(self.paths.get(i), Some(PathState::Produced(_))));
            let outputs = self.tasks[index].outputs.clone();
            if !upstream_pending && self.is_fresh(&outputs, &inputs)? {
                debug!("{} is up to date", label);
                self.dropped.insert(index);
                for output in outputs {
                    self.paths.insert(output, PathState::Fresh);
                }
            }

            self.tasks[index].inputs = inputs;
        }
        Ok(())
    }

    /// True if every output exists and is strictly newer than every input.
    fn is_fresh(&self, outputs: &[String], inputs: &[String]) -> Result<bool, GraphError> {
        let mut oldest_output: Option<SystemTime> = None;
        for output in outputs {
            match modified(&self.root, output)? {
                Some(time) => {
                    oldest_output = Some(oldest_output.map_or(time, |o| o.min(time)));
                }
                None => return Ok(false),
            }
        }
        let Some(oldest_output) = oldest_output else {
            return Ok(false);
        };

        for input in inputs {
            match modified(&self.root, input)? {
                Some(time) if time < oldest_output => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn finish(self, targets: Vec<String>) -> Result<TaskGraph, GraphError> {
        // Renumber retained tasks in creation order.
        let mut remap: HashMap<usize, TaskId> = HashMap::new();
        let mut tasks = Vec::new();
        for (index, mut task) in self.tasks.into_iter().enumerate() {
            if self.dropped.contains(&index) {
                continue;
            }
            let id = TaskId(tasks.len());
            task.id = id;
            remap.insert(index, id);
            tasks.push(task);
        }

        let mut producers = HashMap::new();
        for (path, state) in &self.paths {
            if let PathState::Produced(index) = state {
                if let Some(&id) = remap.get(index) {
                    producers.insert(path.clone(), id);
                }
            }
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for task in &tasks {
            for input in &task.inputs {
                if let Some(&producer) = producers.get(input) {
                    if producer != task.id && !dependencies[task.id.0].contains(&producer) {
                        dependencies[task.id.0].push(producer);
                        dependents[producer.0].push(task.id);
                    }
                }
            }
        }

        let order = topological_sort(&tasks, &dependencies, &dependents)?;

        info!(
            "Task graph: {} task(s), {} dependency edge(s)",
            tasks.len(),
            dependencies.iter().map(Vec::len).sum::<usize>()
        );

        Ok(TaskGraph {
            tasks,
            dependencies,
            dependents,
            producers,
            targets,
            order,
        })
    }
}

fn modified(root: &Path, path: &str) -> Result<Option<SystemTime>, GraphError> {
    match fs::metadata(root.join(path)) {
        Ok(metadata) => metadata
            .modified()
            .map(Some)
            .map_err(|source| GraphError::Io {
                path: path.to_string(),
                source,
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(GraphError::Io {
            path: path.to_string(),
            source,
        }),
    }
}

/// Orders tasks so that producers come before consumers (Kahn's algorithm).
fn topological_sort(
    tasks: &[TaskInstance],
    dependencies: &[Vec<TaskId>],
    dependents: &[Vec<TaskId>],
) -> Result<Vec<TaskId>, GraphError> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut queue: VecDeque<TaskId> = tasks
        .iter()
        .filter(|t| in_degree[t.id.0] == 0)
        .map(|t| t.id)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(current) = queue.pop_front() {
        order.push(current);
        for &next in &dependents[current.0] {
            in_degree[next.0] -= 1;
            if in_degree[next.0] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != tasks.len() {
        let mut cycle: Vec<String> = tasks
            .iter()
            .filter(|t| in_degree[t.id.0] > 0)
            .map(TaskInstance::label)
            .collect();
        if let Some(first) = cycle.first().cloned() {
            cycle.push(first);
        }
        return Err(GraphError::CyclicDependency { cycle });
    }

    Ok(order)
}

/// Builds the graph for `targets` with default settings.
pub fn build_graph(
    registry: &RuleRegistry,
    targets: &[String],
    root: &Path,
) -> Result<TaskGraph, GraphError> {
    GraphBuilder::new(registry, root).build(targets)
}
