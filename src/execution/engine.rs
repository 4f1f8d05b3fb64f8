//! Execution Engine
//!
//! Drives a run from requested targets to finished files:
//! - Graph construction (fatal errors abort before anything runs)
//! - Budget-aware admission of ready tasks, one worker thread per attempt
//! - Attempt-indexed resource scaling and retries
//! - Cancellation of dependents after terminal failures, while independent
//!   branches keep running
//! - A [`RunReport`] plus a persisted [`RunRecord`]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};

use super::action::{execute_action, render_command};
use super::budget::{Capacity, ResourceBudget};
use super::retry::{Resources, RetryPolicy};
use crate::error::{GraphError, RunError, TaskError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::graph::{GraphBuilder, TaskGraph, TaskId, MAX_EXPANSION_DEPTH};
use crate::workflow::planner::{ExecutionPlanner, FailureOutcome, TaskRecord, TaskState};
use crate::workflow::registry::RuleRegistry;
use crate::workflow::state::{RunRecord, TaskOutcome, UnreachableTarget};

/// Message sent by a worker when an attempt finishes.
struct Completion {
    id: TaskId,
    attempt: u32,
    result: Result<(), String>,
    /// False when another attempt cannot succeed
    retryable: bool,
}

/// Outcome of a run.
#[derive(Debug)]
pub struct RunReport {
    /// Final record of every task, indexed by task id
    pub tasks: Vec<TaskRecord>,
    /// (task label, error) of every terminal failure
    pub failures: Vec<(String, String)>,
    /// Requested targets that were not produced
    pub unreachable: Vec<UnreachableTarget>,
    /// Number of attempts handed to workers
    pub dispatched: usize,
    pub elapsed_ms: u128,
    pub dry_run: bool,
    pub timeline: ExecutionTimeline,
}

impl RunReport {
    /// True when every task succeeded (dry run: when the graph was built).
    pub fn is_success(&self) -> bool {
        if self.dry_run {
            return true;
        }
        self.failures.is_empty()
            && self.unreachable.is_empty()
            && self.tasks.iter().all(|t| t.state == TaskState::Succeeded)
    }

    /// Number of tasks that ended in `state`.
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    pub fn task(&self, label: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.label == label)
    }
}

/// Pipeline execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use seqflow::execution::Engine;
/// use seqflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     let mut engine = Engine::new(pipeline.registry, pipeline.targets);
///     engine.set_working_dir("/data/analysis");
///     engine.set_max_attempts(3);
///
///     let report = engine.run()?;
///     assert!(report.is_success());
///     Ok(())
/// }
/// ```
pub struct Engine {
    registry: RuleRegistry,
    targets: Vec<String>,
    pipeline_path: String,
    working_dir: PathBuf,
    capacity: Capacity,
    max_attempts: u32,
    max_depth: usize,
    dry_run: bool,
}

impl Engine {
    /// Creates an engine using the whole machine as budget and one attempt
    /// per task.
    pub fn new(registry: RuleRegistry, targets: Vec<String>) -> Self {
        Self {
            registry,
            targets,
            pipeline_path: "pipeline.yaml".to_string(),
            working_dir: PathBuf::from("."),
            capacity: Capacity::system(),
            max_attempts: 1,
            max_depth: MAX_EXPANSION_DEPTH,
            dry_run: false,
        }
    }

    /// Sets the pipeline file name stored in the run record.
    pub fn set_pipeline_path(&mut self, path: impl Into<String>) {
        self.pipeline_path = path.into();
    }

    /// Sets the directory all paths are relative to.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = dir.into();
    }

    pub fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    /// Default attempt limit for rules without their own `max_attempts`.
    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.max_attempts = max_attempts.max(1);
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Builds the task graph for the configured targets.
    pub fn plan(&self) -> Result<TaskGraph, GraphError> {
        GraphBuilder::new(&self.registry, &self.working_dir)
            .with_max_depth(self.max_depth)
            .build(&self.targets)
    }

    /// Executes the run.
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - The run finished; task failures are in the report
    /// * `Err` - The graph could not be built, or the engine itself failed
    pub fn run(&self) -> Result<RunReport, RunError> {
        let start_time = Instant::now();
        let graph = self.plan()?;

        if graph.is_empty() {
            info!("Nothing to be done: all targets are up to date");
        } else {
            info!(
                "Scheduling {} task(s) (budget: {} MB, {} threads, dry run: {})",
                graph.len(),
                self.capacity.mem_mb,
                self.capacity.threads,
                self.dry_run
            );
        }

        let policies = graph
            .tasks()
            .iter()
            .map(|task| {
                let rule_limit = self.registry.get(&task.rule).and_then(|r| r.max_attempts);
                RetryPolicy::for_rule(rule_limit, self.max_attempts)
            })
            .collect();
        let mut planner = ExecutionPlanner::new(&graph, policies);
        let mut timeline = ExecutionTimeline::new();

        let dispatched = if self.dry_run {
            self.print_dry_run(&graph);
            0
        } else {
            self.execute(&graph, &mut planner, &mut timeline)?
        };

        let tasks = planner.into_records();
        let failures = tasks
            .iter()
            .filter(|t| t.state == TaskState::FailedTerminal)
            .map(|t| (t.label.clone(), t.error.clone().unwrap_or_default()))
            .collect();
        let unreachable = if self.dry_run {
            Vec::new()
        } else {
            unreachable_targets(&graph, &tasks)
        };

        let report = RunReport {
            tasks,
            failures,
            unreachable,
            dispatched,
            elapsed_ms: start_time.elapsed().as_millis(),
            dry_run: self.dry_run,
            timeline,
        };

        if !self.dry_run {
            self.save_record(&report);
        }
        Ok(report)
    }

    /// Main scheduling loop. Returns the number of dispatched attempts.
    fn execute(
        &self,
        graph: &TaskGraph,
        planner: &mut ExecutionPlanner,
        timeline: &mut ExecutionTimeline,
    ) -> Result<usize, RunError> {
        let budget = ResourceBudget::new(self.capacity);
        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let mut dispatched = 0;

        loop {
            // Admit ready tasks while the budget allows
            for id in planner.ready_tasks() {
                if planner.record(id).state != TaskState::Ready {
                    continue;
                }
                let task = graph.task(id);
                let Some(rule) = self.registry.get(&task.rule) else {
                    let e = TaskError::UnknownRule(task.rule.clone());
                    error!("{}: {}", task.label(), e);
                    let nothing = Resources {
                        mem_mb: 0,
                        runtime: 0,
                        threads: 0,
                    };
                    planner.mark_running(id, nothing);
                    self.handle_failure(planner, timeline, graph, id, e.to_string(), false);
                    continue;
                };

                let attempt = planner.record(id).attempt;
                let request = budget.clamp(rule.resources.resources(attempt, rule.threads));
                let Some(allocation) = budget.try_acquire(request) else {
                    debug!("{} waiting for resources", task.label());
                    continue;
                };

                info!("Starting {} (attempt {})", task.label(), attempt);
                planner.mark_running(id, request);
                timeline.add_event(task.label(), EventType::Started);

                let tx = tx.clone();
                let task = task.clone();
                let action = rule.action.clone();
                let root = self.working_dir.clone();

                thread::spawn(move || {
                    let outcome = execute_action(&task, &action, attempt, request, &root);
                    drop(allocation);

                    let retryable = outcome.as_ref().err().map_or(true, TaskError::is_retryable);
                    let result = outcome.map_err(|e| e.to_string());
                    if let Err(e) = tx.send(Completion {
                        id,
                        attempt,
                        result,
                        retryable,
                    }) {
                        error!("Failed to send completion signal: {}", e);
                    }
                });
                dispatched += 1;
            }

            if planner.running() == 0 {
                if planner.has_work_remaining() {
                    // Only reachable with an empty budget
                    error!("Ready tasks cannot be admitted with the configured budget");
                }
                break;
            }

            let completion = rx
                .recv()
                .map_err(|_| RunError::Disconnected(planner.running()))?;
            let label = graph.task(completion.id).label();

            match completion.result {
                Ok(()) => {
                    info!("{} completed successfully", label);
                    planner.mark_succeeded(completion.id);
                    timeline.add_event(label, EventType::Succeeded);
                }
                Err(e) => {
                    warn!("{} failed (attempt {}): {}", label, completion.attempt, e);
                    self.handle_failure(
                        planner,
                        timeline,
                        graph,
                        completion.id,
                        e,
                        completion.retryable,
                    );
                }
            }

            let (done, total) = planner.progress();
            debug!("Progress: {}/{} task(s) finished", done, total);
        }

        Ok(dispatched)
    }

    fn handle_failure(
        &self,
        planner: &mut ExecutionPlanner,
        timeline: &mut ExecutionTimeline,
        graph: &TaskGraph,
        id: TaskId,
        error: String,
        retryable: bool,
    ) {
        let label = graph.task(id).label();
        timeline.add_event(label.clone(), EventType::Failed);

        match planner.mark_failed(id, error, retryable) {
            FailureOutcome::Retry { attempt } => {
                debug!("{} scheduled for attempt {}", label, attempt);
            }
            FailureOutcome::Terminal { cancelled } => {
                error!("{} failed after {} attempt(s)", label, planner.record(id).attempt);
                for cancelled_id in cancelled {
                    timeline.add_event(graph.task(cancelled_id).label(), EventType::Cancelled);
                }
            }
        }
    }

    fn print_dry_run(&self, graph: &TaskGraph) {
        for &id in graph.topological_order() {
            let task = graph.task(id);
            let Some(rule) = self.registry.get(&task.rule) else {
                continue;
            };
            let resources = rule.resources.resources(1, rule.threads);

            println!();
            println!("[DRY RUN] Task: {}", task.label());
            println!("  Input: {:?}", task.inputs);
            println!("  Output: {:?}", task.outputs);
            println!("  Log: {}", task.log);
            println!(
                "  Resources: {} MB, {} min, {} thread(s)",
                resources.mem_mb, resources.runtime, resources.threads
            );
            match render_command(task, &rule.action, 1, resources) {
                Ok(command) => println!("  Command: {}", command),
                Err(e) => println!("  Command: <{}>", e),
            }
        }
    }

    fn save_record(&self, report: &RunReport) {
        let mut record = RunRecord::new(&self.pipeline_path, self.targets.clone(), false);
        record.tasks = report
            .tasks
            .iter()
            .map(|t| TaskOutcome {
                task: t.label.clone(),
                state: t.state.to_string(),
                attempts: t.attempt,
                error: t.error.clone(),
            })
            .collect();
        record.unreachable = report.unreachable.clone();
        record.success = report.is_success();
        record.finished_at = Utc::now();

        if let Err(e) = record.save(&self.working_dir) {
            warn!("Failed to save run record: {}", e);
        }
    }
}

/// Targets whose producing task did not succeed, with the chain from the
/// failed task down to the target's producer.
fn unreachable_targets(graph: &TaskGraph, records: &[TaskRecord]) -> Vec<UnreachableTarget> {
    graph
        .targets()
        .iter()
        .filter_map(|target| {
            let producer = graph.producer_of(target)?;
            let record = &records[producer.0];
            if record.state == TaskState::Succeeded {
                return None;
            }

            let chain = match record.cancelled_by {
                Some(failed) => failure_chain(graph, failed, producer),
                None => vec![record.label.clone()],
            };
            Some(UnreachableTarget {
                target: target.clone(),
                chain,
            })
        })
        .collect()
}

/// Shortest dependent path from `failed` to `task`, as labels.
fn failure_chain(graph: &TaskGraph, failed: TaskId, task: TaskId) -> Vec<String> {
    let mut parent: HashMap<TaskId, TaskId> = HashMap::new();
    let mut queue = VecDeque::from([failed]);

    while let Some(current) = queue.pop_front() {
        if current == task {
            break;
        }
        for &next in graph.dependents(current) {
            if next != failed && !parent.contains_key(&next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    let mut chain = vec![graph.task(task).label()];
    let mut current = task;
    while let Some(&prev) = parent.get(&current) {
        chain.push(graph.task(prev).label());
        current = prev;
    }
    if current != failed {
        chain.push(graph.task(failed).label());
    }
    chain.reverse();
    chain
}
