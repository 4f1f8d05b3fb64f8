//! Execution Planner
//!
//! Tracks the state machine of every task in a [`TaskGraph`]:
//!
//! ```text
//! Pending -> Ready -> Running -> Succeeded
//!                             -> FailedRetryable -> Ready (attempt + 1)
//!                             -> FailedTerminal
//! Pending -> Cancelled            (a dependency failed terminally)
//! ```
//!
//! A task becomes ready only when every producer it depends on has
//! succeeded. The planner does not run anything; the engine asks it which
//! tasks are ready and reports back what happened.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use super::graph::{TaskGraph, TaskId};
use crate::execution::retry::{Resources, RetryPolicy};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Cancelled,
}

impl TaskState {
    /// True for states a task never leaves.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::FailedTerminal | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::FailedRetryable => "failed (retrying)",
            TaskState::FailedTerminal => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Execution record of one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub label: String,
    pub state: TaskState,
    /// Current attempt, starting at 1
    pub attempt: u32,
    /// Every state the task has been in, in order
    pub history: Vec<TaskState>,
    /// Resources requested by each started attempt
    pub requests: Vec<Resources>,
    /// Error of the latest failed attempt
    pub error: Option<String>,
    /// Terminal failure that cancelled this task
    pub cancelled_by: Option<TaskId>,
    /// When the current attempt started
    pub start_time: Option<Instant>,
    /// Duration of the latest finished attempt
    pub duration_ms: Option<u128>,
}

impl TaskRecord {
    fn new(id: TaskId, label: String) -> Self {
        Self {
            id,
            label,
            state: TaskState::Pending,
            attempt: 1,
            history: vec![TaskState::Pending],
            requests: Vec::new(),
            error: None,
            cancelled_by: None,
            start_time: None,
            duration_ms: None,
        }
    }

    fn transition(&mut self, state: TaskState) {
        self.state = state;
        self.history.push(state);
    }

    fn stop_clock(&mut self) {
        if let Some(start) = self.start_time.take() {
            self.duration_ms = Some(start.elapsed().as_millis());
        }
    }
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task is ready again for `attempt`
    Retry { attempt: u32 },
    /// No attempts left; `cancelled` lists the transitive dependents
    Terminal { cancelled: Vec<TaskId> },
}

/// Manages task states and readiness for one run.
pub struct ExecutionPlanner {
    records: Vec<TaskRecord>,
    policies: Vec<RetryPolicy>,
    /// Dependencies not yet succeeded, per task
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<TaskId>>,
    ready: VecDeque<TaskId>,
    running: usize,
}

impl ExecutionPlanner {
    /// Creates a planner for `graph`. `policies` holds one retry policy per
    /// task, indexed by task id.
    pub fn new(graph: &TaskGraph, policies: Vec<RetryPolicy>) -> Self {
        let mut records: Vec<TaskRecord> = graph
            .tasks()
            .iter()
            .map(|t| TaskRecord::new(t.id, t.label()))
            .collect();
        let waiting_on: Vec<usize> = graph
            .tasks()
            .iter()
            .map(|t| graph.dependencies(t.id).len())
            .collect();
        let dependents = graph
            .tasks()
            .iter()
            .map(|t| graph.dependents(t.id).to_vec())
            .collect();

        // Roots in topological order.
        let mut ready = VecDeque::new();
        for &id in graph.topological_order() {
            if waiting_on[id.0] == 0 {
                records[id.0].transition(TaskState::Ready);
                ready.push_back(id);
            }
        }

        info!(
            "Planner: {} task(s), {} ready",
            records.len(),
            ready.len()
        );

        Self {
            records,
            policies,
            waiting_on,
            dependents,
            ready,
            running: 0,
        }
    }

    /// Ready tasks in the order they became ready.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.ready.iter().copied().collect()
    }

    pub fn record(&self, id: TaskId) -> &TaskRecord {
        &self.records[id.0]
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TaskRecord> {
        self.records
    }

    pub fn running(&self) -> usize {
        self.running
    }

    /// Marks a ready task as running with the resources granted to it.
    pub fn mark_running(&mut self, id: TaskId, request: Resources) {
        self.ready.retain(|&r| r != id);
        self.running += 1;

        let record = &mut self.records[id.0];
        record.transition(TaskState::Running);
        record.requests.push(request);
        record.start_time = Some(Instant::now());
        debug!(
            "{} running (attempt {}, {} MB, {} threads)",
            record.label, record.attempt, request.mem_mb, request.threads
        );
    }

    /// Marks a running task as succeeded and readies its dependents.
    ///
    /// Returns the tasks that became ready.
    pub fn mark_succeeded(&mut self, id: TaskId) -> Vec<TaskId> {
        self.running = self.running.saturating_sub(1);
        let record = &mut self.records[id.0];
        record.stop_clock();
        record.transition(TaskState::Succeeded);
        record.error = None;

        let mut released = Vec::new();
        for &next in &self.dependents[id.0] {
            self.waiting_on[next.0] = self.waiting_on[next.0].saturating_sub(1);
            let dependent = &mut self.records[next.0];
            if self.waiting_on[next.0] == 0 && dependent.state == TaskState::Pending {
                dependent.transition(TaskState::Ready);
                self.ready.push_back(next);
                released.push(next);
            }
        }
        released
    }

    /// Marks a running task's attempt as failed.
    ///
    /// A retryable failure readies the task again with the next attempt
    /// while its retry policy allows. Otherwise it fails terminally and
    /// every transitive dependent is cancelled.
    pub fn mark_failed(&mut self, id: TaskId, error: String, retryable: bool) -> FailureOutcome {
        self.running = self.running.saturating_sub(1);
        let policy = self.policies.get(id.0).copied().unwrap_or_default();

        let record = &mut self.records[id.0];
        record.stop_clock();
        record.error = Some(error);

        if retryable && policy.should_retry(record.attempt) {
            record.transition(TaskState::FailedRetryable);
            record.attempt += 1;
            record.transition(TaskState::Ready);
            warn!(
                "{} failed; retrying (attempt {}/{})",
                record.label, record.attempt, policy.max_attempts
            );
            let attempt = record.attempt;
            self.ready.push_back(id);
            return FailureOutcome::Retry { attempt };
        }

        record.transition(TaskState::FailedTerminal);
        let cancelled = self.cancel_dependents(id);
        FailureOutcome::Terminal { cancelled }
    }

    fn cancel_dependents(&mut self, failed: TaskId) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut queue: VecDeque<TaskId> = self.dependents[failed.0].iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            let record = &mut self.records[next.0];
            if record.state.is_final() {
                continue;
            }
            record.transition(TaskState::Cancelled);
            record.cancelled_by = Some(failed);
            debug!("{} cancelled", record.label);
            self.ready.retain(|&r| r != next);
            cancelled.push(next);
            queue.extend(self.dependents[next.0].iter().copied());
        }

        if !cancelled.is_empty() {
            warn!(
                "{} failed terminally; cancelled {} dependent task(s)",
                self.records[failed.0].label,
                cancelled.len()
            );
        }
        cancelled
    }

    /// Returns true while some task is ready or running.
    pub fn has_work_remaining(&self) -> bool {
        !self.ready.is_empty() || self.running > 0
    }

    /// Returns the current progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self.records.iter().filter(|r| r.state.is_final()).count();
        (done, self.records.len())
    }
}
