//! Execution Timeline
//!
//! Records when task attempts start and how they end, for the Gantt chart
//! and per-task durations printed after a run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// An attempt started
    Started,
    /// An attempt succeeded
    Succeeded,
    /// An attempt failed (retryable or terminal)
    Failed,
    /// The task was cancelled by an upstream failure
    Cancelled,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Task label, e.g. `trim[sample=A]`
    pub task: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
///
/// A retried task has several `Started` events; its bar spans from the first
/// start to the last end.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a task.
    pub fn add_event(&mut self, task: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            task: task.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Total elapsed time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of `Started` events for a task.
    pub fn attempts(&self, task: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.task == task && e.event_type == EventType::Started)
            .count()
    }

    /// (first start, last end) in milliseconds since the timeline started,
    /// for every task that ran.
    fn spans(&self) -> HashMap<String, (u128, Option<u128>)> {
        let mut spans: HashMap<String, (u128, Option<u128>)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    spans.entry(event.task.clone()).or_insert((elapsed, None));
                }
                EventType::Succeeded | EventType::Failed => {
                    if let Some(span) = spans.get_mut(&event.task) {
                        span.1 = Some(elapsed);
                    }
                }
                EventType::Cancelled => {}
            }
        }
        spans
    }

    /// Generates an ASCII Gantt chart, one bar per task that ran.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // 50 columns wide
        let scale = 50.0 / total_time as f64;

        let mut rows: Vec<(String, u128, u128)> = self
            .spans()
            .into_iter()
            .filter_map(|(task, (start, end))| end.map(|end| (task, start, end)))
            .collect();
        rows.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        for (task, start, end) in rows {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{} |{}| ({} ms)\n",
                truncate(&task, 20),
                bar,
                end.saturating_sub(start)
            ));
        }

        let cancelled: Vec<&str> = self
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Cancelled)
            .map(|e| e.task.as_str())
            .collect();
        if !cancelled.is_empty() {
            output.push_str(&format!("\nCancelled: {}\n", cancelled.join(", ")));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Wall time per task in milliseconds, from first start to last end.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(task, (start, end))| end.map(|end| (task, end.saturating_sub(start))))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("trim[sample=A]", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("trim[sample=A]", EventType::Succeeded);

        let durations = timeline.durations();
        assert!(durations["trim[sample=A]"] >= 50);
    }

    #[test]
    fn test_retried_task_spans_all_attempts() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("align", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("align", EventType::Failed);
        timeline.add_event("align", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("align", EventType::Succeeded);

        assert_eq!(timeline.attempts("align"), 2);
        assert!(timeline.durations()["align"] >= 40);
    }

    #[test]
    fn test_unfinished_task_has_no_duration() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("count", EventType::Started);
        assert!(timeline.durations().is_empty());
    }

    #[test]
    fn test_gantt_chart() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("trim", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("trim", EventType::Succeeded);
        timeline.add_event("align", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("align", EventType::Failed);
        timeline.add_event("report", EventType::Cancelled);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("trim"));
        assert!(chart.contains("align"));
        assert!(chart.contains("Cancelled: report"));
        assert!(chart.contains("Total:"));

        let trim_line = chart.lines().position(|l| l.starts_with("trim")).unwrap();
        let align_line = chart.lines().position(|l| l.starts_with("align")).unwrap();
        assert!(trim_line < align_line);
    }

    #[test]
    fn test_truncate_long_label() {
        let label = truncate("deduplicate[sample=very_long_name]", 20);
        assert_eq!(label.chars().count(), 20);
        assert!(label.ends_with("..."));
        assert_eq!(truncate("trim", 6), "trim  ");
    }
}
