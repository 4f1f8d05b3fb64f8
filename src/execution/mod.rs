//! Pipeline Execution Module
//!
//! # Architecture
//!
//! - [`engine`]: Scheduling loop, retries and failure propagation
//! - [`action`]: One attempt of one task (shell, tool or aggregation)
//! - [`budget`]: Shared memory/thread budget
//! - [`retry`]: Attempt-indexed resource scaling and retry policy
//! - [`aggregate`]: Per-sample, per-stage count tables

pub mod action;
pub mod aggregate;
pub mod budget;
pub mod engine;
pub mod retry;

pub use budget::{Capacity, ResourceBudget};
pub use engine::{Engine, RunReport};
pub use retry::{ResourceSpec, Resources, RetryPolicy, Scaling};
