//! Pipeline Definition Module
//!
//! Rules, templates and the task graph built from them.
//!
//! # Structure
//!
//! - [`wildcards`]: Path templates with named wildcards
//! - [`config`]: Config values, sample table and inclusion predicates
//! - [`model`]: Rule and pipeline file structures
//! - [`validator`]: Rule validation
//! - [`registry`]: Frozen, compiled rule set
//! - [`parser`]: YAML loading
//! - [`graph`]: Target paths to task DAG
//! - [`planner`]: Task state machine
//! - [`state`]: Persisted record of the last run

pub mod config;
pub mod graph;
pub mod model;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod state;
pub mod validator;
pub mod wildcards;

pub use config::{Config, Predicate, SampleTable};
pub use graph::{build_graph, TaskGraph, TaskId, TaskInstance};
pub use model::{Pipeline, Rule};
pub use parser::{load_pipeline, LoadedPipeline};
pub use planner::{ExecutionPlanner, TaskState};
pub use registry::{RegistryBuilder, RuleRegistry};
pub use state::RunRecord;
pub use wildcards::{Binding, Template};
