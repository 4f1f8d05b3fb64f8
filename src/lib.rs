//! seqflow - Rule-Based Pipeline Engine
//!
//! A declarative build engine for multi-stage sequencing pipelines. Rules
//! declare outputs as path templates with named wildcards; requested target
//! paths are resolved backwards into a DAG of tasks that run under a shared
//! memory/thread budget, with more resources on every retry.
//!
//! # Architecture
//!
//! - [`workflow`]: Templates, rules, registry and task graph
//! - [`execution`]: Scheduling engine, actions and aggregation
//! - [`monitoring`]: Execution timeline
//! - [`error`]: Error types for every layer
//!
//! # Example
//!
//! ```rust,no_run
//! use seqflow::execution::Engine;
//! use seqflow::load_pipeline;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = load_pipeline("pipeline.yaml")?;
//!
//!     let mut engine = Engine::new(pipeline.registry, pipeline.targets);
//!     engine.set_working_dir("/data/analysis");
//!
//!     let report = engine.run()?;
//!     println!("{} task(s) dispatched", report.dispatched);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{GraphError, PipelineError, RunError, TaskError};
pub use execution::engine::{Engine, RunReport};
pub use workflow::model::Rule;
pub use workflow::parser::load_pipeline;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "seqflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "seqflow");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }

    #[test]
    fn test_module_exports_rule() {
        let rule = Rule::new("trim").with_output("trimmed/{sample}.fastq");
        assert_eq!(rule.id, "trim");
        assert_eq!(rule.output.len(), 1);
    }
}
