//! Pipeline Parser
//!
//! Loads a pipeline definition from YAML: static configuration, the sample
//! table, rules and default targets. Rules are registered and frozen into a
//! [`RuleRegistry`] here, so a loaded pipeline is ready for graph
//! construction.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use super::config::{scalar_to_string, Config, SampleTable};
use super::model::{Pipeline, TargetSpec, ValueSource};
use super::registry::{RegistryBuilder, RuleRegistry};
use super::wildcards::{expand, Template};
use crate::error::PipelineError;

/// A parsed pipeline with its registry frozen.
#[derive(Debug)]
pub struct LoadedPipeline {
    pub registry: RuleRegistry,
    pub config: Config,
    /// Default targets, already expanded to concrete paths
    pub targets: Vec<String>,
}

/// Loads a pipeline from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Loads the sample table (inline rows or a TSV next to the pipeline)
/// 3. Evaluates inclusion predicates and validates the rules
/// 4. Expands the default targets
///
/// # Example
///
/// ```rust,no_run
/// use seqflow::workflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} rules", pipeline.registry.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<LoadedPipeline, PipelineError> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| PipelineError::Read {
        path: path.display().to_string(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_pipeline(&content, base_dir)
}

/// Parses pipeline YAML. Relative sample-table paths resolve against
/// `base_dir`.
pub fn parse_pipeline(yaml: &str, base_dir: &Path) -> Result<LoadedPipeline, PipelineError> {
    let pipeline: Pipeline = serde_yaml::from_str(yaml)?;
    info!(
        "Parsed {} rules, {} target specs",
        pipeline.rules.len(),
        pipeline.targets.len()
    );

    let samples = load_samples(&pipeline, base_dir)?;
    let config = Config::new(pipeline.config.clone(), samples);

    let mut builder = RegistryBuilder::new()
        .with_constraints(pipeline.wildcard_constraints.clone())
        .with_stages(pipeline.stages.clone());
    for rule in pipeline.rules {
        builder.register(rule)?;
    }
    let registry = builder.build(&config)?;

    let targets = resolve_targets(&pipeline.targets, &config, &pipeline.wildcard_constraints)?;
    debug!("Default targets: {:?}", targets);

    Ok(LoadedPipeline {
        registry,
        config,
        targets,
    })
}

fn load_samples(pipeline: &Pipeline, base_dir: &Path) -> Result<SampleTable, PipelineError> {
    if let Some(table) = &pipeline.sample_table {
        if !pipeline.samples.is_empty() {
            warn!("Both samples and sample_table given; using '{}'", table);
        }
        let path = base_dir.join(table);
        let content = fs::read_to_string(&path).map_err(|source| PipelineError::Read {
            path: path.display().to_string(),
            source,
        })?;
        return SampleTable::parse_tsv(&content, table);
    }

    let mut rows = Vec::with_capacity(pipeline.samples.len());
    for (index, raw) in pipeline.samples.iter().enumerate() {
        let mut row = BTreeMap::new();
        for (key, value) in raw {
            let value = scalar_to_string(value).ok_or_else(|| PipelineError::SampleTable {
                path: "samples".to_string(),
                reason: format!("row {} column '{}' is not a scalar", index + 1, key),
            })?;
            row.insert(key.clone(), value);
        }
        rows.push(row);
    }
    Ok(SampleTable::from_rows(rows))
}

/// Expands target specs into concrete paths, in order, without duplicates.
pub fn resolve_targets(
    specs: &[TargetSpec],
    config: &Config,
    constraints: &BTreeMap<String, String>,
) -> Result<Vec<String>, PipelineError> {
    let mut targets: Vec<String> = Vec::new();

    for spec in specs {
        let paths = match spec {
            TargetSpec::Path(path) => vec![path.clone()],
            TargetSpec::Pattern { pattern, expand: sources } => {
                let template = Template::with_constraints(pattern, constraints)?;
                let mut values = BTreeMap::new();
                for (name, source) in sources {
                    values.insert(name.clone(), source_values(pattern, source, config)?);
                }
                expand(&template, &values)?
            }
        };

        for path in paths {
            if !targets.contains(&path) {
                targets.push(path);
            }
        }
    }

    Ok(targets)
}

fn source_values(
    target: &str,
    source: &ValueSource,
    config: &Config,
) -> Result<Vec<String>, PipelineError> {
    match source {
        ValueSource::Values(values) => Ok(values.clone()),
        ValueSource::Column { column } => {
            config
                .samples()
                .column(column)
                .ok_or_else(|| PipelineError::UnknownColumn {
                    target: target.to_string(),
                    column: column.clone(),
                })
        }
        ValueSource::Config { config: key } => {
            config
                .string_list(key)
                .ok_or_else(|| PipelineError::ConfigValues {
                    target: target.to_string(),
                    key: key.clone(),
                })
        }
    }
}
