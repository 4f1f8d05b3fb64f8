//! Run Record Persistence
//!
//! The outcome of the latest run is saved to `.seqflow/last_run.json` in the
//! working directory: which tasks ran, how many attempts they took, what
//! failed and which targets could not be reached.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

/// File name of the run record inside `.seqflow/`.
const RECORD_FILE: &str = "last_run.json";

/// Outcome of one task in a finished run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskOutcome {
    pub task: String,
    pub state: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A target that could not be built, with the failure chain leading to it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UnreachableTarget {
    pub target: String,
    /// Failed task first, then each cancelled task down to the target
    pub chain: Vec<String>,
}

/// Persisted summary of a run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunRecord {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub dry_run: bool,
    pub targets: Vec<String>,
    pub tasks: Vec<TaskOutcome>,
    #[serde(default)]
    pub unreachable: Vec<UnreachableTarget>,
}

impl RunRecord {
    /// Creates an empty record for a run starting now.
    pub fn new(pipeline: &str, targets: Vec<String>, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            pipeline: pipeline.to_string(),
            started_at: now,
            finished_at: now,
            success: false,
            dry_run,
            targets,
            tasks: Vec::new(),
            unreachable: Vec::new(),
        }
    }

    /// Returns the record path for a working directory.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(".seqflow").join(RECORD_FILE)
    }

    /// Saves the record under `root/.seqflow/`.
    pub fn save(&self, root: &Path) -> std::io::Result<PathBuf> {
        let path = Self::path_in(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        info!("Saved run record to {}", path.display());
        Ok(path)
    }

    /// Loads the record of the last run in `root`.
    pub fn load(root: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(Self::path_in(root))?;
        let record = serde_json::from_str(&content)?;
        Ok(record)
    }

    /// Deletes the record if it exists.
    pub fn delete(root: &Path) -> std::io::Result<()> {
        let path = Self::path_in(root);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Deleted run record: {}", path.display());
        }
        Ok(())
    }

    /// Number of tasks that ended in `state`.
    pub fn count(&self, state: &str) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }
}
