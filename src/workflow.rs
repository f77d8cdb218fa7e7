//! Workflow parsing structures

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::WeftError;
use crate::task::Task;
use crate::template::ResolutionMode;

/// Valid task id shape, also enforced by the graph builder
pub static TASK_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex"));

/// Workflow parsed from YAML (raw)
#[derive(Debug, Deserialize)]
struct WorkflowRaw {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub tasks: Vec<Task>,
}

/// Workflow with Arc-wrapped tasks for efficient cloning
#[derive(Debug)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// Declared session inputs, merged under `${workflow_input.*}` at run time
    pub inputs: Map<String, Value>,
    pub settings: WorkflowSettings,
    pub tasks: Vec<Arc<Task>>,
}

impl<'de> Deserialize<'de> for Workflow {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = WorkflowRaw::deserialize(deserializer)?;
        let id = raw.id.unwrap_or_else(|| "workflow".to_string());
        let name = raw.name.unwrap_or_else(|| id.clone());
        Ok(Workflow {
            id,
            name,
            inputs: raw.inputs,
            settings: raw.settings,
            tasks: raw.tasks.into_iter().map(Arc::new).collect(),
        })
    }
}

impl Workflow {
    /// Parse a workflow definition from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self, WeftError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Run-wide settings with sensible defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Sequential (default) or concurrent dispatch
    pub mode: SchedulingMode,

    /// Upper bound on simultaneously running tasks in concurrent mode
    pub max_in_flight: usize,

    /// Default resolution mode, overridable per task
    pub resolution: ResolutionMode,

    /// What happens to dependents of a permanently failed task
    pub on_dependency_failure: DependencyFailurePolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::Sequential,
            max_in_flight: 4,
            resolution: ResolutionMode::Strict,
            on_dependency_failure: DependencyFailurePolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    #[default]
    Sequential,
    Concurrent,
}

/// Skip: dependents of a permanently failed task are marked Skipped.
/// Fail: dependents are marked Failed with a dependency error.
/// Either way the cascade continues through the dependents' dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    #[default]
    Skip,
    Fail,
}
