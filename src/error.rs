//! Error types with stable codes and fix suggestions (v0.1)

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum WeftError {
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // ─────────────────────────────────────────────────────────────
    // Graph validation errors (WEFT-010 to WEFT-015)
    // ─────────────────────────────────────────────────────────────

    #[error("WEFT-010: Duplicate task id '{id}'")]
    DuplicateTaskId { id: String },

    #[error("WEFT-011: Task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("WEFT-012: Invalid task id '{id}'")]
    InvalidTaskId { id: String },

    #[error("WEFT-013: Dependency cycle: {cycle_path}")]
    CycleDetected { cycle_path: String },

    #[error("WEFT-014: Branch target '{target}' on task '{task_id}' does not exist")]
    UnknownBranchTarget { task_id: String, target: String },

    #[error("WEFT-015: Task id '{id}' collides with a reserved variable root")]
    ReservedTaskId { id: String },

    // ─────────────────────────────────────────────────────────────
    // Variable resolution errors (WEFT-020 to WEFT-022)
    // ─────────────────────────────────────────────────────────────

    #[error("WEFT-020: Invalid variable path: {path}")]
    InvalidPath { path: String },

    #[error("WEFT-021: Unresolved variable '${{{path}}}' referenced by task '{task_id}'")]
    UnresolvedVariable { path: String, task_id: String },

    #[error("WEFT-022: Template parse error at position {position}: {details}")]
    TemplateParse { position: usize, details: String },

    // ─────────────────────────────────────────────────────────────
    // Execution errors (WEFT-030 to WEFT-034)
    // ─────────────────────────────────────────────────────────────

    #[error("WEFT-030: Tool '{name}' is not registered")]
    ToolNotFound { name: String },

    #[error("WEFT-031: Handler '{name}' is not registered")]
    HandlerNotFound { name: String },

    #[error("WEFT-032: Execution error: {0}")]
    Execution(String),

    #[error("WEFT-033: Task timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("WEFT-034: Task output exceeds size limit ({size} > {limit} bytes)")]
    OutputTooLarge { size: usize, limit: usize },

    // ─────────────────────────────────────────────────────────────
    // Terminal errors (WEFT-040 to WEFT-042)
    // ─────────────────────────────────────────────────────────────

    #[error("WEFT-040: Task '{task_id}' failed after {attempts} attempt(s)")]
    RetryExhausted { task_id: String, attempts: u32 },

    #[error("WEFT-041: Dependency '{dependency}' of task '{task_id}' failed")]
    DependencyFailed { task_id: String, dependency: String },

    #[error("WEFT-042: Workflow failed: {failed} unrecovered task(s)")]
    WorkflowFailed { failed: usize },

    #[error("WEFT-050: Workflow duration limit exceeded ({seconds}s)")]
    DurationLimit { seconds: u64 },
}

impl WeftError {
    /// Stable error code for the standardized envelope
    pub fn code(&self) -> &'static str {
        match self {
            WeftError::YamlParse(_) => "WEFT-001",
            WeftError::DuplicateTaskId { .. } => "WEFT-010",
            WeftError::UnknownDependency { .. } => "WEFT-011",
            WeftError::InvalidTaskId { .. } => "WEFT-012",
            WeftError::CycleDetected { .. } => "WEFT-013",
            WeftError::UnknownBranchTarget { .. } => "WEFT-014",
            WeftError::ReservedTaskId { .. } => "WEFT-015",
            WeftError::InvalidPath { .. } => "WEFT-020",
            WeftError::UnresolvedVariable { .. } => "WEFT-021",
            WeftError::TemplateParse { .. } => "WEFT-022",
            WeftError::ToolNotFound { .. } => "WEFT-030",
            WeftError::HandlerNotFound { .. } => "WEFT-031",
            WeftError::Execution(_) => "WEFT-032",
            WeftError::Timeout { .. } => "WEFT-033",
            WeftError::OutputTooLarge { .. } => "WEFT-034",
            WeftError::RetryExhausted { .. } => "WEFT-040",
            WeftError::DependencyFailed { .. } => "WEFT-041",
            WeftError::WorkflowFailed { .. } => "WEFT-042",
            WeftError::DurationLimit { .. } => "WEFT-050",
        }
    }
}

impl FixSuggestion for WeftError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            WeftError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            WeftError::DuplicateTaskId { .. } => Some("Give every task a unique id"),
            WeftError::UnknownDependency { .. } => {
                Some("Verify the dependency id matches an existing task")
            }
            WeftError::InvalidTaskId { .. } => {
                Some("Use ids matching [A-Za-z_][A-Za-z0-9_-]*")
            }
            WeftError::CycleDetected { .. } => {
                Some("Remove one edge of the cycle - the task graph must be a DAG")
            }
            WeftError::UnknownBranchTarget { .. } => {
                Some("Point onSuccess/onFailure at an existing task id")
            }
            WeftError::ReservedTaskId { .. } => {
                Some("Rename the task - 'workflow_input' and 'error' are reserved roots")
            }
            WeftError::InvalidPath { .. } => Some("Use paths like task_id.output_data.result.field"),
            WeftError::UnresolvedVariable { .. } => {
                Some("Add a default (${path | value}) or depend on the task that produces it")
            }
            WeftError::TemplateParse { .. } => Some("Check ${...} placeholders are terminated"),
            WeftError::ToolNotFound { .. } => {
                Some("Register the tool before building the registry snapshot")
            }
            WeftError::HandlerNotFound { .. } => {
                Some("Register the handler before starting the run")
            }
            WeftError::Execution(_) => None,
            WeftError::Timeout { .. } => Some("Increase config.timeout or speed up the executor"),
            WeftError::OutputTooLarge { .. } => {
                Some("Raise RunLimits::max_output_bytes or trim the executor output")
            }
            WeftError::RetryExhausted { .. } => {
                Some("Increase config.maxRetries or fix the underlying failure")
            }
            WeftError::DependencyFailed { .. } => {
                Some("Add an onFailure branch or set tolerateFailedDeps on the dependent")
            }
            WeftError::WorkflowFailed { .. } => {
                Some("Inspect error_summary for the failing tasks")
            }
            WeftError::DurationLimit { .. } => Some("Raise RunLimits::max_workflow_duration"),
        }
    }
}
