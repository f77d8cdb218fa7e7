//! Task descriptors
//!
//! A task pairs an action (exactly one of `llm:`, `tool:`, `handler:`) with an
//! input template, dependencies, an optional condition, and a config block.
//! Descriptors are immutable once loaded; runtime state (status, attempts,
//! published output) lives in the runner's arena.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ResolutionContext;
use crate::template::ResolutionMode;

/// Default backoff between retry attempts (1 second)
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// A workflow task
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    /// Unique task identifier
    pub id: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The action - exactly one keyword
    #[serde(flatten)]
    pub action: TaskAction,

    /// Input template; leaf strings may contain `${...}` expressions
    #[serde(default = "empty_input")]
    pub input: Value,

    /// Tasks that must reach a terminal state first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Optional predicate; false means Skipped instead of Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Optional config block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
}

fn empty_input() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The 3 task actions - serde auto-detects which one
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TaskAction {
    /// llm: one-shot model invocation
    Llm { llm: LlmDef },

    /// tool: named lookup in the run's tool registry
    Tool { tool: ToolDef },

    /// handler: caller-supplied inline function, bypassing the registry
    Handler { handler: HandlerDef },
}

/// LLM invocation definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmDef {
    /// The prompt (may contain `${...}` expressions)
    pub prompt: String,

    /// Override model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Tool invocation definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDef {
    /// Registered tool name
    pub name: String,
}

/// Inline handler definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerDef {
    /// Handler name in the caller-supplied handler map
    pub name: String,
}

/// Task kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Llm,
    Tool,
    Handler,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Llm => write!(f, "llm"),
            TaskKind::Tool => write!(f, "tool"),
            TaskKind::Handler => write!(f, "handler"),
        }
    }
}

/// Task configuration - same shape for all kinds
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Additional attempts after the first failure (0 = no retries)
    #[serde(default)]
    pub max_retries: u32,

    /// Delay between attempts, e.g. "500ms", "2s"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<String>,

    /// Per-attempt timeout, e.g. "30s"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Advisory hint that this task has no ordering relationship to sibling
    /// ready tasks. The scheduler does not consult it: sequential mode always
    /// dispatches in declaration order and concurrent mode already overlaps
    /// every ready task. Carried for embedders and tooling that introspect
    /// descriptors.
    #[serde(default)]
    pub parallel: bool,

    /// Task made eligible when this one completes (dependency override)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,

    /// Task made eligible when this one fails permanently
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    /// Per-task resolution mode override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionMode>,

    /// Treat Failed dependencies as merely terminal and run anyway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerate_failed_deps: Option<bool>,
}

impl Task {
    /// Get the kind discriminant for this task
    pub fn kind(&self) -> TaskKind {
        match &self.action {
            TaskAction::Llm { .. } => TaskKind::Llm,
            TaskAction::Tool { .. } => TaskKind::Tool,
            TaskAction::Handler { .. } => TaskKind::Handler,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.as_ref().map(|c| c.max_retries).unwrap_or(0)
    }

    pub fn backoff(&self) -> Duration {
        self.config
            .as_ref()
            .and_then(|c| c.backoff.as_deref())
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_RETRY_BACKOFF)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .as_ref()
            .and_then(|c| c.timeout.as_deref())
            .and_then(parse_duration)
    }

    pub fn on_success(&self) -> Option<&str> {
        self.config.as_ref().and_then(|c| c.on_success.as_deref())
    }

    pub fn on_failure(&self) -> Option<&str> {
        self.config.as_ref().and_then(|c| c.on_failure.as_deref())
    }

    /// Resolution mode: task override, then the workflow default
    pub fn resolution_mode(&self, workflow_default: ResolutionMode) -> ResolutionMode {
        self.config
            .as_ref()
            .and_then(|c| c.resolution)
            .unwrap_or(workflow_default)
    }

    pub fn tolerates_failed_deps(&self, workflow_default: bool) -> bool {
        self.config
            .as_ref()
            .and_then(|c| c.tolerate_failed_deps)
            .unwrap_or(workflow_default)
    }
}

// ============================================================================
// CONDITIONS
// ============================================================================

/// Predicate evaluated against the resolution context before a task runs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Condition {
    /// Variable path, e.g. "t1.output_data.result.count"
    pub path: String,

    /// Comparison operator (default: eq)
    #[serde(default)]
    pub op: ConditionOp,

    /// Comparison value (unused for exists)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Exists,
}

impl Condition {
    /// Evaluate against a context snapshot; an unresolvable path is false
    pub fn evaluate(&self, ctx: &ResolutionContext) -> bool {
        let actual = match ctx.lookup(&self.path) {
            Some(value) => value,
            None => return false,
        };

        match self.op {
            ConditionOp::Exists => !actual.is_null(),
            ConditionOp::Eq => self.value.as_ref() == Some(&actual),
            ConditionOp::Ne => self.value.as_ref() != Some(&actual),
            ConditionOp::Gt => compare(&actual, self.value.as_ref(), |o| o.is_gt()),
            ConditionOp::Lt => compare(&actual, self.value.as_ref(), |o| o.is_lt()),
            ConditionOp::Gte => compare(&actual, self.value.as_ref(), |o| o.is_ge()),
            ConditionOp::Lte => compare(&actual, self.value.as_ref(), |o| o.is_le()),
            ConditionOp::Contains => match (&actual, self.value.as_ref()) {
                (Value::String(haystack), Some(Value::String(needle))) => {
                    haystack.contains(needle.as_str())
                }
                (Value::Array(items), Some(needle)) => items.contains(needle),
                _ => false,
            },
        }
    }
}

fn compare(
    actual: &Value,
    expected: Option<&Value>,
    check: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let (Some(a), Some(b)) = (actual.as_f64(), expected.and_then(Value::as_f64)) else {
        return false;
    };
    a.partial_cmp(&b).map(check).unwrap_or(false)
}

// ============================================================================
// DURATION PARSING
// ============================================================================

/// Parse a duration string like "500ms", "30s", "5m", "1h"
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let s = duration_str.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    s.parse::<u64>().ok().map(Duration::from_secs)
}
