//! Resolution context - the variable namespace a task's template resolves against
//!
//! Built fresh from the output store before each scheduling decision, never
//! mutated in place while a task resolves against it.

use serde_json::{json, Map, Value};

use crate::envelope::TaskEnvelope;
use crate::path::{self, Segment};

/// Reserved root for workflow-level session inputs
pub const WORKFLOW_INPUT_ROOT: &str = "workflow_input";

/// Reserved root for per-task failure details (`error.<task_id>.message`)
pub const ERROR_ROOT: &str = "error";

/// Snapshot of everything a `${...}` path can reach: published task envelopes
/// under their task ids, session inputs, and the error registry.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    roots: Map<String, Value>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a root value (reserved roots or raw namespaces)
    pub fn set_root(&mut self, key: impl Into<String>, value: Value) {
        self.roots.insert(key.into(), value);
    }

    /// Publish a task's envelope under `<task_id>.output_data`
    pub fn insert_task(&mut self, task_id: &str, envelope: &TaskEnvelope) {
        self.roots.insert(
            task_id.to_string(),
            json!({ "output_data": envelope.to_value() }),
        );
    }

    /// Resolve a dot path against the snapshot
    ///
    /// The first segment selects a root (a task id or a reserved namespace);
    /// the rest traverse into it. Returns None for unknown roots, missing
    /// keys, out-of-range indices, and syntactically invalid paths - the
    /// caller decides whether that is an error (strict) or a substitution
    /// point (default value, lenient mode).
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let segments = path::parse(path).ok()?;
        let root_key = match segments.first()? {
            Segment::Field(name) => name,
            Segment::Index(_) => return None,
        };
        let root = self.roots.get(root_key)?;
        path::apply(root, &segments[1..])
    }

    /// True when the path resolves to a non-null value
    pub fn contains(&self, path: &str) -> bool {
        matches!(self.lookup(path), Some(v) if !v.is_null())
    }
}
