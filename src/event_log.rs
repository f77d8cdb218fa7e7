//! Append-only event log for workflow execution
//!
//! Every scheduling decision and attempt leaves a trace here, so a run can be
//! audited (or asserted on in tests) after the fact.
//! - Event: envelope with id + timestamp + kind
//! - EventKind: workflow-level and task-level variants
//! - EventLog: thread-safe, append-only log

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the workflow execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since run start (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All event types
///
/// Uses Arc<str> for task_id fields to enable zero-cost cloning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // WORKFLOW LEVEL
    // ═══════════════════════════════════════════
    WorkflowStarted {
        task_count: usize,
    },
    WorkflowFinished {
        status: String,
        duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskScheduled {
        task_id: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    /// One attempt begins (attempt is 1-based)
    TaskStarted {
        task_id: Arc<str>,
        attempt: u32,
    },
    TaskCompleted {
        task_id: Arc<str>,
        duration_ms: u64,
        attempt: u32,
    },
    TaskFailed {
        task_id: Arc<str>,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    TaskSkipped {
        task_id: Arc<str>,
        reason: String,
    },
    /// Input template fully resolved against the context snapshot
    InputResolved {
        task_id: Arc<str>,
        input: Value,
    },
    /// An onSuccess/onFailure override forced a target eligible
    BranchTaken {
        task_id: Arc<str>,
        target: Arc<str>,
        on_failure: bool,
    },
}

impl EventKind {
    /// Extract task_id if event is task-related
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskSkipped { task_id, .. }
            | Self::InputResolved { task_id, .. }
            | Self::BranchTaken { task_id, .. } => Some(task_id),
            Self::WorkflowStarted { .. } | Self::WorkflowFinished { .. } => None,
        }
    }

    /// Check if this is a workflow-level event
    pub fn is_workflow_event(&self) -> bool {
        matches!(
            self,
            Self::WorkflowStarted { .. } | Self::WorkflowFinished { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at run start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Filter events by task ID
    pub fn filter_task(&self, task_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.task_id() == Some(task_id))
            .collect()
    }

    /// Filter workflow-level events only
    pub fn workflow_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_workflow_event())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}
