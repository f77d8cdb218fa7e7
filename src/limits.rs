//! Resource limits and safety controls for workflow execution

use std::time::Duration;

/// Run-wide resource limits
///
/// Per-task timeouts live in task config; these are the guardrails the caller
/// sets once for the whole run.
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Maximum wall-clock time for the entire run; when exceeded, no new
    /// tasks are dispatched and in-flight tasks are drained
    pub max_workflow_duration: Duration,

    /// Maximum serialized size for a single task result (in bytes)
    pub max_output_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_workflow_duration: Duration::from_secs(3600), // 1 hour
            max_output_bytes: 10 * 1024 * 1024,               // 10 MB
        }
    }
}

impl RunLimits {
    /// Restrictive limits for tests
    pub fn testing() -> Self {
        Self {
            max_workflow_duration: Duration::from_secs(60),
            max_output_bytes: 1024 * 1024, // 1 MB
        }
    }

    pub fn with_max_workflow_duration(mut self, duration: Duration) -> Self {
        self.max_workflow_duration = duration;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}
