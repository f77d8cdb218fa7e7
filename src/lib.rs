//! Weft - DAG workflow execution engine
//!
//! Workflows are declared in YAML as a set of tasks with explicit
//! dependencies, `${...}` variable references between task outputs, retries,
//! and conditional branching. The runner executes them sequentially or
//! concurrently and normalizes every outcome into a standard result envelope.

pub mod context;
pub mod dep_graph;
pub mod envelope;
pub mod error;
pub mod event_log;
pub mod executor;
pub mod limits;
pub mod path;
pub mod runner;
pub mod status;
pub mod task;
pub mod template;
pub mod workflow;

pub use context::ResolutionContext;
pub use dep_graph::DepGraph;
pub use envelope::{EnvelopeStatus, TaskEnvelope};
pub use error::{FixSuggestion, WeftError};
pub use event_log::{Event, EventKind, EventLog};
pub use executor::{ExecutorSet, HandlerMap, LlmClient, MockLlm, ToolRegistry};
pub use limits::RunLimits;
pub use runner::{RunResult, Runner, TaskFailure};
pub use status::{TaskStatus, WorkflowStatus};
pub use task::{Condition, ConditionOp, Task, TaskAction, TaskConfig, TaskKind};
pub use template::ResolutionMode;
pub use workflow::{DependencyFailurePolicy, SchedulingMode, Workflow, WorkflowSettings};
