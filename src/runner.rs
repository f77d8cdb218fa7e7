//! Workflow runner: state machine, dispatch loop, retries, branching
//!
//! The runner walks the dependency graph, resolving each task's input against
//! a context snapshot at dispatch time, executing it through the executor set,
//! and publishing its envelope for downstream tasks. Two dispatch modes share
//! the same per-task pipeline: sequential (one task at a time, declaration
//! order) and concurrent (JoinSet bounded by a semaphore).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::context::{ResolutionContext, ERROR_ROOT, WORKFLOW_INPUT_ROOT};
use crate::dep_graph::DepGraph;
use crate::envelope::TaskEnvelope;
use crate::error::WeftError;
use crate::event_log::{EventKind, EventLog};
use crate::executor::{ExecutorSet, ResolvedInput};
use crate::limits::RunLimits;
use crate::status::{TaskStatus, WorkflowStatus};
use crate::task::{Task, TaskAction};
use crate::template;
use crate::workflow::{DependencyFailurePolicy, SchedulingMode, Workflow};

/// One permanently failed task in the run summary
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: String,
    pub error: String,
    pub error_code: Option<String>,
    pub attempts: u32,
}

/// Outcome of a full run
#[derive(Debug)]
pub struct RunResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub task_statuses: HashMap<String, TaskStatus>,
    /// Terminal envelope of every task that reached one
    pub outputs: HashMap<String, TaskEnvelope>,
    /// Permanently failed tasks, recovered or not
    pub error_summary: Vec<TaskFailure>,
    /// Set when the run stopped dispatching before the graph was exhausted
    pub abort_reason: Option<String>,
    pub events: Vec<crate::event_log::Event>,
}

impl RunResult {
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_statuses.get(task_id).copied()
    }

    pub fn output_of(&self, task_id: &str) -> Option<&TaskEnvelope> {
        self.outputs.get(task_id)
    }

    /// Err when the run did not finish Completed
    pub fn ensure_completed(&self) -> Result<(), WeftError> {
        if self.status == WorkflowStatus::Completed {
            return Ok(());
        }
        Err(WeftError::WorkflowFailed {
            failed: self.error_summary.len(),
        })
    }
}

/// Workflow runner, reusable across runs
pub struct Runner {
    executors: ExecutorSet,
    limits: RunLimits,
}

impl Runner {
    pub fn new(executors: ExecutorSet) -> Self {
        Self {
            executors,
            limits: RunLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run a workflow to completion
    ///
    /// Graph validation errors are returned as `Err`; task failures are
    /// reported through the `RunResult`.
    #[instrument(skip(self, workflow, inputs), fields(workflow_id = %workflow.id))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
    ) -> Result<RunResult, WeftError> {
        let graph = DepGraph::build(workflow)?;
        graph.validate(workflow)?;

        let log = EventLog::new();
        let start = Instant::now();
        log.emit(EventKind::WorkflowStarted {
            task_count: workflow.tasks.len(),
        });
        info!(tasks = workflow.tasks.len(), "workflow started");

        let mut st = RunState::new(workflow, inputs);

        match workflow.settings.mode {
            SchedulingMode::Sequential => {
                self.run_sequential(workflow, &graph, &log, start, &mut st)
                    .await
            }
            SchedulingMode::Concurrent => {
                self.run_concurrent(workflow, &graph, &log, start, &mut st)
                    .await
            }
        }

        // Anything still pending was cut off by an abort (or unreachable)
        let leftover_reason = st
            .aborted
            .clone()
            .unwrap_or_else(|| "unreachable".to_string());
        for idx in 0..workflow.tasks.len() {
            if !st.statuses[idx].is_terminal() {
                st.skip(idx, &leftover_reason, &log, workflow);
            }
        }

        let status = st.workflow_status();
        log.emit(EventKind::WorkflowFinished {
            status: status.to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        });
        info!(%status, "workflow finished");

        Ok(st.into_result(workflow, status, &log))
    }

    async fn run_sequential(
        &self,
        workflow: &Workflow,
        graph: &DepGraph,
        log: &EventLog,
        start: Instant,
        st: &mut RunState,
    ) {
        loop {
            if self.check_duration(start, st) {
                break;
            }

            let mut progressed = false;
            for idx in st.eligible(graph) {
                match st.prepare(idx, workflow, graph, log) {
                    Dispatch::Settled => {
                        progressed = true;
                        break;
                    }
                    Dispatch::Run(resolved) => {
                        st.statuses[idx] = TaskStatus::Running;
                        let (envelope, attempts) = execute_with_retry(
                            Arc::clone(&workflow.tasks[idx]),
                            resolved,
                            self.executors.clone(),
                            log.clone(),
                            self.limits.max_output_bytes,
                        )
                        .await;
                        st.finalize(idx, envelope, attempts, workflow, log);
                        progressed = true;
                        break;
                    }
                }
            }

            if !progressed || st.aborted.is_some() {
                break;
            }
        }
    }

    async fn run_concurrent(
        &self,
        workflow: &Workflow,
        graph: &DepGraph,
        log: &EventLog,
        start: Instant,
        st: &mut RunState,
    ) {
        let semaphore = Arc::new(Semaphore::new(workflow.settings.max_in_flight.max(1)));
        let mut join_set: JoinSet<(TaskEnvelope, u32)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            if st.aborted.is_none() {
                self.check_duration(start, st);
            }

            if st.aborted.is_none() {
                // Dispatch to fixpoint: settling one task can unlock others
                loop {
                    let mut acted = false;
                    for idx in st.eligible(graph) {
                        match st.prepare(idx, workflow, graph, log) {
                            Dispatch::Settled => acted = true,
                            Dispatch::Run(resolved) => {
                                st.statuses[idx] = TaskStatus::Running;
                                let task = Arc::clone(&workflow.tasks[idx]);
                                let executors = self.executors.clone();
                                let task_log = log.clone();
                                let max_bytes = self.limits.max_output_bytes;
                                let permit_source = Arc::clone(&semaphore);
                                let handle = join_set.spawn(async move {
                                    // Semaphore is never closed for the lifetime of the run
                                    let _permit = permit_source
                                        .acquire_owned()
                                        .await
                                        .expect("run semaphore closed");
                                    execute_with_retry(task, resolved, executors, task_log, max_bytes)
                                        .await
                                });
                                in_flight.insert(handle.id(), idx);
                                acted = true;
                            }
                        }
                    }
                    if !acted || st.aborted.is_some() {
                        break;
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            match join_set.join_next_with_id().await {
                Some(Ok((id, (envelope, attempts)))) => {
                    if let Some(idx) = in_flight.remove(&id) {
                        st.finalize(idx, envelope, attempts, workflow, log);
                    }
                }
                Some(Err(join_err)) => {
                    // A panicking executor fails its task, not the run
                    if let Some(idx) = in_flight.remove(&join_err.id()) {
                        warn!(task = %workflow.tasks[idx].id, "task panicked");
                        let envelope = TaskEnvelope::failed(&WeftError::Execution(
                            "task panicked".to_string(),
                        ));
                        st.finalize(idx, envelope, 1, workflow, log);
                    }
                }
                None => break,
            }
        }

        // Drain anything still running after an abort
        while let Some(joined) = join_set.join_next_with_id().await {
            if let Ok((id, (envelope, attempts))) = joined {
                if let Some(idx) = in_flight.remove(&id) {
                    st.finalize(idx, envelope, attempts, workflow, log);
                }
            }
        }
    }

    /// True when the duration limit tripped (sets the abort reason once)
    fn check_duration(&self, start: Instant, st: &mut RunState) -> bool {
        if st.aborted.is_some() {
            return true;
        }
        if start.elapsed() > self.limits.max_workflow_duration {
            let err = WeftError::DurationLimit {
                seconds: self.limits.max_workflow_duration.as_secs(),
            };
            warn!("{err}");
            st.aborted = Some(err.to_string());
            return true;
        }
        false
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(ExecutorSet::default())
    }
}

// ============================================================================
// PER-RUN STATE
// ============================================================================

enum Dispatch {
    /// Task reached a terminal state without executing (skip or resolution
    /// failure)
    Settled,
    /// Task is ready to execute with this resolved input
    Run(ResolvedInput),
}

struct RunState {
    statuses: Vec<TaskStatus>,
    envelopes: Vec<Option<TaskEnvelope>>,
    attempts: Vec<u32>,
    /// Failed, or skipped because a dependency failed; cascades to dependents
    poisoned: Vec<bool>,
    /// Branch targets made eligible regardless of their graph dependencies
    forced: HashSet<usize>,
    /// target index -> failed tasks whose failure the target's completion recovers
    recovery: HashMap<usize, Vec<usize>>,
    recovered: HashSet<usize>,
    failed: Vec<usize>,
    errors: Map<String, Value>,
    ctx: ResolutionContext,
    aborted: Option<String>,
}

impl RunState {
    fn new(workflow: &Workflow, run_inputs: Map<String, Value>) -> Self {
        let count = workflow.tasks.len();

        // Declared inputs are defaults; run-supplied values win
        let mut merged = workflow.inputs.clone();
        merged.extend(run_inputs);

        let mut ctx = ResolutionContext::new();
        ctx.set_root(WORKFLOW_INPUT_ROOT, Value::Object(merged));
        ctx.set_root(ERROR_ROOT, Value::Object(Map::new()));

        Self {
            statuses: vec![TaskStatus::Pending; count],
            envelopes: vec![None; count],
            attempts: vec![0; count],
            poisoned: vec![false; count],
            forced: HashSet::new(),
            recovery: HashMap::new(),
            recovered: HashSet::new(),
            failed: Vec::new(),
            errors: Map::new(),
            ctx,
            aborted: None,
        }
    }

    /// Pending tasks whose dependencies are all terminal, plus forced branch
    /// targets, in declaration order
    fn eligible(&self, graph: &DepGraph) -> Vec<usize> {
        let mut ready = graph.ready_set(&self.statuses);
        for &idx in &self.forced {
            if self.statuses[idx] == TaskStatus::Pending && !ready.contains(&idx) {
                ready.push(idx);
            }
        }
        ready.sort_unstable();
        ready
    }

    /// Decide what happens to an eligible task: skip, fail at resolution, or
    /// hand back a resolved input to execute
    fn prepare(
        &mut self,
        idx: usize,
        workflow: &Workflow,
        graph: &DepGraph,
        log: &EventLog,
    ) -> Dispatch {
        let task = &workflow.tasks[idx];

        log.emit(EventKind::TaskScheduled {
            task_id: Arc::from(task.id.as_str()),
            dependencies: task
                .depends_on
                .iter()
                .map(|d| Arc::from(d.as_str()))
                .collect(),
        });

        // Failed-dependency propagation; branch targets and tolerant tasks
        // run anyway
        if !self.forced.contains(&idx) && !task.tolerates_failed_deps(false) {
            if let Some(&bad) = graph
                .dependencies(idx)
                .iter()
                .find(|&&dep| self.poisoned[dep])
            {
                let err = WeftError::DependencyFailed {
                    task_id: task.id.clone(),
                    dependency: workflow.tasks[bad].id.clone(),
                };
                match workflow.settings.on_dependency_failure {
                    DependencyFailurePolicy::Skip => {
                        self.poisoned[idx] = true;
                        self.skip(idx, &err.to_string(), log, workflow);
                    }
                    DependencyFailurePolicy::Fail => {
                        log.emit(EventKind::TaskFailed {
                            task_id: Arc::from(task.id.as_str()),
                            error: err.to_string(),
                            attempt: 0,
                            will_retry: false,
                        });
                        self.finalize(idx, TaskEnvelope::failed(&err), 0, workflow, log);
                    }
                }
                return Dispatch::Settled;
            }
        }

        if let Some(condition) = &task.condition {
            if !condition.evaluate(&self.ctx) {
                self.skip(idx, "condition evaluated to false", log, workflow);
                return Dispatch::Settled;
            }
        }

        let mode = task.resolution_mode(workflow.settings.resolution);
        match resolve_task_input(task, &self.ctx, mode) {
            Ok(resolved) => {
                log.emit(EventKind::InputResolved {
                    task_id: Arc::from(task.id.as_str()),
                    input: resolved.input.clone(),
                });
                Dispatch::Run(resolved)
            }
            Err(err) => {
                // Resolution failures are final: retrying cannot make a
                // missing variable appear
                debug!(task = %task.id, "input resolution failed: {err}");
                log.emit(EventKind::TaskFailed {
                    task_id: Arc::from(task.id.as_str()),
                    error: err.to_string(),
                    attempt: 0,
                    will_retry: false,
                });
                self.finalize(idx, TaskEnvelope::failed(&err), 0, workflow, log);
                Dispatch::Settled
            }
        }
    }

    fn skip(&mut self, idx: usize, reason: &str, log: &EventLog, workflow: &Workflow) {
        let task_id = workflow.tasks[idx].id.as_str();
        debug!(task = task_id, reason, "task skipped");
        log.emit(EventKind::TaskSkipped {
            task_id: Arc::from(task_id),
            reason: reason.to_string(),
        });
        let envelope = TaskEnvelope::skipped(reason);
        self.statuses[idx] = TaskStatus::Skipped;
        self.ctx.insert_task(task_id, &envelope);
        self.envelopes[idx] = Some(envelope);
    }

    /// Record a terminal executed outcome and apply branching and policy
    fn finalize(
        &mut self,
        idx: usize,
        envelope: TaskEnvelope,
        attempts: u32,
        workflow: &Workflow,
        log: &EventLog,
    ) {
        let task = &workflow.tasks[idx];
        self.attempts[idx] = attempts;
        self.ctx.insert_task(&task.id, &envelope);

        if envelope.success {
            self.statuses[idx] = TaskStatus::Completed;
            if let Some(waiting) = self.recovery.remove(&idx) {
                self.recovered.extend(waiting);
            }
            if let Some(target) = task.on_success() {
                self.force_branch(idx, target, false, workflow, log);
            }
        } else {
            self.statuses[idx] = TaskStatus::Failed;
            self.poisoned[idx] = true;
            self.failed.push(idx);
            self.errors
                .insert(task.id.clone(), envelope.error_entry());
            self.ctx
                .set_root(ERROR_ROOT, Value::Object(self.errors.clone()));

            if let Some(target) = task.on_failure() {
                self.force_branch(idx, target, true, workflow, log);
            }
        }

        self.envelopes[idx] = Some(envelope);
    }

    fn force_branch(
        &mut self,
        from: usize,
        target: &str,
        on_failure: bool,
        workflow: &Workflow,
        log: &EventLog,
    ) {
        // Target existence was validated at graph build time
        let Some(target_idx) = workflow.tasks.iter().position(|t| t.id == target) else {
            return;
        };
        log.emit(EventKind::BranchTaken {
            task_id: Arc::from(workflow.tasks[from].id.as_str()),
            target: Arc::from(target),
            on_failure,
        });

        if on_failure {
            // The failure counts as recovered once the target completes
            if self.statuses[target_idx] == TaskStatus::Completed {
                self.recovered.insert(from);
            } else {
                self.recovery.entry(target_idx).or_default().push(from);
            }
        }
        self.forced.insert(target_idx);
    }

    /// Failed with at least one unrecovered failure, or aborted; else Completed
    fn workflow_status(&self) -> WorkflowStatus {
        if self.aborted.is_some() {
            return WorkflowStatus::Failed;
        }
        let unrecovered = self
            .failed
            .iter()
            .any(|idx| !self.recovered.contains(idx));
        if unrecovered {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        }
    }

    fn into_result(
        self,
        workflow: &Workflow,
        status: WorkflowStatus,
        log: &EventLog,
    ) -> RunResult {
        let mut task_statuses = HashMap::with_capacity(workflow.tasks.len());
        let mut outputs = HashMap::new();
        let mut error_summary = Vec::new();

        for (idx, task) in workflow.tasks.iter().enumerate() {
            task_statuses.insert(task.id.clone(), self.statuses[idx]);
            if let Some(envelope) = &self.envelopes[idx] {
                if self.statuses[idx] == TaskStatus::Failed {
                    error_summary.push(TaskFailure {
                        task_id: task.id.clone(),
                        error: envelope.error.clone().unwrap_or_default(),
                        error_code: envelope.error_code.clone(),
                        attempts: self.attempts[idx],
                    });
                }
                outputs.insert(task.id.clone(), envelope.clone());
            }
        }

        RunResult {
            workflow_id: workflow.id.clone(),
            status,
            task_statuses,
            outputs,
            error_summary,
            abort_reason: self.aborted,
            events: log.events(),
        }
    }
}

// ============================================================================
// TASK EXECUTION
// ============================================================================

fn resolve_task_input(
    task: &Task,
    ctx: &ResolutionContext,
    mode: crate::template::ResolutionMode,
) -> Result<ResolvedInput, WeftError> {
    let input = template::resolve_input(&task.input, ctx, mode, &task.id)?;
    let prompt = match &task.action {
        TaskAction::Llm { llm } => Some(template::resolve_text(&llm.prompt, ctx, mode, &task.id)?),
        _ => None,
    };
    Ok(ResolvedInput { input, prompt })
}

/// Run a task through its retry budget; returns the final envelope and the
/// number of attempts made
async fn execute_with_retry(
    task: Arc<Task>,
    resolved: ResolvedInput,
    executors: ExecutorSet,
    log: EventLog,
    max_output_bytes: usize,
) -> (TaskEnvelope, u32) {
    let total_attempts = task.max_retries() + 1;
    let task_id: Arc<str> = Arc::from(task.id.as_str());
    let mut last = TaskEnvelope::failed(&WeftError::Execution("no attempt made".to_string()));

    for attempt in 1..=total_attempts {
        log.emit(EventKind::TaskStarted {
            task_id: Arc::clone(&task_id),
            attempt,
        });
        let attempt_start = Instant::now();

        let envelope = run_attempt(&task, resolved.clone(), &executors, max_output_bytes).await;

        if envelope.success {
            log.emit(EventKind::TaskCompleted {
                task_id: Arc::clone(&task_id),
                duration_ms: attempt_start.elapsed().as_millis() as u64,
                attempt,
            });
            return (envelope, attempt);
        }

        let will_retry = attempt < total_attempts;
        log.emit(EventKind::TaskFailed {
            task_id: Arc::clone(&task_id),
            error: envelope.error.clone().unwrap_or_default(),
            attempt,
            will_retry,
        });
        last = envelope;

        if will_retry {
            tokio::time::sleep(task.backoff()).await;
        }
    }

    if task.max_retries() > 0 {
        let exhausted = WeftError::RetryExhausted {
            task_id: task.id.clone(),
            attempts: total_attempts,
        };
        warn!("{exhausted}");
        last = last.with_details(serde_json::json!({
            "retry_exhausted": true,
            "attempts": total_attempts,
        }));
    }

    (last, total_attempts)
}

/// One attempt: executor invocation under the per-task timeout, then the
/// output size guard
async fn run_attempt(
    task: &Task,
    resolved: ResolvedInput,
    executors: &ExecutorSet,
    max_output_bytes: usize,
) -> TaskEnvelope {
    let envelope = match task.timeout() {
        Some(limit) => match tokio::time::timeout(limit, executors.invoke(task, resolved)).await {
            Ok(envelope) => envelope,
            Err(_) => TaskEnvelope::failed(&WeftError::Timeout {
                seconds: limit.as_secs(),
            }),
        },
        None => executors.invoke(task, resolved).await,
    };

    if envelope.success {
        if let Some(result) = &envelope.result {
            let size = serde_json::to_vec(result).map(|b| b.len()).unwrap_or(0);
            if size > max_output_bytes {
                return TaskEnvelope::failed(&WeftError::OutputTooLarge {
                    size,
                    limit: max_output_bytes,
                });
            }
        }
    }

    envelope
}
