//! End-to-end runner tests: scheduling, resolution, retries, branching

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use weft::event_log::EventKind;
use weft::executor::{ExecutorSet, ToolRegistry};
use weft::{RunLimits, Runner, TaskStatus, WeftError, Workflow, WorkflowStatus};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runner_with(tools: ToolRegistry) -> Runner {
    Runner::new(ExecutorSet {
        tools,
        ..Default::default()
    })
    .with_limits(RunLimits::testing())
}

fn echo_tools() -> ToolRegistry {
    ToolRegistry::builder()
        .register("echo", |input: Value| async move { Ok(input) })
        .build()
}

async fn run(yaml: &str, tools: ToolRegistry) -> weft::RunResult {
    let wf = Workflow::from_yaml(yaml).expect("workflow parses");
    runner_with(tools).run(&wf, Map::new()).await.expect("run")
}

// ═══════════════════════════════════════════════════════════════
// Graph validation
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn cycle_is_rejected_before_any_dispatch() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = Arc::clone(&calls);
    let tools = ToolRegistry::builder()
        .register("probe", move |input| {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();

    let wf = Workflow::from_yaml(
        r#"
tasks:
  - id: a
    tool: { name: probe }
    depends_on: [b]
  - id: b
    tool: { name: probe }
    depends_on: [a]
"#,
    )
    .unwrap();

    let err = runner_with(tools).run(&wf, Map::new()).await.unwrap_err();
    assert_eq!(err.code(), "WEFT-013");
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no task may execute");
}

// ═══════════════════════════════════════════════════════════════
// Dependency ordering
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn diamond_runs_in_dependency_order() {
    let result = run(
        r#"
tasks:
  - id: a
    tool: { name: echo }
  - id: b
    tool: { name: echo }
    depends_on: [a]
  - id: c
    tool: { name: echo }
    depends_on: [a]
  - id: d
    tool: { name: echo }
    depends_on: [b, c]
"#,
        echo_tools(),
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Completed);

    let started: Vec<String> = result
        .events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskStarted { task_id, .. } => Some(task_id.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 4);
    assert_eq!(started[0], "a");
    assert_eq!(started[3], "d");
}

// ═══════════════════════════════════════════════════════════════
// Variable resolution
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn single_placeholder_resolves_with_original_type() {
    let seen = Arc::new(Mutex::new(Value::Null));
    let seen_in = Arc::clone(&seen);
    let tools = ToolRegistry::builder()
        .register("emit", |_| async { Ok(json!({"a": {"b": [5, 6]}})) })
        .register("capture", move |input| {
            let seen = Arc::clone(&seen_in);
            async move {
                *seen.lock().unwrap() = input.clone();
                Ok(input)
            }
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: emit }
  - id: t2
    tool: { name: capture }
    depends_on: [t1]
    input:
      v: "${t1.output_data.result.a.b[0]}"
      text: "got ${t1.output_data.result.a.b[1]}"
"#,
        tools,
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    // Single placeholder keeps the number; embedded one stringifies
    assert_eq!(*seen.lock().unwrap(), json!({"v": 5, "text": "got 6"}));
}

#[tokio::test]
async fn default_literal_applies_when_path_misses() {
    let seen = Arc::new(Mutex::new(Value::Null));
    let seen_in = Arc::clone(&seen);
    let tools = ToolRegistry::builder()
        .register("capture", move |input| {
            let seen = Arc::clone(&seen_in);
            async move {
                *seen.lock().unwrap() = input.clone();
                Ok(input)
            }
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: capture }
    input:
      region: "${workflow_input.region | 'us-east-1'}"
      retries: "${workflow_input.retries | 3}"
"#,
        tools,
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(
        *seen.lock().unwrap(),
        json!({"region": "us-east-1", "retries": 3})
    );
}

#[tokio::test]
async fn strict_unresolved_fails_without_executing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = Arc::clone(&calls);
    let tools = ToolRegistry::builder()
        .register("probe", move |input| {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: probe }
    input:
      v: "${ghost.output_data.result}"
"#,
        tools,
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.status_of("t1"), Some(TaskStatus::Failed));
    assert_eq!(
        result.output_of("t1").unwrap().error_code.as_deref(),
        Some("WEFT-021")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lenient_mode_substitutes_diagnostic() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Value::Null));
    let seen_in = Arc::clone(&seen);
    let tools = ToolRegistry::builder()
        .register("capture", move |input| {
            let seen = Arc::clone(&seen_in);
            async move {
                *seen.lock().unwrap() = input.clone();
                Ok(input)
            }
        })
        .build();

    let result = run(
        r#"
settings:
  resolution: lenient
tasks:
  - id: t1
    tool: { name: capture }
    input:
      v: "${ghost.output_data.result}"
"#,
        tools,
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(
        *seen.lock().unwrap(),
        json!({"v": "<unresolved:ghost.output_data.result>"})
    );
}

// ═══════════════════════════════════════════════════════════════
// Retries
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn retries_make_max_retries_plus_one_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = Arc::clone(&calls);
    let tools = ToolRegistry::builder()
        .register("flaky", move |_| {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WeftError::Execution("always down".to_string()))
            }
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: flaky }
    config:
      maxRetries: 2
      backoff: 1ms
"#,
        tools,
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.status, WorkflowStatus::Failed);

    let failure = &result.error_summary[0];
    assert_eq!(failure.task_id, "t1");
    assert_eq!(failure.attempts, 3);

    let details = result
        .output_of("t1")
        .unwrap()
        .error_details
        .clone()
        .unwrap();
    assert_eq!(details["retry_exhausted"], json!(true));
    assert_eq!(details["attempts"], json!(3));

    // Per-attempt trace: two failures with will_retry, one final without
    let retry_flags: Vec<bool> = result
        .events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskFailed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retry_flags, vec![true, true, false]);
}

#[tokio::test]
async fn success_after_retry_completes_task() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = Arc::clone(&calls);
    let tools = ToolRegistry::builder()
        .register("eventually", move |_| {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(WeftError::Execution("warming up".to_string()))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: eventually }
    config:
      maxRetries: 3
      backoff: 1ms
"#,
        tools,
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.error_summary.is_empty());
}

// ═══════════════════════════════════════════════════════════════
// Conditions
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn false_condition_skips_without_executing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = Arc::clone(&calls);
    let tools = ToolRegistry::builder()
        .register("emit", |_| async { Ok(json!({"count": 1})) })
        .register("probe", move |input| {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: emit }
  - id: t2
    tool: { name: probe }
    depends_on: [t1]
    condition:
      path: t1.output_data.result.count
      op: gt
      value: 10
"#,
        tools,
    )
    .await;

    // A condition skip is a normal outcome, not a failure
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.status_of("t2"), Some(TaskStatus::Skipped));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ═══════════════════════════════════════════════════════════════
// Failure propagation and branching
// ═══════════════════════════════════════════════════════════════

fn failing_tools() -> ToolRegistry {
    ToolRegistry::builder()
        .register("echo", |input: Value| async move { Ok(input) })
        .register("broken", |_| async {
            Err(WeftError::Execution("boom".to_string()))
        })
        .build()
}

#[tokio::test]
async fn skip_policy_cascades_to_dependents() {
    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: broken }
  - id: t2
    tool: { name: echo }
    depends_on: [t1]
  - id: t3
    tool: { name: echo }
    depends_on: [t2]
"#,
        failing_tools(),
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.status_of("t1"), Some(TaskStatus::Failed));
    assert_eq!(result.status_of("t2"), Some(TaskStatus::Skipped));
    assert_eq!(result.status_of("t3"), Some(TaskStatus::Skipped));

    // Skip reason names the failed dependency
    let t2 = result.output_of("t2").unwrap();
    let reason = t2.error_details.as_ref().unwrap()["reason"]
        .as_str()
        .unwrap();
    assert!(reason.contains("t1"), "reason was: {reason}");
}

#[tokio::test]
async fn fail_policy_marks_dependents_failed() {
    let result = run(
        r#"
settings:
  onDependencyFailure: fail
tasks:
  - id: t1
    tool: { name: broken }
  - id: t2
    tool: { name: echo }
    depends_on: [t1]
  - id: t3
    tool: { name: echo }
    depends_on: [t2]
"#,
        failing_tools(),
    )
    .await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.status_of("t2"), Some(TaskStatus::Failed));
    assert_eq!(result.status_of("t3"), Some(TaskStatus::Failed));
    assert_eq!(
        result.output_of("t2").unwrap().error_code.as_deref(),
        Some("WEFT-041")
    );
    // t1 plus both cascading dependency failures
    assert_eq!(result.error_summary.len(), 3);
}

#[tokio::test]
async fn failure_branch_recovers_the_workflow() {
    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: broken }
    config:
      onFailure: cleanup
  - id: t2
    tool: { name: echo }
    depends_on: [t1]
  - id: cleanup
    tool: { name: echo }
    depends_on: [t1]
    input:
      failed: "${error.t1.message}"
"#,
        failing_tools(),
    )
    .await;

    // The branch target ran and completed, so the failure is recovered
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.status_of("t1"), Some(TaskStatus::Failed));
    assert_eq!(result.status_of("cleanup"), Some(TaskStatus::Completed));
    // The plain graph dependent still skips
    assert_eq!(result.status_of("t2"), Some(TaskStatus::Skipped));

    // The failure stays visible in the summary even though recovered
    assert_eq!(result.error_summary.len(), 1);
    assert_eq!(result.error_summary[0].task_id, "t1");

    // The cleanup task saw the error registry
    let cleanup_out = result.output_of("cleanup").unwrap().result.clone().unwrap();
    assert!(cleanup_out["failed"].as_str().unwrap().contains("boom"));

    let branch_taken = result.events.iter().any(|e| {
        matches!(
            &e.kind,
            EventKind::BranchTaken { target, on_failure: true, .. } if target.as_ref() == "cleanup"
        )
    });
    assert!(branch_taken);
}

#[tokio::test]
async fn success_branch_runs_the_named_task() {
    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: echo }
    input:
      v: 1
    config:
      onSuccess: t2
  - id: t2
    tool: { name: echo }
    depends_on: [t1]
    input:
      v: "${t1.output_data.result.v}"
"#,
        failing_tools(),
    )
    .await;

    result.ensure_completed().unwrap();
    assert_eq!(result.status_of("t2"), Some(TaskStatus::Completed));
    assert_eq!(result.output_of("t2").unwrap().result, Some(json!({"v": 1})));

    let branch_taken = result.events.iter().any(|e| {
        matches!(
            &e.kind,
            EventKind::BranchTaken { target, on_failure: false, .. } if target.as_ref() == "t2"
        )
    });
    assert!(branch_taken);
}

#[tokio::test]
async fn success_branch_bypasses_declared_dependencies() {
    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: echo }
    config:
      onSuccess: finish
  - id: blocker
    tool: { name: broken }
  - id: finish
    tool: { name: echo }
    depends_on: [blocker]
    input:
      from: "${t1.output_data.status}"
"#,
        failing_tools(),
    )
    .await;

    // The branch target runs even though its declared dependency failed
    assert_eq!(result.status_of("finish"), Some(TaskStatus::Completed));
    assert_eq!(
        result.output_of("finish").unwrap().result,
        Some(json!({"from": "completed"}))
    );
    // The unhandled blocker failure still fails the run
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error_summary.len(), 1);
    assert_eq!(result.error_summary[0].task_id, "blocker");
}

#[tokio::test]
async fn tolerate_failed_deps_runs_with_error_registry() {
    let result = run(
        r#"
tasks:
  - id: t1
    tool: { name: broken }
  - id: t2
    tool: { name: echo }
    depends_on: [t1]
    config:
      tolerateFailedDeps: true
    input:
      upstream_error: "${error.t1.message}"
      upstream_code: "${error.t1.code}"
"#,
        failing_tools(),
    )
    .await;

    assert_eq!(result.status_of("t2"), Some(TaskStatus::Completed));
    let out = result.output_of("t2").unwrap().result.clone().unwrap();
    assert!(out["upstream_error"].as_str().unwrap().contains("boom"));
    assert_eq!(out["upstream_code"], json!("WEFT-032"));
}

// ═══════════════════════════════════════════════════════════════
// Workflow inputs
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn run_inputs_override_declared_defaults() {
    let wf = Workflow::from_yaml(
        r#"
inputs:
  region: us-east-1
  bucket: default-bucket
tasks:
  - id: t1
    tool: { name: echo }
    input:
      region: "${workflow_input.region}"
      bucket: "${workflow_input.bucket}"
"#,
    )
    .unwrap();

    let mut inputs = Map::new();
    inputs.insert("region".to_string(), json!("eu-west-1"));

    let result = runner_with(echo_tools()).run(&wf, inputs).await.unwrap();
    assert_eq!(
        result.output_of("t1").unwrap().result,
        Some(json!({"region": "eu-west-1", "bucket": "default-bucket"}))
    );
}

// ═══════════════════════════════════════════════════════════════
// Concurrent mode
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_mode_overlaps_independent_tasks() {
    init_tracing();
    let tools = ToolRegistry::builder()
        .register("sleepy", |input: Value| async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(input)
        })
        .build();

    let wf = Workflow::from_yaml(
        r#"
settings:
  mode: concurrent
  maxInFlight: 4
tasks:
  - id: a
    tool: { name: sleepy }
  - id: b
    tool: { name: sleepy }
  - id: c
    tool: { name: sleepy }
  - id: join
    tool: { name: sleepy }
    depends_on: [a, b, c]
"#,
    )
    .unwrap();

    let started = Instant::now();
    let result = runner_with(tools).run(&wf, Map::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, WorkflowStatus::Completed);
    // a, b, c overlap; join runs after: well under 4 sequential sleeps
    assert!(
        elapsed < Duration::from_millis(300),
        "took {elapsed:?}, tasks did not overlap"
    );

    // join must not start before its dependencies complete
    let join_start = result
        .events
        .iter()
        .find(|e| {
            matches!(&e.kind, EventKind::TaskStarted { task_id, .. } if task_id.as_ref() == "join")
        })
        .map(|e| e.id)
        .unwrap();
    for dep in ["a", "b", "c"] {
        let dep_done = result
            .events
            .iter()
            .find(|e| {
                matches!(&e.kind, EventKind::TaskCompleted { task_id, .. } if task_id.as_ref() == dep)
            })
            .map(|e| e.id)
            .unwrap();
        assert!(dep_done < join_start);
    }
}

#[tokio::test]
async fn concurrent_mode_respects_max_in_flight() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let running_in = Arc::clone(&running);
    let peak_in = Arc::clone(&peak);

    let tools = ToolRegistry::builder()
        .register("tracked", move |input| {
            let running = Arc::clone(&running_in);
            let peak = Arc::clone(&peak_in);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();

    let wf = Workflow::from_yaml(
        r#"
settings:
  mode: concurrent
  maxInFlight: 2
tasks:
  - id: a
    tool: { name: tracked }
  - id: b
    tool: { name: tracked }
  - id: c
    tool: { name: tracked }
  - id: d
    tool: { name: tracked }
"#,
    )
    .unwrap();

    let result = runner_with(tools).run(&wf, Map::new()).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "peak was {}",
        peak.load(Ordering::SeqCst)
    );
}

// ═══════════════════════════════════════════════════════════════
// End-to-end chaining
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn task_output_feeds_the_next_task() {
    let tools = ToolRegistry::builder()
        .register("produce", |_| async { Ok(json!({"v": 1})) })
        .register("consume", |input: Value| async move {
            let v = input["v"].as_i64().unwrap_or(0);
            Ok(json!({"doubled": v * 2}))
        })
        .build();

    let result = run(
        r#"
tasks:
  - id: task_1
    tool: { name: produce }
  - id: task_2
    tool: { name: consume }
    depends_on: [task_1]
    input:
      v: "${task_1.output_data.result.v}"
"#,
        tools,
    )
    .await;

    result.ensure_completed().unwrap();
    assert_eq!(
        result.output_of("task_2").unwrap().result,
        Some(json!({"doubled": 2}))
    );

    let finished = result.events.iter().any(|e| {
        matches!(&e.kind, EventKind::WorkflowFinished { status, .. } if status == "completed")
    });
    assert!(finished);
}
