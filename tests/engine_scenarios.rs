//! End-to-end scenarios driving the scheduler, context store, and operator
//! actions together against an in-memory backend — the concrete scenarios
//! from the engine's design notes, exercised through the public API a
//! real caller (CLI, reconciler) would use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use workflow_run_engine::context::store::MemBackend;
use workflow_run_engine::context::WorkflowContext;
use workflow_run_engine::model::{
    ExecuteMode, Step, StepInput, StepOutput, StepPhase, StepReason, WorkflowMode, WorkflowRun, WorkflowRunSpec,
    WorkflowRunStatus, WorkflowSpec,
};
use workflow_run_engine::operator;
use workflow_run_engine::provider::{Provider, ProviderOutcome, ProviderRegistry};
use workflow_run_engine::scheduler::{self, SchedulerOptions};

fn leaf(name: &str, step_type: &str) -> Step {
    Step {
        name: name.to_string(),
        step_type: step_type.to_string(),
        if_expr: None,
        timeout: None,
        depends_on: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        properties: json!({}),
        sub_steps: Vec::new(),
        error_retry_times: None,
    }
}

fn run_with(name: &str, steps: Vec<Step>, mode: ExecuteMode) -> WorkflowRun {
    WorkflowRun {
        name: name.to_string(),
        namespace: "default".to_string(),
        owner_references: vec![],
        spec: WorkflowRunSpec {
            workflow_ref: None,
            workflow_spec: Some(WorkflowSpec { steps }),
            mode: WorkflowMode { steps: mode, sub_steps: mode },
            context: Default::default(),
        },
        status: WorkflowRunStatus::default(),
    }
}

/// Drive `tick` until the run finishes or `max_ticks` is exhausted.
async fn drive(run: &mut WorkflowRun, ctx: &mut WorkflowContext, opts: &SchedulerOptions, max_ticks: usize) {
    for _ in 0..max_ticks {
        scheduler::tick(run, ctx, opts).await.unwrap();
        if run.status.finished || run.status.suspend {
            return;
        }
    }
}

fn opts_with_registry(registry: ProviderRegistry) -> SchedulerOptions {
    SchedulerOptions {
        registry: Arc::new(registry),
        ..SchedulerOptions::default()
    }
}

#[tokio::test]
async fn sequential_happy_path_finishes_with_all_steps_succeeded() {
    let steps = vec![
        leaf("A", "notification"),
        leaf("B", "notification"),
        leaf("C", "notification"),
    ];
    let mut run = run_with("seq", steps, ExecuteMode::StepByStep);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
    let opts = SchedulerOptions::default();

    drive(&mut run, &mut ctx, &opts, 10).await;

    assert!(run.status.finished);
    assert!(run.status.end_time.is_some());
    assert_eq!(run.status.steps.len(), 3);
    for status in &run.status.steps {
        assert_eq!(status.phase, StepPhase::Succeeded);
    }
}

#[tokio::test]
async fn dag_with_inputs_propagates_producer_output_to_consumer() {
    let mut a = leaf("A", "apply-component");
    a.properties = json!({"component": "web", "patch": {"replicas": 2}});
    a.outputs.push(StepOutput {
        name: "appliedComponent".to_string(),
        value_from: "appliedComponent".to_string(),
    });

    let mut b = leaf("B", "read-object");
    b.properties = json!({"component": "web"});
    b.inputs.push(StepInput {
        from: "appliedComponent".to_string(),
        parameter_key: "unusedButBound".to_string(),
    });

    let c = leaf("C", "notification");

    let mut run = run_with("dag", vec![a, b, c], ExecuteMode::Dag);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
    let opts = SchedulerOptions::default();

    drive(&mut run, &mut ctx, &opts, 10).await;

    assert!(run.status.finished);
    let by_name: HashMap<_, _> = run.status.steps.iter().map(|s| (s.name.as_str(), s)).collect();
    assert_eq!(by_name["A"].phase, StepPhase::Succeeded);
    assert_eq!(by_name["B"].phase, StepPhase::Succeeded);
    assert_eq!(by_name["C"].phase, StepPhase::Succeeded);
    assert_eq!(
        ctx.get_var("outputs.appliedComponent"),
        Some(&Value::String("web".to_string()))
    );
}

#[tokio::test]
async fn dag_consumer_fails_fast_when_producer_has_no_value_yet() {
    // `B` depends on an output only `A` produces but B is declared with no
    // explicit dependsOn edge derived purely from an input that no step
    // actually outputs — this must fail with InputLookupFailed rather than
    // hang, since nothing will ever populate it.
    let mut b = leaf("B", "notification");
    b.inputs.push(StepInput {
        from: "neverProduced".to_string(),
        parameter_key: "p".to_string(),
    });

    let mut run = run_with("dangling-input", vec![b], ExecuteMode::Dag);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
    let opts = SchedulerOptions::default();

    drive(&mut run, &mut ctx, &opts, 3).await;

    assert_eq!(run.status.steps[0].phase, StepPhase::Failed);
    assert_eq!(run.status.steps[0].reason, Some(StepReason::InputLookupFailed));
}

#[tokio::test]
async fn suspend_step_pauses_run_until_resumed() {
    let steps = vec![leaf("notify", "notification"), leaf("suspend", "suspend"), leaf("apply", "apply-component")];
    let mut run = run_with("susp", steps, ExecuteMode::StepByStep);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
    let opts = SchedulerOptions::default();

    drive(&mut run, &mut ctx, &opts, 5).await;

    assert!(run.status.suspend);
    assert!(!run.status.finished);
    let by_name: HashMap<_, _> = run.status.steps.iter().map(|s| (s.name.as_str(), s)).collect();
    assert_eq!(by_name["notify"].phase, StepPhase::Succeeded);
    assert_eq!(by_name["suspend"].phase, StepPhase::Suspending);
    assert_eq!(by_name["apply"].phase, StepPhase::Pending);

    operator::resume(&mut run).unwrap();
    assert!(!run.status.suspend);

    // apply's properties don't carry a component, so this particular run
    // will now fail fast on validation — check only that the suspend was
    // lifted and the run progressed past the suspend step.
    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    let by_name: HashMap<_, _> = run.status.steps.iter().map(|s| (s.name.as_str(), s)).collect();
    assert_eq!(by_name["suspend"].phase, StepPhase::Succeeded);
}

/// Always fails with a distinguishable message, to drive the retry loop to
/// exhaustion deterministically.
struct AlwaysFailsProvider;

#[async_trait]
impl Provider for AlwaysFailsProvider {
    fn step_type(&self) -> &str {
        "always-fails"
    }

    async fn run(
        &self,
        _ctx: &mut WorkflowContext,
        _properties: &Value,
        _deadline: Duration,
    ) -> anyhow::Result<ProviderOutcome> {
        Ok(ProviderOutcome::Failed("synthetic failure".to_string()))
    }
}

#[tokio::test]
async fn retry_exhaustion_reaches_failed_after_retries_at_the_configured_budget() {
    let mut step = leaf("flaky", "always-fails");
    step.error_retry_times = Some(3);

    let mut run = run_with("retry", vec![step], ExecuteMode::Dag);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();

    let mut registry = ProviderRegistry::with_builtins();
    registry.register(Arc::new(AlwaysFailsProvider));
    let opts = opts_with_registry(registry);

    // 3 attempts exhausts the per-step override regardless of backoff —
    // backoff only affects the suggested requeue delay, not whether the
    // scheduler is willing to dispatch again on the next `tick` call.
    for _ in 0..3 {
        scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    }

    assert!(run.status.finished);
    assert_eq!(run.status.steps[0].phase, StepPhase::Failed);
    assert_eq!(run.status.steps[0].reason, Some(StepReason::FailedAfterRetries));
    assert_eq!(
        ctx.get_value_in_memory(&format!("retries.{}", run.status.steps[0].id))
            .await,
        Some(json!(3))
    );
}

#[tokio::test]
async fn restart_from_failed_step_drops_its_and_downstream_statuses_and_reruns() {
    let mut a = leaf("a", "always-fails");
    a.error_retry_times = Some(1);
    let mut b = leaf("b", "notification");
    b.inputs.push(StepInput {
        from: "x".to_string(),
        parameter_key: "p".to_string(),
    });
    a.outputs.push(StepOutput {
        name: "x".to_string(),
        value_from: "appliedComponent".to_string(),
    });

    let mut run = run_with("restart", vec![a, b], ExecuteMode::Dag);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();

    let mut registry = ProviderRegistry::with_builtins();
    registry.register(Arc::new(AlwaysFailsProvider));
    let opts = opts_with_registry(registry);

    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert!(run.status.finished);
    assert_eq!(run.status.steps[0].phase, StepPhase::Failed);
    assert_eq!(run.status.steps[0].reason, Some(StepReason::FailedAfterRetries));

    operator::restart_partial(&mut run, "a", &mut ctx).await.unwrap();
    ctx.commit().await.unwrap();

    assert!(run.status.steps.is_empty());
    assert!(!run.status.finished);

    // A fresh tick regenerates "a" as a brand-new Pending entry (a new ID
    // is expected — restart forfeits ID stability for the steps it wipes).
    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert_eq!(run.status.steps.len(), 2);
}

#[tokio::test]
async fn user_provided_context_is_seeded_into_vars_once() {
    let mut run = run_with("ctx-seed", vec![leaf("a", "notification")], ExecuteMode::Dag);
    run.spec.context.insert("region".to_string(), json!("us-east-1"));
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
    let opts = SchedulerOptions::default();

    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert_eq!(ctx.get_var("context.region"), Some(&json!("us-east-1")));

    // A later write to the same key must not be clobbered by re-seeding on
    // the next tick.
    ctx.set_var("context.region", json!("eu-west-1")).unwrap();
    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert_eq!(ctx.get_var("context.region"), Some(&json!("eu-west-1")));
}

#[tokio::test]
async fn suspend_on_failure_holds_until_resume_even_once_retry_finishes_dispatching() {
    // A failed step under `EnableSuspendOnFailure` suspends the run. The
    // next tick must not auto-clear that suspend just because the failed
    // step is no longer `Suspending` (it never was) — only an operator
    // Resume may lift it.
    let mut step = leaf("flaky", "always-fails");
    step.error_retry_times = Some(5);
    let mut run = run_with("suspend-on-failure", vec![step], ExecuteMode::Dag);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();

    let mut registry = ProviderRegistry::with_builtins();
    registry.register(Arc::new(AlwaysFailsProvider));
    let opts = SchedulerOptions {
        registry: Arc::new(registry),
        enable_suspend_on_failure: true,
        ..SchedulerOptions::default()
    };

    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert!(run.status.suspend);
    assert_eq!(run.status.steps[0].phase, StepPhase::Failed);

    // A second tick re-enters the "already suspended" branch; the step is
    // still Failed (not Suspending), so naive `any_suspending`-only logic
    // would clear the flag here.
    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert!(run.status.suspend, "failure-induced suspend must hold until an operator Resume");
    assert_eq!(run.status.steps[0].phase, StepPhase::Failed);

    operator::resume(&mut run).unwrap();
    assert!(!run.status.suspend);
}

#[tokio::test]
async fn terminate_fails_running_steps_and_leaves_pending_ones_untouched() {
    let steps = vec![leaf("a", "suspend"), leaf("b", "notification")];
    let mut run = run_with("term", steps, ExecuteMode::StepByStep);
    let backend = Arc::new(MemBackend::new());
    let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
    let opts = SchedulerOptions::default();

    // First tick: "a" (a suspend step) enters Suspending; "b" stays
    // Pending behind it under StepByStep ordering.
    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();
    assert_eq!(run.status.steps[0].phase, StepPhase::Suspending);
    assert_eq!(run.status.steps[1].phase, StepPhase::Pending);

    operator::terminate(&mut run).unwrap();
    scheduler::tick(&mut run, &mut ctx, &opts).await.unwrap();

    assert!(run.status.terminated);
    assert!(!run.status.suspend);
    assert_eq!(run.status.steps[0].phase, StepPhase::Failed);
    assert_eq!(run.status.steps[0].reason, Some(StepReason::Terminate));
    assert_eq!(run.status.steps[1].phase, StepPhase::Pending);
}
