//! Drives one reconcile tick over a [`WorkflowRun`]: computes which steps
//! are eligible under `StepByStep`/`DAG` ordering, dispatches each eligible
//! leaf step to its bound provider, folds the outcome back into
//! [`StepStatus`], and reports how soon the caller should reconcile again.
//!
//! Grounded on the reference engine's `engine/executor.rs` — topological
//! phase computation, a per-step retry/backoff loop, and timeout-bound
//! dispatch — reshaped around an explicit tick instead of one long-lived
//! task per run: nothing here blocks on `tokio::time::sleep`, since no
//! controller loop is owned by this crate. The caller (CLI driver, or a
//! real reconciler in production) decides when to call [`tick`] again,
//! using the returned `requeue_after` as a hint.

pub mod dependency;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::generator::{generate, StepGeneratorOptions, TaskRunner};
use crate::model::{ExecuteMode, Step, StepPhase, StepReason, StepStatus, WorkflowRun};
use crate::provider::{ProviderOutcome, ProviderRegistry};

#[derive(Clone)]
pub struct SchedulerOptions {
    pub registry: Arc<ProviderRegistry>,
    pub enable_suspend_on_failure: bool,
    pub default_step_timeout: Duration,
    pub default_error_retry_times: u32,
    pub wait_state_backoff_cap: Duration,
    pub failed_state_backoff_cap: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            registry: Arc::new(ProviderRegistry::with_builtins()),
            enable_suspend_on_failure: false,
            default_step_timeout: Duration::from_secs(300),
            default_error_retry_times: 10,
            wait_state_backoff_cap: Duration::from_secs(60),
            failed_state_backoff_cap: Duration::from_secs(300),
        }
    }
}

pub struct TickOutcome {
    pub requeue_after: Option<Duration>,
}

/// A step counts toward dependency-unblocking and run completion once it
/// can no longer change phase on its own: `Succeeded`/`Skipped` always
/// qualify, `Failed` only once its retry budget is spent. A `Failed` step
/// that still has attempts left is deliberately excluded, so DAG siblings
/// that depend on it wait for the retry loop to resolve one way or the
/// other rather than racing ahead of a step that might still recover.
fn is_effectively_terminal(status: &StepStatus) -> bool {
    match status.phase {
        StepPhase::Succeeded | StepPhase::Skipped => true,
        StepPhase::Failed => !is_retryable(status),
        StepPhase::Running | StepPhase::Pending | StepPhase::Suspending => false,
    }
}

/// `StepByStep` progression only advances past `Succeeded`/`Skipped`,
/// never past `Failed` — even an exhausted one. A failed required step
/// halts the rest of a sequential chain; independent `DAG` branches are
/// unaffected.
fn unblocks_sequential_progression(status: &StepStatus) -> bool {
    matches!(status.phase, StepPhase::Succeeded | StepPhase::Skipped)
}

fn is_retryable(status: &StepStatus) -> bool {
    status.phase == StepPhase::Failed
        && !matches!(
            status.reason,
            Some(StepReason::Timeout) | Some(StepReason::Terminate) | Some(StepReason::FailedAfterRetries)
        )
}

fn any_suspending(statuses: &[StepStatus]) -> bool {
    statuses
        .iter()
        .any(|s| s.phase == StepPhase::Suspending || any_suspending(&s.sub_steps_status))
}

fn any_failed(statuses: &[StepStatus]) -> bool {
    statuses
        .iter()
        .any(|s| s.phase == StepPhase::Failed || any_failed(&s.sub_steps_status))
}

fn parse_timeout(raw: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = raw else { return default };
    let raw = raw.trim();
    let (digits, suffix) = raw.split_at(raw.len().saturating_sub(1));
    match (digits.parse::<u64>(), suffix) {
        (Ok(n), "s") => Duration::from_secs(n),
        (Ok(n), "m") => Duration::from_secs(n * 60),
        (Ok(n), "h") => Duration::from_secs(n * 3600),
        _ => raw.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
    }
}

fn backoff_for(attempt: i64, cap: Duration) -> Duration {
    let secs = 2u64.saturating_pow(attempt.clamp(0, 16) as u32).min(cap.as_secs().max(1));
    Duration::from_secs(secs.max(1))
}

/// Run one reconcile tick. Mutates `run.status` in place and commits any
/// context changes. Returns a hint for how soon to call `tick` again.
pub async fn tick(run: &mut WorkflowRun, ctx: &mut WorkflowContext, opts: &SchedulerOptions) -> Result<TickOutcome> {
    let _span = tracing::info_span!("reconcile", namespace = %run.namespace, name = %run.name).entered();

    if run.status.finished {
        return Ok(TickOutcome { requeue_after: None });
    }

    // `status.mode` mirrors `spec.mode` so the rest of this module only
    // ever has to read one place; the spec's mode is authoritative and
    // doesn't change after a run is created.
    run.status.mode = run.spec.mode.clone();

    seed_user_context(run, ctx)?;

    let steps = run
        .spec
        .workflow_spec
        .as_ref()
        .map(|s| s.steps.clone())
        .unwrap_or_default();
    let step_mode = run.status.mode.steps;

    let runners = generate(
        run,
        &StepGeneratorOptions {
            registry: opts.registry.clone(),
        },
    )
    .context("generating task runners")?;

    sync_statuses(&runners, &mut run.status.steps);

    if run.status.terminated {
        terminate_all(&mut run.status.steps);
        // spec §4.3: Terminate "clears Suspend" — a terminated run is
        // never left in a suspended state waiting on an operator Resume
        // that would otherwise be refused anyway (`resume` rejects once
        // `Terminated` is set).
        run.status.suspend = false;
        finalize_if_complete(run);
        if ctx.is_modified() {
            ctx.commit().await?;
        }
        return Ok(TickOutcome { requeue_after: None });
    }

    if run.status.suspend {
        wake_elapsed_suspensions(&mut run.status.steps, ctx).await?;
        // A failure-induced suspend (`EnableSuspendOnFailure`) must hold
        // until an operator Resume even once no step is `Suspending`
        // anymore — deriving the flag purely from `any_suspending` would
        // auto-resume a run a human hasn't looked at yet.
        let failure_suspend_holds = opts.enable_suspend_on_failure && any_failed(&run.status.steps);
        run.status.suspend = any_suspending(&run.status.steps) || failure_suspend_holds;
        if ctx.is_modified() {
            ctx.commit().await?;
        }
        return Ok(TickOutcome {
            requeue_after: Some(Duration::from_secs(5)),
        });
    }

    let summary = process_siblings(&steps, &runners, &mut run.status.steps, step_mode, ctx, opts).await?;

    if any_suspending(&run.status.steps) {
        run.status.suspend = true;
    }
    if opts.enable_suspend_on_failure && any_failed(&run.status.steps) {
        run.status.suspend = true;
    }

    finalize_if_complete(run);

    if ctx.is_modified() {
        ctx.commit().await?;
    }

    Ok(TickOutcome {
        requeue_after: if run.status.finished { None } else { summary.requeue_after },
    })
}

/// Inject `spec.context` (the user-provided initial key/values, spec §6)
/// under the `context` key in `vars`, once. Only seeds when that key is
/// still absent, so it never clobbers a value a step wrote later under the
/// same name across subsequent ticks.
fn seed_user_context(run: &WorkflowRun, ctx: &mut WorkflowContext) -> Result<()> {
    if run.spec.context.is_empty() {
        return Ok(());
    }
    if ctx.get_var("context").is_some() {
        return Ok(());
    }
    ctx.set_var("context", Value::Object(run.spec.context.clone()))
}

fn finalize_if_complete(run: &mut WorkflowRun) {
    if run.status.steps.iter().all(is_effectively_terminal) {
        run.status.finished = true;
        run.status.end_time = Some(Utc::now());
    }
}

/// Fails every currently in-flight step (`Running`/`Suspending`) with
/// reason `Terminate`. `Pending` steps are left exactly as they are —
/// `status.terminated` alone is what stops them from ever dispatching —
/// and already-terminal steps keep whatever reason they already carried.
fn terminate_all(statuses: &mut [StepStatus]) {
    for status in statuses {
        if matches!(status.phase, StepPhase::Running | StepPhase::Suspending) {
            status.phase = StepPhase::Failed;
            status.reason = Some(StepReason::Terminate);
            status.message = Some("terminated by operator action".to_string());
        }
        terminate_all(&mut status.sub_steps_status);
    }
}

async fn wake_elapsed_suspensions(statuses: &mut [StepStatus], ctx: &WorkflowContext) -> Result<()> {
    for status in statuses {
        if status.phase == StepPhase::Suspending {
            let key = format!("suspendUntil.{}", status.id);
            if let Some(until) = ctx.get_value_in_memory(&key).await.and_then(|v| v.as_i64()) {
                if Utc::now().timestamp_millis() >= until {
                    status.phase = StepPhase::Pending;
                    status.message = None;
                    ctx.delete_value_in_memory(&key).await;
                }
            }
        }
        Box::pin(wake_elapsed_suspensions(&mut status.sub_steps_status, ctx)).await?;
    }
    Ok(())
}

/// Rebuild `statuses` to match `runners`' order, reusing any entry with a
/// matching name and creating a fresh `Pending` one otherwise. Recurses
/// into `step-group` substatuses.
fn sync_statuses(runners: &[TaskRunner], statuses: &mut Vec<StepStatus>) {
    let mut rebuilt = Vec::with_capacity(runners.len());
    for runner in runners {
        let mut entry = statuses
            .iter()
            .find(|s| s.name == runner.step.name)
            .cloned()
            .unwrap_or_else(|| StepStatus::new(runner.id.clone(), &runner.step.name, &runner.step.step_type));
        if runner.is_group() {
            sync_statuses(&runner.sub_runners, &mut entry.sub_steps_status);
        }
        rebuilt.push(entry);
    }
    *statuses = rebuilt;
}

struct SiblingSummary {
    requeue_after: Option<Duration>,
}

fn min_requeue(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

async fn process_siblings(
    steps: &[Step],
    runners: &[TaskRunner],
    statuses: &mut [StepStatus],
    mode: ExecuteMode,
    ctx: &mut WorkflowContext,
    opts: &SchedulerOptions,
) -> Result<SiblingSummary> {
    let depends_on = dependency::build_depends_on_map(steps);
    let mut requeue_after: Option<Duration> = None;

    for i in 0..runners.len() {
        if is_effectively_terminal(&statuses[i]) {
            continue;
        }

        let eligible = match mode {
            ExecuteMode::StepByStep => i == 0 || unblocks_sequential_progression(&statuses[i - 1]),
            ExecuteMode::Dag => dependency::predecessors_of(&depends_on, &runners[i].step.name)
                .into_iter()
                .all(|dep| {
                    statuses
                        .iter()
                        .find(|s| s.name == dep)
                        .map(is_effectively_terminal)
                        .unwrap_or(true)
                }),
        };

        if !eligible {
            continue;
        }

        if runners[i].is_group() {
            let sub_mode = runners[i].sub_step_execute_mode;
            let sub_steps = &runners[i].step.sub_steps;
            let sub_summary = Box::pin(process_siblings(
                sub_steps,
                &runners[i].sub_runners,
                &mut statuses[i].sub_steps_status,
                sub_mode,
                ctx,
                opts,
            ))
            .await?;
            requeue_after = min_requeue(requeue_after, sub_summary.requeue_after);

            if statuses[i].first_execute_time.is_none() {
                statuses[i].first_execute_time = Some(Utc::now());
            }
            statuses[i].last_execute_time = Some(Utc::now());

            if statuses[i].sub_steps_status.iter().all(is_effectively_terminal) {
                let all_ok = statuses[i]
                    .sub_steps_status
                    .iter()
                    .all(|s| matches!(s.phase, StepPhase::Succeeded | StepPhase::Skipped));
                statuses[i].phase = if all_ok { StepPhase::Succeeded } else { StepPhase::Failed };
            } else {
                statuses[i].phase = StepPhase::Running;
            }
            continue;
        }

        let maybe_backoff = dispatch_leaf(&runners[i], &mut statuses[i], ctx, opts).await?;
        requeue_after = min_requeue(requeue_after, maybe_backoff);
    }

    Ok(SiblingSummary { requeue_after })
}

/// Evaluate `If`, bind inputs, dispatch the bound provider, and fold the
/// outcome back into `status`. Returns a suggested requeue delay when the
/// step is still in flight or waiting out a retry backoff.
async fn dispatch_leaf(
    runner: &TaskRunner,
    status: &mut StepStatus,
    ctx: &mut WorkflowContext,
    opts: &SchedulerOptions,
) -> Result<Option<Duration>> {
    let step = &runner.step;

    if status.first_execute_time.is_none() {
        status.first_execute_time = Some(Utc::now());
    }

    if let Some(expr) = &step.if_expr {
        if !is_truthy(ctx.get_var(expr)) {
            status.phase = StepPhase::Skipped;
            status.reason = None;
            status.last_execute_time = Some(Utc::now());
            return Ok(None);
        }
    }

    let deadline = parse_timeout(step.timeout.as_deref(), opts.default_step_timeout);
    if let Some(first) = status.first_execute_time {
        let elapsed = Utc::now().signed_duration_since(first);
        if elapsed.to_std().map(|d| d > deadline).unwrap_or(false) {
            status.phase = StepPhase::Failed;
            status.reason = Some(StepReason::Timeout);
            status.message = Some("step exceeded its timeout".to_string());
            status.last_execute_time = Some(Utc::now());
            return Ok(None);
        }
    }

    let mut properties = step.properties.clone();
    for input in &step.inputs {
        let path = format!("outputs.{}", input.from);
        match ctx.get_var(&path) {
            Some(value) => {
                crate::context::value::set(&mut properties, &crate::context::value::segments(&input.parameter_key), value.clone())?;
            }
            None => {
                status.phase = StepPhase::Failed;
                status.reason = Some(StepReason::InputLookupFailed);
                status.message = Some(format!("input '{}' has no value yet", input.from));
                status.last_execute_time = Some(Utc::now());
                return Ok(None);
            }
        }
    }

    status.phase = StepPhase::Running;
    status.last_execute_time = Some(Utc::now());

    let outcome = match runner.provider.as_ref() {
        Some(provider) => provider
            .run(ctx, &properties, deadline)
            .await
            .unwrap_or_else(|e| ProviderOutcome::Failed(e.to_string())),
        None => ProviderOutcome::Failed("step has no bound provider".to_string()),
    };

    match outcome {
        ProviderOutcome::Succeeded(outputs) => {
            status.phase = StepPhase::Succeeded;
            status.reason = None;
            status.message = None;
            let result = Value::Object(outputs.into_iter().collect());
            for declared in &step.outputs {
                if let Some(value) = crate::context::value::lookup(&result, &crate::context::value::segments(&declared.value_from)).cloned() {
                    ctx.set_var(&format!("outputs.{}", declared.name), value)?;
                }
            }
            tracing::info!(step = %step.name, phase = "Succeeded", "step dispatch completed");
            Ok(None)
        }
        ProviderOutcome::Failed(message) => {
            let attempt = ctx.increase_count_value_in_memory(&format!("retries.{}", runner.id)).await;
            let budget = step.error_retry_times.unwrap_or(opts.default_error_retry_times);
            status.phase = StepPhase::Failed;
            status.message = Some(message);
            if attempt + 1 >= budget as i64 {
                status.reason = Some(StepReason::FailedAfterRetries);
                tracing::warn!(step = %step.name, attempt, budget, "step failed, retry budget exhausted");
                Ok(None)
            } else {
                status.reason = None;
                let delay = backoff_for(attempt, opts.failed_state_backoff_cap);
                tracing::warn!(step = %step.name, attempt, budget, backoff_secs = delay.as_secs(), "step failed, will retry");
                Ok(Some(delay))
            }
        }
        ProviderOutcome::Running => Ok(Some(opts.wait_state_backoff_cap.min(Duration::from_secs(10)))),
        ProviderOutcome::Suspending(duration) => {
            status.phase = StepPhase::Suspending;
            status.message = Some("suspended".to_string());
            if let Some(duration) = duration {
                let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
                ctx.set_value_in_memory(&format!("suspendUntil.{}", runner.id), Value::from(until.timestamp_millis()))
                    .await;
            }
            tracing::info!(step = %step.name, "step suspended");
            Ok(Some(Duration::from_secs(5)))
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}
