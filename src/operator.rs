//! The four operator-facing actions a caller can take against a running
//! [`WorkflowRun`]: suspend, resume, restart (full or from a failed step),
//! and terminate. Rollback is intentionally unsupported. These are plain
//! functions over `&mut WorkflowRun` rather than a REST-shaped surface —
//! [`crate::api`] is the thin transport wrapping them.

use std::collections::HashSet;
use std::sync::Arc;

use crate::context::store::ContextBackend;
use crate::context::{cleanup_memory_store, WorkflowContext};
use crate::error::OperatorError;
use crate::model::{Step, StepPhase, StepReason, StepStatus, WorkflowRun, WorkflowRunStatus};
use crate::scheduler::dependency;

/// Idempotent: calling suspend on an already-suspended run is a no-op.
pub fn suspend(run: &mut WorkflowRun) -> Result<(), OperatorError> {
    tracing::info!(namespace = %run.namespace, name = %run.name, "operator: suspend");
    run.status.suspend = true;
    Ok(())
}

/// Flips every `Suspending` step (recursively, including substeps) back to
/// `Succeeded` and clears the run-level suspend flag. Refused once the run
/// has been terminated.
pub fn resume(run: &mut WorkflowRun) -> Result<(), OperatorError> {
    if run.status.terminated {
        return Err(OperatorError::RunTerminated);
    }
    tracing::info!(namespace = %run.namespace, name = %run.name, "operator: resume");
    unsuspend(&mut run.status.steps);
    run.status.suspend = false;
    Ok(())
}

fn unsuspend(statuses: &mut [StepStatus]) {
    for status in statuses {
        if status.phase == StepPhase::Suspending && status.step_type == "suspend" {
            status.phase = StepPhase::Succeeded;
            status.reason = Some(StepReason::Action);
            status.message = None;
        }
        unsuspend(&mut status.sub_steps_status);
    }
}

/// Marks the run terminated. The scheduler turns every `Running` step into
/// `Failed(Terminate)` on its next tick; already-terminal steps keep
/// whatever reason they already carried.
pub fn terminate(run: &mut WorkflowRun) -> Result<(), OperatorError> {
    run.status.terminated = true;
    Ok(())
}

/// Always refused: this engine keeps no versioned history to roll back to
/// beyond whatever a [`crate::config::BackupSink`] archives externally.
pub fn rollback() -> Result<(), OperatorError> {
    Err(OperatorError::RollbackUnsupported)
}

/// Deletes the durable context object and purges the in-memory scratch
/// area, then zeroes `status` entirely so the run starts over from step
/// one. Tolerates the context object already being absent.
pub async fn restart_full(run: &mut WorkflowRun, context_backend: Arc<dyn ContextBackend>) -> Result<(), OperatorError> {
    let default_name = WorkflowContext::default_backend_name(&run.name);
    context_backend
        .delete(&run.namespace, &default_name)
        .await
        .map_err(OperatorError::Other)?;
    if let Some(resolved) = &run.status.context_backend {
        if resolved.name != default_name {
            context_backend
                .delete(&run.namespace, &resolved.name)
                .await
                .map_err(OperatorError::Other)?;
        }
    }
    cleanup_memory_store(&run.namespace, &run.name).await;
    run.status = WorkflowRunStatus::default();
    Ok(())
}

/// Restarts from a single failed step: requires that step to currently be
/// `Failed`, then deletes its `StepStatus` and the status of everything
/// that (transitively, in `DAG` mode) depends on it, and wipes their
/// outputs out of `vars` so nothing downstream reads a stale value from
/// the failed attempt. Deleted entries regenerate with a fresh ID on the
/// next reconcile — IDs are stable only for steps that survive a restart.
///
/// When the named step is a substep, the substep's own dependents (within
/// its group) are deleted the same way, the enclosing top-level group's
/// `StepStatus` itself is kept but reset to `Running` (a partially-reset
/// group can't resume mid-flight without being re-entered), and the
/// group's own top-level dependents are deleted too.
pub async fn restart_partial(
    run: &mut WorkflowRun,
    step_name: &str,
    ctx: &mut WorkflowContext,
) -> Result<(), OperatorError> {
    if run.status.terminated {
        return Err(OperatorError::RunTerminated);
    }

    let target_phase = find_status(&run.status.steps, step_name)
        .map(|s| s.phase)
        .ok_or_else(|| OperatorError::StepNotFound(step_name.to_string()))?;
    if target_phase != StepPhase::Failed {
        return Err(OperatorError::NotFailed(step_name.to_string(), target_phase));
    }

    let top_level_steps: Vec<Step> = run
        .spec
        .workflow_spec
        .as_ref()
        .map(|s| s.steps.clone())
        .unwrap_or_default();
    let mode = run.status.mode.steps;
    let sub_mode = run.status.mode.sub_steps;

    let mut removed_ids = Vec::new();
    let mut cleared_outputs: HashSet<String> = HashSet::new();

    if top_level_steps.iter().any(|s| s.name == step_name) {
        let mut targets: HashSet<String> = dependency::dependents_of(&top_level_steps, step_name, mode)
            .into_iter()
            .collect();
        targets.insert(step_name.to_string());

        collect_outputs_in(&top_level_steps, &targets, &mut cleared_outputs);
        remove_named(&mut run.status.steps, &targets, &mut removed_ids);
    } else {
        let group_name = find_enclosing_top_level_name(&top_level_steps, step_name)
            .ok_or_else(|| OperatorError::StepNotFound(step_name.to_string()))?;
        let group_step = top_level_steps
            .iter()
            .find(|s| s.name == group_name)
            .expect("group_name was just found among top_level_steps");

        let mut sub_targets: HashSet<String> =
            dependency::dependents_of(&group_step.sub_steps, step_name, sub_mode)
                .into_iter()
                .collect();
        sub_targets.insert(step_name.to_string());
        collect_outputs_in(&group_step.sub_steps, &sub_targets, &mut cleared_outputs);

        if let Some(group_status) = find_status_mut(&mut run.status.steps, &group_name) {
            remove_named(&mut group_status.sub_steps_status, &sub_targets, &mut removed_ids);
            group_status.phase = StepPhase::Running;
            group_status.reason = None;
            group_status.message = None;
        }

        let top_targets: HashSet<String> = dependency::dependents_of(&top_level_steps, &group_name, mode)
            .into_iter()
            .collect();
        collect_outputs_in(&top_level_steps, &top_targets, &mut cleared_outputs);
        remove_named(&mut run.status.steps, &top_targets, &mut removed_ids);
    }

    for id in removed_ids {
        ctx.delete_value_in_memory(&format!("retries.{id}")).await;
        ctx.delete_value_in_memory(&format!("suspendUntil.{id}")).await;
    }
    ctx.clear_outputs(&cleared_outputs.into_iter().collect::<Vec<_>>());

    run.status.terminated = false;
    run.status.suspend = false;
    run.status.finished = false;
    run.status.end_time = None;
    Ok(())
}

fn find_status<'a>(statuses: &'a [StepStatus], name: &str) -> Option<&'a StepStatus> {
    for status in statuses {
        if status.name == name {
            return Some(status);
        }
        if let Some(found) = find_status(&status.sub_steps_status, name) {
            return Some(found);
        }
    }
    None
}

fn find_status_mut<'a>(statuses: &'a mut [StepStatus], name: &str) -> Option<&'a mut StepStatus> {
    for status in statuses {
        if status.name == name {
            return Some(status);
        }
        if let Some(found) = find_status_mut(&mut status.sub_steps_status, name) {
            return Some(found);
        }
    }
    None
}

/// Remove every entry in `statuses` whose name is in `targets`, recording
/// the id of each removed entry (and, recursively, its substeps' ids) into
/// `ids_out` so the caller can purge their retry/suspend scratch state.
fn remove_named(statuses: &mut Vec<StepStatus>, targets: &HashSet<String>, ids_out: &mut Vec<String>) {
    let mut i = 0;
    while i < statuses.len() {
        if targets.contains(&statuses[i].name) {
            let removed = statuses.remove(i);
            collect_ids(&removed, ids_out);
        } else {
            i += 1;
        }
    }
}

fn collect_ids(status: &StepStatus, out: &mut Vec<String>) {
    out.push(status.id.clone());
    for sub in &status.sub_steps_status {
        collect_ids(sub, out);
    }
}

/// For every step in `siblings` whose name is in `targets`, collect its own
/// declared output names plus (recursively) every output declared anywhere
/// in its substep subtree — the whole subtree's status is being deleted,
/// so every output it could have produced must be wiped from `vars` too.
fn collect_outputs_in(siblings: &[Step], targets: &HashSet<String>, out: &mut HashSet<String>) {
    for step in siblings {
        if targets.contains(&step.name) {
            collect_all_outputs(step, out);
        }
    }
}

fn collect_all_outputs(step: &Step, out: &mut HashSet<String>) {
    out.extend(step.outputs.iter().map(|o| o.name.clone()));
    for sub in &step.sub_steps {
        collect_all_outputs(sub, out);
    }
}

fn find_enclosing_top_level_name(steps: &[Step], target: &str) -> Option<String> {
    fn contains(step: &Step, target: &str) -> bool {
        step.name == target || step.sub_steps.iter().any(|s| contains(s, target))
    }
    steps.iter().find(|s| contains(s, target)).map(|s| s.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecuteMode, StepInput, StepOutput, WorkflowMode, WorkflowRunSpec};

    fn status(name: &str, phase: StepPhase) -> StepStatus {
        let mut s = StepStatus::new(format!("id-{name}"), name, "suspend");
        s.phase = phase;
        s
    }

    fn step(name: &str, depends_on: Vec<&str>) -> Step {
        Step {
            name: name.to_string(),
            step_type: "suspend".to_string(),
            if_expr: None,
            timeout: None,
            depends_on: depends_on.into_iter().map(String::from).collect(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: serde_json::json!({}),
            sub_steps: Vec::new(),
            error_retry_times: None,
        }
    }

    fn run_with(steps: Vec<Step>, statuses: Vec<StepStatus>, mode: ExecuteMode) -> WorkflowRun {
        WorkflowRun {
            name: "r".into(),
            namespace: "default".into(),
            owner_references: vec![],
            spec: WorkflowRunSpec {
                workflow_ref: None,
                workflow_spec: Some(crate::model::WorkflowSpec { steps }),
                mode: WorkflowMode { steps: mode, sub_steps: mode },
                context: Default::default(),
            },
            status: WorkflowRunStatus {
                mode: WorkflowMode { steps: mode, sub_steps: mode },
                steps: statuses,
                ..Default::default()
            },
        }
    }

    #[test]
    fn suspend_then_resume_round_trips() {
        let mut run = run_with(vec![step("a", vec![])], vec![status("a", StepPhase::Suspending)], ExecuteMode::Dag);
        suspend(&mut run).unwrap();
        assert!(run.status.suspend);
        resume(&mut run).unwrap();
        assert!(!run.status.suspend);
        assert_eq!(run.status.steps[0].phase, StepPhase::Succeeded);
        assert_eq!(run.status.steps[0].reason, Some(StepReason::Action));
    }

    #[test]
    fn resume_is_refused_after_terminate() {
        let mut run = run_with(vec![step("a", vec![])], vec![status("a", StepPhase::Running)], ExecuteMode::Dag);
        terminate(&mut run).unwrap();
        assert!(matches!(resume(&mut run), Err(OperatorError::RunTerminated)));
    }

    #[test]
    fn rollback_always_fails() {
        assert!(matches!(rollback(), Err(OperatorError::RollbackUnsupported)));
    }

    #[tokio::test]
    async fn partial_restart_requires_failed_phase() {
        let mut run = run_with(vec![step("a", vec![])], vec![status("a", StepPhase::Succeeded)], ExecuteMode::Dag);
        let backend = Arc::new(crate::context::store::MemBackend::new());
        let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
        let err = restart_partial(&mut run, "a", &mut ctx).await.unwrap_err();
        assert!(matches!(err, OperatorError::NotFailed(_, StepPhase::Succeeded)));
    }

    #[tokio::test]
    async fn partial_restart_removes_target_and_dependent_statuses() {
        // Mirrors the [A(ok), B(ok), C(failed), D(pending)] StepByStep
        // scenario: restarting C drops C's and D's status entirely while
        // A and B are left untouched.
        let steps = vec![step("a", vec![]), step("b", vec![]), step("c", vec![]), step("d", vec![])];
        let statuses = vec![
            status("a", StepPhase::Succeeded),
            status("b", StepPhase::Succeeded),
            status("c", StepPhase::Failed),
            status("d", StepPhase::Pending),
        ];
        let mut run = run_with(steps, statuses, ExecuteMode::StepByStep);
        let backend = Arc::new(crate::context::store::MemBackend::new());
        let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
        restart_partial(&mut run, "c", &mut ctx).await.unwrap();

        let names: Vec<&str> = run.status.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!run.status.finished);
    }

    #[tokio::test]
    async fn partial_restart_clears_dependent_output_vars() {
        let mut a = step("a", vec![]);
        a.outputs.push(StepOutput {
            name: "x".to_string(),
            value_from: "result".to_string(),
        });
        let mut b = step("b", vec![]);
        b.inputs.push(StepInput {
            from: "x".to_string(),
            parameter_key: "p".to_string(),
        });
        b.outputs.push(StepOutput {
            name: "y".to_string(),
            value_from: "result".to_string(),
        });
        let steps = vec![a, b];
        let statuses = vec![status("a", StepPhase::Failed), status("b", StepPhase::Succeeded)];
        let mut run = run_with(steps, statuses, ExecuteMode::Dag);

        let backend = Arc::new(crate::context::store::MemBackend::new());
        let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
        ctx.set_var("outputs.x", serde_json::json!("stale")).unwrap();
        ctx.set_var("outputs.y", serde_json::json!("stale")).unwrap();
        ctx.set_var("outputs.untouched", serde_json::json!("keep")).unwrap();

        restart_partial(&mut run, "a", &mut ctx).await.unwrap();

        assert_eq!(ctx.get_var("outputs.x"), None);
        assert_eq!(ctx.get_var("outputs.y"), None);
        assert_eq!(ctx.get_var("outputs.untouched"), Some(&serde_json::json!("keep")));
    }

    #[tokio::test]
    async fn partial_restart_of_nested_substep_resets_group_to_running() {
        let mut group = step("g", vec![]);
        group.step_type = "step-group".to_string();
        group.sub_steps = vec![step("inner-a", vec![]), step("inner-b", vec!["inner-a"])];

        let mut group_status = status("g", StepPhase::Failed);
        group_status.sub_steps_status = vec![
            status("inner-a", StepPhase::Failed),
            status("inner-b", StepPhase::Pending),
        ];

        let mut run = run_with(vec![group], vec![group_status], ExecuteMode::Dag);
        let backend = Arc::new(crate::context::store::MemBackend::new());
        let mut ctx = WorkflowContext::load(&run, backend).await.unwrap();
        restart_partial(&mut run, "inner-a", &mut ctx).await.unwrap();

        assert_eq!(run.status.steps[0].phase, StepPhase::Running);
        assert!(run.status.steps[0].sub_steps_status.is_empty());
    }
}
