//! Turns a declarative [`Step`] tree into an executable [`TaskRunner`] tree,
//! reusing stable IDs from prior status and resolving each non-group step's
//! provider up front.

use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::model::{ExecuteMode, Step, StepStatus, WorkflowRun};
use crate::provider::{Provider, ProviderRegistry};

/// One node in the executable tree: a bound provider (for leaf steps) or a
/// recursive list of sub-runners (for `step-group`).
pub struct TaskRunner {
    pub id: String,
    pub step: Step,
    pub provider: Option<Arc<dyn Provider>>,
    pub sub_runners: Vec<TaskRunner>,
    pub sub_step_execute_mode: ExecuteMode,
}

impl TaskRunner {
    pub fn is_group(&self) -> bool {
        self.step.is_group()
    }
}

pub struct StepGeneratorOptions {
    pub registry: Arc<ProviderRegistry>,
}

/// Generate task runners for every top-level step of `run`, reusing IDs
/// from `run.status.steps` where names match.
pub fn generate(run: &WorkflowRun, opts: &StepGeneratorOptions) -> Result<Vec<TaskRunner>> {
    let steps = run
        .spec
        .workflow_spec
        .as_ref()
        .map(|s| s.steps.as_slice())
        .unwrap_or(&[]);
    let sub_mode = run.status.mode.sub_steps;

    steps
        .iter()
        .map(|step| generate_one(step, &run.status.steps, sub_mode, opts))
        .collect()
}

fn generate_one(
    step: &Step,
    prior_siblings: &[StepStatus],
    sub_mode: ExecuteMode,
    opts: &StepGeneratorOptions,
) -> Result<TaskRunner> {
    let prior = prior_siblings.iter().find(|s| s.name == step.name);
    let id = prior
        .map(|s| s.id.clone())
        .unwrap_or_else(|| mint_id(10));

    if step.is_group() {
        let prior_sub_steps: &[StepStatus] = prior
            .map(|s| s.sub_steps_status.as_slice())
            .unwrap_or(&[]);
        let sub_runners = step
            .sub_steps
            .iter()
            .map(|sub| generate_one(sub, prior_sub_steps, sub_mode, opts))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("generating substeps of group '{}'", step.name))?;

        Ok(TaskRunner {
            id,
            step: step.clone(),
            provider: None,
            sub_runners,
            sub_step_execute_mode: sub_mode,
        })
    } else {
        let provider = opts
            .registry
            .get(&step.step_type)
            .with_context(|| format!("unknown step type '{}' for step '{}'", step.step_type, step.name))?;

        Ok(TaskRunner {
            id,
            step: step.clone(),
            provider: Some(provider),
            sub_runners: Vec::new(),
            sub_step_execute_mode: ExecuteMode::Dag,
        })
    }
}

/// Mint a fresh random ID of `len` hex characters.
pub fn mint_id(len: usize) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    raw[..len.min(raw.len())].to_string()
}
