//! Declarative data model for a [`WorkflowRun`] and its observed status.
//!
//! These types mirror the `core.oam.dev/v1alpha1` `WorkflowRun` custom
//! resource described in the specification: the controller plumbing that
//! watches and reconciles this object lives outside this crate, but the
//! wire shape it reconciles against is owned here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution ordering for a set of sibling steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecuteMode {
    #[serde(rename = "DAG")]
    Dag,
    StepByStep,
}

impl Default for ExecuteMode {
    fn default() -> Self {
        ExecuteMode::Dag
    }
}

/// `mode.steps` / `mode.subSteps` on the run spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMode {
    #[serde(default)]
    pub steps: ExecuteMode,
    #[serde(default, rename = "subSteps")]
    pub sub_steps: ExecuteMode,
}

impl Default for WorkflowMode {
    fn default() -> Self {
        Self {
            steps: ExecuteMode::Dag,
            sub_steps: ExecuteMode::Dag,
        }
    }
}

/// One input binding: read the producer's output and merge it into this
/// step's properties under `parameter_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub from: String,
    #[serde(rename = "parameterKey")]
    pub parameter_key: String,
}

/// One output declaration: the value at `value_from` (a path into this
/// step's result) is published under `name` for downstream steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub name: String,
    #[serde(rename = "valueFrom")]
    pub value_from: String,
}

/// One node in the step graph, declared by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default, rename = "if")]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    #[serde(default)]
    pub outputs: Vec<StepOutput>,
    #[serde(default)]
    pub properties: serde_json::Value,
    /// Populated only for `type: step-group`.
    #[serde(default, rename = "subSteps")]
    pub sub_steps: Vec<Step>,
    /// Overrides `workflow.step.errorRetryTimes` for this step alone.
    #[serde(default, rename = "errorRetryTimes")]
    pub error_retry_times: Option<u32>,
}

impl Step {
    pub fn is_group(&self) -> bool {
        self.step_type == "step-group"
    }
}

/// The declarative body of a run: either inline steps or a named template
/// reference (mutually exclusive, enforced by [`WorkflowRunSpec::validate`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunSpec {
    #[serde(default, rename = "workflowRef")]
    pub workflow_ref: Option<String>,
    #[serde(default, rename = "workflowSpec")]
    pub workflow_spec: Option<WorkflowSpec>,
    #[serde(default)]
    pub mode: WorkflowMode,
    /// User-provided initial key/values, injected under `context` in `vars`.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowRunSpec {
    /// `workflowRef` and `workflowSpec` are mutually exclusive.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.workflow_ref, &self.workflow_spec) {
            (Some(_), Some(_)) => {
                anyhow::bail!("workflowRef and workflowSpec are mutually exclusive")
            }
            (None, None) => anyhow::bail!("one of workflowRef or workflowSpec is required"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerReference {
    pub uid: String,
    pub name: String,
    pub kind: String,
}

/// The top-level run object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub name: String,
    pub namespace: String,
    #[serde(default, rename = "ownerReferences")]
    pub owner_references: Vec<OwnerReference>,
    pub spec: WorkflowRunSpec,
    #[serde(default)]
    pub status: WorkflowRunStatus,
}

/// Why a step stopped advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepReason {
    Timeout,
    FailedAfterRetries,
    Terminate,
    Action,
    InputLookupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Suspending,
}

impl StepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepPhase::Succeeded | StepPhase::Failed | StepPhase::Skipped
        )
    }
}

/// Observed state of one step (or substep) across reconciles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    /// Stable, opaque across restarts.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub phase: StepPhase,
    #[serde(default)]
    pub reason: Option<StepReason>,
    #[serde(default, rename = "firstExecuteTime")]
    pub first_execute_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastExecuteTime")]
    pub last_execute_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "subStepsStatus")]
    pub sub_steps_status: Vec<StepStatus>,
}

impl StepStatus {
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type: step_type.into(),
            phase: StepPhase::Pending,
            reason: None,
            first_execute_time: None,
            last_execute_time: None,
            message: None,
            sub_steps_status: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRunStatus {
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, rename = "endTime")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: WorkflowMode,
    #[serde(default, rename = "contextBackend")]
    pub context_backend: Option<ObjectReference>,
    #[serde(default)]
    pub steps: Vec<StepStatus>,
}

/// Flattened JSON view of the whole `vars` tree, addressed with dotted
/// paths (`outputs.build.image`). The real value-expression language is an
/// external collaborator; this is the minimal standalone stand-in
/// this crate depends on internally.
pub type VarMap = HashMap<String, serde_json::Value>;
