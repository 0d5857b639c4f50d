//! Provider registry glue: dynamic dispatch from a step's `type` string to
//! the handler that actually performs the work ("dynamic dispatch on
//! step type"). The concrete provider libraries — HTTP, email,
//! object manipulation — are external collaborators; this crate owns only
//! the trait seam and a handful of illustrative built-ins.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;

/// Outcome of one provider dispatch, mapped onto a [`crate::model::StepPhase`]
/// by the scheduler.
pub enum ProviderOutcome {
    Succeeded(HashMap<String, Value>),
    Failed(String),
    /// Provider needs another tick before it can decide (e.g. waiting on an
    /// external condition); handled like the reference engine's in-flight
    /// tasks, re-evaluated next reconcile rather than blocking.
    Running,
    /// Voluntarily suspend the step (and the run) for at most `duration`.
    Suspending(Option<Duration>),
}

/// A pluggable handler for one step `type`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn step_type(&self) -> &str;

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        properties: &Value,
        deadline: Duration,
    ) -> Result<ProviderOutcome>;
}

/// Registry of available provider handlers, mirroring the reference
/// engine's `NodeRegistry` shape (snapshot-and-share, lookup by type name).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.step_type().to_string(), provider);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(step_type).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
