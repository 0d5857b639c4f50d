//! A small, illustrative set of built-in providers. Production deployments
//! plug in the real apply/read/notify libraries through [`super::ProviderRegistry::register`];
//! these exist so the engine is exercisable and testable standalone,
//! grounded on the reference engine's `builtin` node set
//! (`nodes/builtin/*.rs`) — one struct per step type, trait-object
//! registered by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::provider::{Provider, ProviderOutcome, ProviderRegistry};

pub fn register_all(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(ApplyComponentProvider));
    registry.register(Arc::new(ReadObjectProvider));
    registry.register(Arc::new(NotificationProvider));
    registry.register(Arc::new(SuspendProvider));
}

/// Patches (or creates) a component's workload manifest in the shared
/// context. `properties` is expected to carry `{component, patch}`.
pub struct ApplyComponentProvider;

#[async_trait]
impl Provider for ApplyComponentProvider {
    fn step_type(&self) -> &str {
        "apply-component"
    }

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        properties: &Value,
        _deadline: Duration,
    ) -> Result<ProviderOutcome> {
        let component = properties
            .get("component")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("apply-component requires 'component'"))?;
        let patch = properties.get("patch").cloned().unwrap_or(Value::Null);

        ctx.patch_component(component, patch.clone())?;

        let mut outputs = HashMap::new();
        outputs.insert("appliedComponent".to_string(), Value::String(component.to_string()));
        outputs.insert("patch".to_string(), patch);
        Ok(ProviderOutcome::Succeeded(outputs))
    }
}

/// Reads back a component's current manifest. `properties`: `{component}`.
pub struct ReadObjectProvider;

#[async_trait]
impl Provider for ReadObjectProvider {
    fn step_type(&self) -> &str {
        "read-object"
    }

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        properties: &Value,
        _deadline: Duration,
    ) -> Result<ProviderOutcome> {
        let component = properties
            .get("component")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("read-object requires 'component'"))?;

        match ctx.get_component(component) {
            Some(manifest) => {
                let mut outputs = HashMap::new();
                outputs.insert("value".to_string(), manifest.workload.clone());
                Ok(ProviderOutcome::Succeeded(outputs))
            }
            None => Ok(ProviderOutcome::Failed(format!(
                "component '{component}' not found in context"
            ))),
        }
    }
}

/// Sends a notification via an external webhook. `properties`: `{url,
/// message}`. Network failures are retryable.
pub struct NotificationProvider;

#[async_trait]
impl Provider for NotificationProvider {
    fn step_type(&self) -> &str {
        "notification"
    }

    async fn run(
        &self,
        _ctx: &mut WorkflowContext,
        properties: &Value,
        deadline: Duration,
    ) -> Result<ProviderOutcome> {
        let url = properties.get("url").and_then(Value::as_str);
        let message = properties
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("");

        let Some(url) = url else {
            // No URL configured: treat as a local no-op notification (e.g.
            // tests), not a failure.
            let mut outputs = HashMap::new();
            outputs.insert("delivered".to_string(), Value::Bool(false));
            return Ok(ProviderOutcome::Succeeded(outputs));
        };

        let client = reqwest::Client::new();
        let body = serde_json::json!({ "message": message });
        let result = tokio::time::timeout(deadline, client.post(url).json(&body).send()).await;

        match result {
            Ok(Ok(resp)) if resp.status().is_success() => {
                let mut outputs = HashMap::new();
                outputs.insert("delivered".to_string(), Value::Bool(true));
                Ok(ProviderOutcome::Succeeded(outputs))
            }
            Ok(Ok(resp)) => Ok(ProviderOutcome::Failed(format!(
                "notification endpoint returned {}",
                resp.status()
            ))),
            Ok(Err(e)) => Ok(ProviderOutcome::Failed(format!("notification request failed: {e}"))),
            Err(_) => Ok(ProviderOutcome::Failed("notification request timed out".to_string())),
        }
    }
}

/// Suspends the step (and, via the scheduler, the run) for manual approval
/// or a timed pause. `properties`: `{duration}` (seconds, optional).
pub struct SuspendProvider;

#[async_trait]
impl Provider for SuspendProvider {
    fn step_type(&self) -> &str {
        "suspend"
    }

    async fn run(
        &self,
        _ctx: &mut WorkflowContext,
        properties: &Value,
        _deadline: Duration,
    ) -> Result<ProviderOutcome> {
        let duration = properties
            .get("duration")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64);
        Ok(ProviderOutcome::Suspending(duration))
    }
}
