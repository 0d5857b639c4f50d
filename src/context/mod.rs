//! Per-run mutable context: component manifests, the `vars` value tree, a
//! durable scratch area, and a non-durable in-memory side.

pub mod store;
pub mod value;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::model::{OwnerReference, WorkflowRun};
use store::{BackingObject, ContextBackend};

/// A workload descriptor plus its auxiliary trait descriptors. The concrete
/// rendering (CUE, Helm values, etc.) is external; here it is just JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentManifest {
    pub workload: Value,
    #[serde(default)]
    pub traits: Vec<Value>,
}

const COMPONENTS_KEY: &str = "components";
const VARS_KEY: &str = "vars";

/// Process-wide registry of per-run ephemeral scratch maps, keyed by
/// `namespace/name`. Concurrent-safe and explicitly purged by
/// [`cleanup_memory_store`] on run deletion/restart.
pub struct MemoryStoreRegistry {
    runs: RwLock<HashMap<String, Arc<RwLock<HashMap<String, Value>>>>>,
}

impl MemoryStoreRegistry {
    pub fn global() -> &'static MemoryStoreRegistry {
        static INSTANCE: OnceLock<MemoryStoreRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| MemoryStoreRegistry {
            runs: RwLock::new(HashMap::new()),
        })
    }

    pub async fn handle_for(&self, run_key: &str) -> Arc<RwLock<HashMap<String, Value>>> {
        if let Some(existing) = self.runs.read().await.get(run_key) {
            return existing.clone();
        }
        let mut runs = self.runs.write().await;
        runs.entry(run_key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
            .clone()
    }

    pub async fn cleanup(&self, run_key: &str) {
        self.runs.write().await.remove(run_key);
    }
}

/// The per-run mutable context.
pub struct WorkflowContext {
    namespace: String,
    name: String,
    owner_references: Vec<OwnerReference>,
    components: HashMap<String, ComponentManifest>,
    vars: Value,
    modified: bool,
    backend: Arc<dyn ContextBackend>,
    memory: Arc<RwLock<HashMap<String, Value>>>,
}

impl WorkflowContext {
    /// Default backing object name for a run, before any owner-conflict
    /// resolution has picked a suffixed alternative.
    pub fn default_backend_name(run_name: &str) -> String {
        format!("workflow-{run_name}-context")
    }

    /// Load (or lazily initialize) the context for `run`. Implements the
    /// owner-reference conflict policy: does not
    /// delete a pre-existing, differently-owned object, just stops using
    /// it and picks a fresh name.
    pub async fn load(run: &WorkflowRun, backend: Arc<dyn ContextBackend>) -> Result<Self> {
        let preferred_name = run
            .status
            .context_backend
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| Self::default_backend_name(&run.name));

        let existing = backend.get(&run.namespace, &preferred_name).await?;

        let (name, loaded) = match existing {
            Some(obj) if obj.owners_conflict(&run.owner_references) => {
                let suffix = &uuid::Uuid::new_v4().simple().to_string()[..5];
                (format!("{preferred_name}-{suffix}"), None)
            }
            Some(obj) => (preferred_name, Some(obj)),
            None => (preferred_name, None),
        };

        let memory = MemoryStoreRegistry::global()
            .handle_for(&format!("{}/{}", run.namespace, run.name))
            .await;

        let (components, vars) = match &loaded {
            Some(obj) => (
                decode_components(obj.data.get(COMPONENTS_KEY))?,
                decode_vars(obj.data.get(VARS_KEY))?,
            ),
            None => (HashMap::new(), Value::Object(serde_json::Map::new())),
        };

        Ok(Self {
            namespace: run.namespace.clone(),
            name,
            owner_references: run.owner_references.clone(),
            components,
            vars,
            modified: false,
            backend,
            memory,
        })
    }

    /// The resolved backing object name — stash this in
    /// `status.contextBackend` so subsequent reconciles reuse it directly.
    pub fn backend_name(&self) -> &str {
        &self.name
    }

    pub fn get_component(&self, name: &str) -> Option<&ComponentManifest> {
        self.components.get(name)
    }

    /// Structurally unify `patch` into the named component's workload.
    pub fn patch_component(&mut self, name: &str, patch: Value) -> Result<()> {
        let component = self
            .components
            .entry(name.to_string())
            .or_insert_with(ComponentManifest::default);
        value::unify(&mut component.workload, &patch);
        self.modified = true;
        Ok(())
    }

    pub fn get_var(&self, path: &str) -> Option<&Value> {
        value::lookup(&self.vars, &value::segments(path))
    }

    /// Write `value` at `path` in `vars`. The value schema itself is owned
    /// by the external expression language; this only enforces that the
    /// resulting tree stays a valid JSON document (always true here).
    pub fn set_var(&mut self, path: &str, val: Value) -> Result<()> {
        value::set(&mut self.vars, &value::segments(path), val)?;
        self.modified = true;
        Ok(())
    }

    pub fn vars(&self) -> &Value {
        &self.vars
    }

    /// Drop the `outputs.<name>` field for each name in `names`. Used by
    /// partial restart to clear the outputs of a restarted step and its
    /// dependents so downstream steps don't read a stale value produced by
    /// a prior failed attempt.
    pub fn clear_outputs(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        if let Some(outputs) = self.vars.get_mut("outputs") {
            value::clear_named_fields(outputs, names);
            self.modified = true;
        }
    }

    /// Compile a string expression against the context's value schema.
    pub fn make_parameter(&self, expr: &str) -> Result<Value> {
        value::make_parameter(expr)
    }

    // --- Durable mutable scratch area ---

    pub async fn get_mutable_value(&self, path: &str) -> Result<Option<String>> {
        let obj = self
            .backend
            .get(&self.namespace, &self.name)
            .await?
            .unwrap_or_default();
        Ok(obj.data.get(path).cloned())
    }

    pub async fn set_mutable_value(&self, value: &str, path: &str) -> Result<()> {
        self.ensure_exists().await?;
        let mut data = HashMap::new();
        data.insert(path.to_string(), value.to_string());
        self.backend.merge_patch(&self.namespace, &self.name, data).await
    }

    pub async fn delete_mutable_value(&self, path: &str) -> Result<()> {
        self.backend
            .remove_data_keys(&self.namespace, &self.name, &[path.to_string()])
            .await
    }

    async fn ensure_exists(&self) -> Result<()> {
        if self.backend.get(&self.namespace, &self.name).await?.is_none() {
            let obj = BackingObject::new(&self.name, &self.namespace, self.owner_references.clone());
            // Tolerate a racing creator — benign since both write the same shape.
            let _ = self.backend.create(obj).await;
        }
        Ok(())
    }

    // --- Non-durable in-memory scratch area ---

    pub async fn get_value_in_memory(&self, path: &str) -> Option<Value> {
        self.memory.read().await.get(path).cloned()
    }

    pub async fn set_value_in_memory(&self, path: &str, val: Value) {
        self.memory.write().await.insert(path.to_string(), val);
    }

    pub async fn delete_value_in_memory(&self, path: &str) {
        self.memory.write().await.remove(path);
    }

    /// Atomic increment initialized to 0 on first call; returns the
    /// pre-increment value (so the first call returns 0).
    pub async fn increase_count_value_in_memory(&self, path: &str) -> i64 {
        let mut memory = self.memory.write().await;
        let current = memory
            .get(path)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        memory.insert(path.to_string(), Value::from(current + 1));
        current
    }

    // --- Persistence ---

    /// Serialize `components`/`vars` and upsert the durable object. No-op
    /// when nothing mutated this context.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        let rendered_components = self
            .components
            .iter()
            .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
            .collect::<Result<HashMap<String, String>>>()?;
        let components_json = serde_json::to_string(&rendered_components)?;
        let vars_json = serde_json::to_string(&self.vars)?;

        let mut data = HashMap::new();
        data.insert(COMPONENTS_KEY.to_string(), components_json);
        data.insert(VARS_KEY.to_string(), vars_json);

        match self.backend.get(&self.namespace, &self.name).await? {
            Some(_) => {
                self.backend
                    .merge_patch(&self.namespace, &self.name, data)
                    .await?;
            }
            None => {
                let mut obj =
                    BackingObject::new(&self.name, &self.namespace, self.owner_references.clone());
                obj.data = data;
                self.backend.create(obj).await?;
            }
        }

        self.modified = false;
        Ok(())
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

fn decode_components(raw: Option<&String>) -> Result<HashMap<String, ComponentManifest>> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    let wrapper: HashMap<String, String> = serde_json::from_str(raw)
        .with_context(|| "failed to decode components wrapper")?;
    wrapper
        .into_iter()
        .map(|(k, v)| {
            let manifest: ComponentManifest =
                serde_json::from_str(&v).with_context(|| format!("failed to decode component '{k}'"))?;
            Ok((k, manifest))
        })
        .collect()
}

fn decode_vars(raw: Option<&String>) -> Result<Value> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Value::Object(serde_json::Map::new())),
    }
}

/// Purge a run's ephemeral memory-store entry. Called by `Restart`
/// (without a step name) and on run deletion (the durable
/// context is deleted but the in-memory store otherwise relies on process
/// restart — this closes that gap for the case we do control).
pub async fn cleanup_memory_store(namespace: &str, name: &str) {
    MemoryStoreRegistry::global()
        .cleanup(&format!("{namespace}/{name}"))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::store::MemBackend;
    use crate::model::WorkflowRunSpec;

    fn sample_run(name: &str) -> WorkflowRun {
        WorkflowRun {
            name: name.to_string(),
            namespace: "default".to_string(),
            owner_references: vec![OwnerReference {
                uid: "uid-1".to_string(),
                name: name.to_string(),
                kind: "WorkflowRun".to_string(),
            }],
            spec: WorkflowRunSpec {
                workflow_ref: None,
                workflow_spec: Some(Default::default()),
                mode: Default::default(),
                context: Default::default(),
            },
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn commit_is_noop_when_not_modified() {
        let backend = Arc::new(MemBackend::new());
        let run = sample_run("r1");
        let mut ctx = WorkflowContext::load(&run, backend.clone()).await.unwrap();
        ctx.commit().await.unwrap();
        assert!(backend.get("default", ctx.backend_name()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_then_load_round_trips_vars_and_components() {
        let backend = Arc::new(MemBackend::new());
        let run = sample_run("r2");
        let mut ctx = WorkflowContext::load(&run, backend.clone()).await.unwrap();
        ctx.set_var("outputs.build.image", Value::String("app:v1".into()))
            .unwrap();
        ctx.patch_component("web", serde_json::json!({"replicas": 3}))
            .unwrap();
        ctx.commit().await.unwrap();

        let mut run2 = sample_run("r2");
        run2.status.context_backend = Some(crate::model::ObjectReference {
            name: ctx.backend_name().to_string(),
            namespace: "default".into(),
        });
        let reloaded = WorkflowContext::load(&run2, backend.clone()).await.unwrap();
        assert_eq!(
            reloaded.get_var("outputs.build.image"),
            Some(&Value::String("app:v1".into()))
        );
        assert_eq!(
            reloaded.get_component("web").unwrap().workload,
            serde_json::json!({"replicas": 3})
        );
    }

    #[tokio::test]
    async fn increase_count_starts_at_zero_and_survives_reload() {
        let backend = Arc::new(MemBackend::new());
        let run = sample_run("r3");
        let ctx = WorkflowContext::load(&run, backend.clone()).await.unwrap();
        for expected in 0..5 {
            assert_eq!(ctx.increase_count_value_in_memory("retries.stepA").await, expected);
        }
    }

    #[tokio::test]
    async fn owner_conflict_picks_a_fresh_name() {
        let backend = Arc::new(MemBackend::new());
        let mut run = sample_run("r4");
        let name = WorkflowContext::default_backend_name("r4");
        backend
            .create(BackingObject::new(
                &name,
                "default",
                vec![OwnerReference {
                    uid: "some-other-uid".into(),
                    name: "r4".into(),
                    kind: "WorkflowRun".into(),
                }],
            ))
            .await
            .unwrap();
        run.status.context_backend = Some(crate::model::ObjectReference {
            name: name.clone(),
            namespace: "default".into(),
        });
        let ctx = WorkflowContext::load(&run, backend.clone()).await.unwrap();
        assert_ne!(ctx.backend_name(), name);
        assert!(ctx.backend_name().starts_with(&name));
    }

    #[tokio::test]
    async fn mutable_value_round_trips_through_backend() {
        let backend = Arc::new(MemBackend::new());
        let run = sample_run("r5");
        let ctx = WorkflowContext::load(&run, backend.clone()).await.unwrap();
        ctx.set_mutable_value("3", "retryCount.stepA").await.unwrap();
        assert_eq!(
            ctx.get_mutable_value("retryCount.stepA").await.unwrap(),
            Some("3".to_string())
        );
        ctx.delete_mutable_value("retryCount.stepA").await.unwrap();
        assert_eq!(ctx.get_mutable_value("retryCount.stepA").await.unwrap(), None);
    }
}
