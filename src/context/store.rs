//! Durable backing store for a run's [`super::WorkflowContext`].
//!
//! Two backends share one trait: a
//! durable, config-map-like object keyed by namespace/name (here: a JSON
//! file per object, the same persistence shape the reference engine uses
//! for its run records), and a process-wide in-memory registry used for
//! tests or the `ephemeral` feature toggle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::model::OwnerReference;

/// The durable context object: a config-map-like record with two reserved
/// data keys (`components`, `vars`) plus whatever mutable scratch keys
/// `SetMutableValue` has written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackingObject {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl BackingObject {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, owners: Vec<OwnerReference>) -> Self {
        let mut annotations = HashMap::new();
        annotations.insert("vela.io/startTime".to_string(), Utc::now().to_rfc3339());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            owner_references: owners,
            annotations,
            data: HashMap::new(),
        }
    }

    /// True when `owners` differ from what this object currently carries —
    /// the trigger for the "create a new object under a random suffix"
    /// policy.
    pub fn owners_conflict(&self, owners: &[OwnerReference]) -> bool {
        if self.owner_references.is_empty() {
            return false;
        }
        let existing: std::collections::HashSet<&str> =
            self.owner_references.iter().map(|o| o.uid.as_str()).collect();
        let incoming: std::collections::HashSet<&str> = owners.iter().map(|o| o.uid.as_str()).collect();
        existing != incoming
    }
}

#[async_trait]
pub trait ContextBackend: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BackingObject>>;
    /// Create-if-absent; errors if the object already exists.
    async fn create(&self, obj: BackingObject) -> Result<()>;
    /// Merge-patch the data/annotations of an existing object.
    async fn merge_patch(
        &self,
        namespace: &str,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<()>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
    /// Remove specific data keys from an existing object (used by
    /// `DeleteMutableValue`).
    async fn remove_data_keys(&self, namespace: &str, name: &str, keys: &[String]) -> Result<()>;
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Process-wide in-memory registry — backs the `ephemeral` feature flag and
/// unit/integration tests, mirroring the reference engine's `NullStateStore`.
pub struct MemBackend {
    objects: RwLock<HashMap<String, BackingObject>>,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// The single process-wide instance backing the `ephemeral` toggle.
    pub fn global() -> &'static MemBackend {
        static INSTANCE: OnceLock<MemBackend> = OnceLock::new();
        INSTANCE.get_or_init(MemBackend::new)
    }
}

#[async_trait]
impl ContextBackend for MemBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BackingObject>> {
        Ok(self.objects.read().await.get(&key(namespace, name)).cloned())
    }

    async fn create(&self, obj: BackingObject) -> Result<()> {
        let k = key(&obj.namespace, &obj.name);
        let mut objects = self.objects.write().await;
        if objects.contains_key(&k) {
            anyhow::bail!("context object '{}' already exists", k);
        }
        objects.insert(k, obj);
        Ok(())
    }

    async fn merge_patch(
        &self,
        namespace: &str,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<()> {
        let k = key(namespace, name);
        let mut objects = self.objects.write().await;
        let obj = objects
            .get_mut(&k)
            .with_context(|| format!("context object '{k}' not found"))?;
        obj.data.extend(data);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.objects.write().await.remove(&key(namespace, name));
        Ok(())
    }

    async fn remove_data_keys(&self, namespace: &str, name: &str, keys: &[String]) -> Result<()> {
        let k = key(namespace, name);
        let mut objects = self.objects.write().await;
        if let Some(obj) = objects.get_mut(&k) {
            for key in keys {
                obj.data.remove(key);
            }
        }
        Ok(())
    }
}

/// Durable, on-disk backend — one JSON file per backing object. Stands in
/// for the real cluster object store (out of scope here); same
/// write-then-rename persistence the reference engine uses for run state.
pub struct FileBackend {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, namespace: &str, name: &str) -> PathBuf {
        self.base_dir.join(format!("{namespace}__{name}.json"))
    }

    async fn read(&self, path: &Path) -> Result<Option<BackingObject>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, obj: &BackingObject) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(obj)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ContextBackend for FileBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BackingObject>> {
        let _guard = self.lock.lock().await;
        self.read(&self.path_for(namespace, name)).await
    }

    async fn create(&self, obj: BackingObject) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(&obj.namespace, &obj.name);
        if self.read(&path).await?.is_some() {
            anyhow::bail!("context object '{}' already exists", path.display());
        }
        self.write(&path, &obj).await
    }

    async fn merge_patch(
        &self,
        namespace: &str,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(namespace, name);
        let mut obj = self
            .read(&path)
            .await?
            .with_context(|| format!("context object '{}' not found", path.display()))?;
        obj.data.extend(data);
        self.write(&path, &obj).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(namespace, name);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn remove_data_keys(&self, namespace: &str, name: &str, keys: &[String]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(namespace, name);
        if let Some(mut obj) = self.read(&path).await? {
            for key in keys {
                obj.data.remove(key);
            }
            self.write(&path, &obj).await?;
        }
        Ok(())
    }
}
