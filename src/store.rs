//! Persistence for [`WorkflowRun`] documents themselves — distinct from
//! [`crate::context::store`], which only persists the `vars`/`components`
//! scratch area a run's steps read and write. Grounded on
//! `storage/json_store.rs`'s write-then-rename JSON-file-per-record shape.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::WorkflowRun;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn put(&self, run: &WorkflowRun) -> Result<()>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<WorkflowRun>>;
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<WorkflowRun>>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// One JSON file per run under `<base_dir>/<namespace>/<name>.json`.
pub struct FileRunStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl FileRunStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn run_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.base_dir.join(namespace).join(format!("{name}.json"))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn put(&self, run: &WorkflowRun) -> Result<()> {
        let _lock = self.lock.write().await;
        let dir = self.base_dir.join(&run.namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.run_path(&run.namespace, &run.name);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(run)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<WorkflowRun>> {
        let _lock = self.lock.read().await;
        let path = self.run_path(namespace, name);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read run file: {}", path.display()))?;
        let run: WorkflowRun = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse run '{namespace}/{name}'"))?;
        Ok(Some(run))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<WorkflowRun>> {
        let _lock = self.lock.read().await;
        let mut runs = Vec::new();
        let namespaces: Vec<PathBuf> = match namespace {
            Some(ns) => vec![self.base_dir.join(ns)],
            None => {
                if !self.base_dir.exists() {
                    return Ok(Vec::new());
                }
                let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
                let mut dirs = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        dirs.push(entry.path());
                    }
                }
                dirs
            }
        };

        for dir in namespaces {
            if !dir.exists() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json")
                    && let Ok(data) = tokio::fs::read_to_string(&path).await
                    && let Ok(run) = serde_json::from_str::<WorkflowRun>(&data)
                {
                    runs.push(run);
                }
            }
        }

        runs.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(runs)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.run_path(namespace, name);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
