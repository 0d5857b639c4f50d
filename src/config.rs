//! Runtime configuration, loaded from an optional YAML file with CLI/env
//! overrides layered on top, mirroring `cli/config.rs`'s
//! `IronFlowConfig::load` shape.

use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Top-level `workflow.yaml` configuration. Every field is optional; the
/// rest of the crate falls back to the `Default` impl when unset.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub context_store_dir: Option<String>,
    pub concurrent_reconciles: Option<usize>,
    pub feature_gates: FeatureGates,
    pub backoff: BackoffConfig,
    pub step: StepConfig,
    pub log_debug: Option<bool>,
    pub log_file_path: Option<String>,
    pub log_file_max_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureGates {
    pub enable_suspend_on_failure: bool,
    pub enable_persist_workflow_record: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            enable_suspend_on_failure: false,
            enable_persist_workflow_record: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub wait_state_max_time_secs: u64,
    pub failed_state_max_time_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            wait_state_max_time_secs: 60,
            failed_state_max_time_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub error_retry_times: u32,
    pub default_timeout_secs: u64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            error_retry_times: 10,
            default_timeout_secs: 300,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file.
    ///
    /// - `Some(path)`: load that file, error if missing.
    /// - `None`: auto-detect `workflow.yaml` in the current directory,
    ///   falling back to defaults if it isn't there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("workflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("failed to read config file: {}", file_path.display()))?;

        let config: RuntimeConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}

/// Hook invoked right before a run's durable context is deleted (full
/// restart or run teardown), so a deployment can archive it elsewhere
/// first. No-op by default; this crate ships only the trait seam.
#[async_trait]
pub trait BackupSink: Send + Sync {
    async fn backup(&self, namespace: &str, name: &str, snapshot: &serde_json::Value) -> Result<()>;
}

pub struct NoopBackupSink;

#[async_trait]
impl BackupSink for NoopBackupSink {
    async fn backup(&self, _namespace: &str, _name: &str, _snapshot: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}
