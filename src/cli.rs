//! Command-line entrypoint: `run`/`validate` drive a `WorkflowRun` document
//! straight from a file, `list`/`inspect` and the operator subcommands work
//! against a [`FileRunStore`]-backed run, `serve` starts the Operator API.
//! Shaped after `cli/mod.rs`'s `Cli`/`Commands`/`load_dotenv` split.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{BackupSink, NoopBackupSink, RuntimeConfig};
use crate::context::WorkflowContext;
use crate::context::store::{ContextBackend, FileBackend};
use crate::model::WorkflowRun;
use crate::operator;
use crate::scheduler::{self, SchedulerOptions};
use crate::store::{FileRunStore, RunStore};

#[derive(Parser)]
#[command(name = "workflowctl", version, about = "Declarative multi-step workflow execution engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a workflow.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a WorkflowRun document (YAML or JSON) to completion
    Run {
        /// Path to the WorkflowRun document
        file: PathBuf,

        /// Context store directory
        #[arg(long, default_value = "data/context")]
        context_dir: PathBuf,

        /// Run store directory
        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,

        /// Maximum reconcile ticks before giving up (safety bound for a CLI-driven run)
        #[arg(long, default_value = "1000")]
        max_ticks: usize,
    },

    /// Parse and validate a WorkflowRun document without running it
    Validate {
        file: PathBuf,
    },

    /// List stored runs
    List {
        /// Run store directory
        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,
    },

    /// Print one run's full status
    Inspect {
        namespace: String,
        name: String,

        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,
    },

    /// Suspend a run
    Suspend {
        namespace: String,
        name: String,
        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,
    },

    /// Resume a suspended run
    Resume {
        namespace: String,
        name: String,
        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,
    },

    /// Terminate a run
    Terminate {
        namespace: String,
        name: String,
        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,
    },

    /// Restart a run, in full or from one failed step
    Restart {
        namespace: String,
        name: String,
        /// Restart from this failed step only; omit for a full restart
        #[arg(long)]
        step: Option<String>,
        #[arg(long, default_value = "data/runs")]
        run_dir: PathBuf,
        #[arg(long, default_value = "data/context")]
        context_dir: PathBuf,
    },

    /// Start the Operator API server
    Serve {
        #[arg(long, default_value = "0.0.0.0", env = "HOST")]
        host: String,
        #[arg(short, long, default_value = "8080", env = "PORT")]
        port: u16,
        #[arg(long, default_value = "data/runs", env = "RUN_DIR")]
        run_dir: PathBuf,
        #[arg(long, default_value = "data/context", env = "CONTEXT_DIR")]
        context_dir: PathBuf,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    load_dotenv(cli.dotenv.as_deref());
    let config = RuntimeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            context_dir,
            run_dir,
            max_ticks,
        } => cmd_run(file, context_dir, run_dir, max_ticks, &config).await,
        Commands::Validate { file } => cmd_validate(file),
        Commands::List { run_dir } => cmd_list(run_dir).await,
        Commands::Inspect { namespace, name, run_dir } => cmd_inspect(namespace, name, run_dir).await,
        Commands::Suspend { namespace, name, run_dir } => cmd_suspend(namespace, name, run_dir).await,
        Commands::Resume { namespace, name, run_dir } => cmd_resume(namespace, name, run_dir).await,
        Commands::Terminate { namespace, name, run_dir } => cmd_terminate(namespace, name, run_dir).await,
        Commands::Restart {
            namespace,
            name,
            step,
            run_dir,
            context_dir,
        } => cmd_restart(namespace, name, step, run_dir, context_dir).await,
        Commands::Serve {
            host,
            port,
            run_dir,
            context_dir,
        } => cmd_serve(&host, port, run_dir, context_dir).await,
    }
}

fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("loaded env from {}", path.display()),
            Err(e) => eprintln!("warning: failed to load dotenv file '{}': {e}", path.display()),
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => eprintln!("warning: failed to parse .env file: {e}"),
        },
    }
}

fn parse_workflow_run(file: &Path) -> Result<WorkflowRun> {
    let contents = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let run: WorkflowRun = if file.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&contents).with_context(|| format!("parsing {} as JSON", file.display()))?
    } else {
        serde_yml::from_str(&contents).with_context(|| format!("parsing {} as YAML", file.display()))?
    };
    run.spec.validate()?;
    Ok(run)
}

async fn cmd_run(
    file: PathBuf,
    context_dir: PathBuf,
    run_dir: PathBuf,
    max_ticks: usize,
    config: &RuntimeConfig,
) -> Result<()> {
    let mut run = parse_workflow_run(&file)?;
    println!("run: {}/{}", run.namespace, run.name);

    let context_backend: Arc<dyn ContextBackend> = Arc::new(FileBackend::new(&context_dir));
    let run_store = FileRunStore::new(&run_dir);

    let opts = SchedulerOptions {
        enable_suspend_on_failure: config.feature_gates.enable_suspend_on_failure,
        default_step_timeout: Duration::from_secs(config.step.default_timeout_secs),
        default_error_retry_times: config.step.error_retry_times,
        wait_state_backoff_cap: Duration::from_secs(config.backoff.wait_state_max_time_secs),
        failed_state_backoff_cap: Duration::from_secs(config.backoff.failed_state_max_time_secs),
        ..SchedulerOptions::default()
    };

    let mut ctx = WorkflowContext::load(&run, context_backend.clone()).await?;
    run.status.context_backend = Some(crate::model::ObjectReference {
        name: ctx.backend_name().to_string(),
        namespace: run.namespace.clone(),
    });

    let backup_sink: Arc<dyn BackupSink> = Arc::new(NoopBackupSink);

    for tick_n in 0..max_ticks {
        let outcome = scheduler::tick(&mut run, &mut ctx, &opts).await?;
        run_store.put(&run).await?;

        if run.status.finished {
            println!("finished after {} tick(s)", tick_n + 1);
            if config.feature_gates.enable_persist_workflow_record {
                let snapshot = serde_json::to_value(&run)?;
                backup_sink.backup(&run.namespace, &run.name, &snapshot).await?;
            }
            break;
        }
        match outcome.requeue_after {
            Some(delay) => tokio::time::sleep(delay.min(Duration::from_millis(50))).await,
            None => break,
        }
    }

    println!("{}", serde_json::to_string_pretty(&run.status)?);
    Ok(())
}

fn cmd_validate(file: PathBuf) -> Result<()> {
    let run = parse_workflow_run(&file)?;
    let steps = run.spec.workflow_spec.as_ref().map(|s| s.steps.len()).unwrap_or(0);
    println!("run: {}/{} ({steps} step(s))", run.namespace, run.name);
    println!("validation: OK");
    Ok(())
}

async fn cmd_list(run_dir: PathBuf) -> Result<()> {
    let store = FileRunStore::new(run_dir);
    let runs = store.list(None).await?;
    if runs.is_empty() {
        println!("no runs found.");
        return Ok(());
    }
    println!("{:<12} {:<24} {:<12}", "NAMESPACE", "NAME", "FINISHED");
    println!("{}", "-".repeat(50));
    for run in &runs {
        println!("{:<12} {:<24} {:<12}", run.namespace, run.name, run.status.finished);
    }
    println!("\ntotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(namespace: String, name: String, run_dir: PathBuf) -> Result<()> {
    let store = FileRunStore::new(run_dir);
    let run = store
        .get(&namespace, &name)
        .await?
        .with_context(|| format!("run '{namespace}/{name}' not found"))?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

async fn load_stored(run_dir: &Path, namespace: &str, name: &str) -> Result<(FileRunStore, WorkflowRun)> {
    let store = FileRunStore::new(run_dir);
    let run = store
        .get(namespace, name)
        .await?
        .with_context(|| format!("run '{namespace}/{name}' not found"))?;
    Ok((store, run))
}

async fn cmd_suspend(namespace: String, name: String, run_dir: PathBuf) -> Result<()> {
    let (store, mut run) = load_stored(&run_dir, &namespace, &name).await?;
    operator::suspend(&mut run)?;
    store.put(&run).await?;
    println!("suspended {namespace}/{name}");
    Ok(())
}

async fn cmd_resume(namespace: String, name: String, run_dir: PathBuf) -> Result<()> {
    let (store, mut run) = load_stored(&run_dir, &namespace, &name).await?;
    operator::resume(&mut run)?;
    store.put(&run).await?;
    println!("resumed {namespace}/{name}");
    Ok(())
}

async fn cmd_terminate(namespace: String, name: String, run_dir: PathBuf) -> Result<()> {
    let (store, mut run) = load_stored(&run_dir, &namespace, &name).await?;
    operator::terminate(&mut run)?;
    store.put(&run).await?;
    println!("terminated {namespace}/{name}");
    Ok(())
}

async fn cmd_restart(
    namespace: String,
    name: String,
    step: Option<String>,
    run_dir: PathBuf,
    context_dir: PathBuf,
) -> Result<()> {
    let (store, mut run) = load_stored(&run_dir, &namespace, &name).await?;
    let context_backend: Arc<dyn ContextBackend> = Arc::new(FileBackend::new(&context_dir));

    match step {
        Some(step_name) => {
            let mut ctx = WorkflowContext::load(&run, context_backend).await?;
            operator::restart_partial(&mut run, &step_name, &mut ctx).await?;
            ctx.commit().await?;
        }
        None => {
            operator::restart_full(&mut run, context_backend).await?;
        }
    }

    store.put(&run).await?;
    println!("restarted {namespace}/{name}");
    Ok(())
}

async fn cmd_serve(host: &str, port: u16, run_dir: PathBuf, context_dir: PathBuf) -> Result<()> {
    let state = Arc::new(crate::api::AppState {
        run_store: Arc::new(FileRunStore::new(run_dir)),
        context_backend: Arc::new(FileBackend::new(context_dir)),
    });
    crate::api::serve(host, port, state).await
}
