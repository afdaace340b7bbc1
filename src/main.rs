//! nodeflow command line
//!
//! Validates, runs and resumes workflows stored as JSON documents. Workflows
//! referenced by id (sub-workflows, error workflows) are loaded from the
//! workflow directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nodeflow::{
    config::Config,
    workflow::{WorkflowRegistry, WorkflowStorage},
    ExecutionEngine, ExecutionResult, Item, ResumePayload, RunStatus, SuspensionToken, Workflow,
};

#[derive(Debug, Parser)]
#[command(name = "nodeflow", version, about = "Node-based workflow execution engine")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "NODEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of workflow definitions used for id lookups
    #[arg(long, global = true)]
    workflows_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a workflow definition and report every problem found
    Validate { workflow: PathBuf },
    /// Run a workflow from its start node
    Run {
        workflow: PathBuf,
        /// JSON array of input items
        #[arg(long)]
        input: Option<PathBuf>,
        /// Where to write the suspension token if the run waits (default: stdout)
        #[arg(long)]
        token_out: Option<PathBuf>,
    },
    /// Resume a suspended run from its token
    Resume {
        token: PathBuf,
        /// JSON array of items the suspended node emits (default: its input)
        #[arg(long)]
        payload: Option<PathBuf>,
        #[arg(long)]
        token_out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.workflows_dir {
        config.storage.workflows_dir = dir;
    }

    let engine = build_engine(&config).await;
    let status = match cli.command {
        Command::Validate { workflow } => {
            let workflow = read_workflow(&workflow).await?;
            match engine.validate(&workflow) {
                Ok(()) => {
                    println!("✅ Workflow '{}' is valid", workflow.id);
                    RunStatus::Success
                }
                Err(errors) => {
                    for error in errors.errors() {
                        println!("❌ {}", error);
                    }
                    RunStatus::Failed
                }
            }
        }
        Command::Run {
            workflow,
            input,
            token_out,
        } => {
            let workflow = read_workflow(&workflow).await?;
            let items = match input {
                Some(path) => Item::from_values(read_json(&path).await?),
                None => Vec::new(),
            };
            let result = engine.start_run(&workflow, items).await?;
            report(result, token_out.as_deref()).await?
        }
        Command::Resume {
            token,
            payload,
            token_out,
        } => {
            let text = tokio::fs::read_to_string(&token)
                .await
                .with_context(|| format!("Failed to read {}", token.display()))?;
            let token = SuspensionToken::from_json(&text)?;
            let payload = match payload {
                Some(path) => ResumePayload::items(Item::from_values(read_json(&path).await?)),
                None => ResumePayload::passthrough(),
            };
            let result = engine.resume_run(token, payload).await?;
            report(result, token_out.as_deref()).await?
        }
    };

    if matches!(status, RunStatus::Failed | RunStatus::Canceled) {
        std::process::exit(1);
    }
    Ok(())
}

async fn build_engine(config: &Config) -> ExecutionEngine {
    let registry = Arc::new(WorkflowRegistry::with_storage(WorkflowStorage::new(
        config.storage.workflows_dir.clone(),
    )));
    if let Err(e) = registry.init_from_storage().await {
        tracing::warn!("⚠️ Workflow directory not loaded: {:#}", e);
    }
    ExecutionEngine::builder(config.engine.clone()).workflows(registry).build()
}

async fn read_json(path: &Path) -> Result<Value> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid JSON in {}", path.display()))
}

async fn read_workflow(path: &Path) -> Result<Workflow> {
    let value = read_json(path).await?;
    serde_json::from_value(value).with_context(|| format!("Invalid workflow definition in {}", path.display()))
}

/// Print the report, or persist the token of a suspended run
async fn report(result: ExecutionResult, token_out: Option<&Path>) -> Result<RunStatus> {
    match result {
        ExecutionResult::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.status)
        }
        ExecutionResult::Suspended(token) => {
            let (workflow, node) = token.innermost();
            tracing::info!("⏸️ Run {} waiting at '{}' in '{}'", token.run_id, node, workflow);
            let json = token.to_json()?;
            match token_out {
                Some(path) => {
                    tokio::fs::write(path, json)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!("Token written to {}", path.display());
                }
                None => println!("{}", json),
            }
            Ok(RunStatus::Waiting)
        }
    }
}
