use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::checkpoint::json_store::JsonCheckpointStore;
use crate::engine::types::{Context, EngineConfig, StageProgress, WorkflowType};
use crate::orchestrator::{Orchestrator, OrchestratorResponse};

#[derive(Parser)]
#[command(name = "stageflow", version, about = "Workflow orchestration core")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Engine limits, overridable per invocation.
#[derive(Args)]
pub struct EngineOpts {
    /// Persist a checkpoint every N completed stages
    #[arg(long, env = "STAGEFLOW_CHECKPOINT_INTERVAL")]
    checkpoint_interval: Option<u32>,

    /// Hard ceiling on stage executions per run
    #[arg(long, env = "STAGEFLOW_MAX_ITERATIONS")]
    max_iterations: Option<u32>,

    /// Per-stage timeout in seconds
    #[arg(long, env = "STAGEFLOW_STAGE_TIMEOUT")]
    stage_timeout: Option<f64>,

    /// Whole-run timeout in seconds
    #[arg(long, env = "STAGEFLOW_WORKFLOW_TIMEOUT")]
    workflow_timeout: Option<f64>,

    /// Retries per stage after the first failed attempt
    #[arg(long, env = "STAGEFLOW_MAX_RETRIES")]
    max_retries: Option<u32>,
}

impl EngineOpts {
    fn into_config(self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(v) = self.checkpoint_interval {
            config.checkpoint_interval = v;
        }
        if let Some(v) = self.max_iterations {
            config.max_iterations = v;
        }
        if let Some(v) = self.stage_timeout {
            config.stage_timeout_s = v;
        }
        if let Some(v) = self.workflow_timeout {
            config.workflow_timeout_s = v;
        }
        if let Some(v) = self.max_retries {
            config.max_stage_retries = v;
        }
        config
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process a request through the orchestrator
    Process {
        /// The request text
        request: String,

        /// Caller context as a JSON object
        #[arg(short, long)]
        context: Option<String>,

        /// Skip classification and force a workflow type
        #[arg(short = 't', long)]
        workflow_type: Option<String>,

        /// Print each stage result as it completes
        #[arg(short, long)]
        verbose: bool,

        /// Checkpoint store directory
        #[arg(long, default_value = "data/checkpoints")]
        store_dir: PathBuf,

        #[command(flatten)]
        engine: EngineOpts,
    },

    /// Resume a suspended session from its checkpoint
    Resume {
        /// Session ID
        session_id: String,

        /// Checkpoint store directory
        #[arg(long, default_value = "data/checkpoints")]
        store_dir: PathBuf,

        #[command(flatten)]
        engine: EngineOpts,
    },

    /// Show the status of a session
    Status {
        /// Session ID
        session_id: String,

        /// Checkpoint store directory
        #[arg(long, default_value = "data/checkpoints")]
        store_dir: PathBuf,
    },

    /// List workflow types and their stage sequences
    Types,

    /// List registered stage handlers
    Stages,

    /// Remove checkpoints older than the given age
    Cleanup {
        /// Age threshold in hours
        #[arg(long, default_value = "24")]
        max_age_hours: f64,

        /// Checkpoint store directory
        #[arg(long, default_value = "data/checkpoints")]
        store_dir: PathBuf,
    },

    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0", env = "HOST")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,

        /// Checkpoint store directory
        #[arg(long, default_value = "data/checkpoints", env = "STORE_DIR")]
        store_dir: PathBuf,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, default_value = "1048576", env = "MAX_BODY")]
        max_body: usize,

        #[command(flatten)]
        engine: EngineOpts,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    match cli.command {
        Commands::Process {
            request,
            context,
            workflow_type,
            verbose,
            store_dir,
            engine,
        } => cmd_process(request, context, workflow_type, verbose, store_dir, engine).await,
        Commands::Resume {
            session_id,
            store_dir,
            engine,
        } => cmd_resume(session_id, store_dir, engine).await,
        Commands::Status {
            session_id,
            store_dir,
        } => cmd_status(session_id, store_dir).await,
        Commands::Types => cmd_types(),
        Commands::Stages => cmd_stages(),
        Commands::Cleanup {
            max_age_hours,
            store_dir,
        } => cmd_cleanup(max_age_hours, store_dir).await,
        Commands::Serve {
            host,
            port,
            store_dir,
            max_body,
            engine,
        } => crate::api::serve(&host, port, store_dir, max_body, engine.into_config()).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found — that's fine, silently skip
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn cmd_process(
    request: String,
    context_json: Option<String>,
    workflow_type: Option<String>,
    verbose: bool,
    store_dir: PathBuf,
    engine: EngineOpts,
) -> Result<()> {
    let hint = workflow_type
        .as_deref()
        .map(|s| {
            s.parse::<WorkflowType>()
                .map_err(|e| anyhow::anyhow!(e))
        })
        .transpose()?;

    let context: Context = match context_json {
        Some(json) => {
            serde_json::from_str(&json).with_context(|| "Failed to parse --context JSON")?
        }
        None => Context::new(),
    };

    let store = Arc::new(JsonCheckpointStore::new(store_dir));
    let mut orchestrator = Orchestrator::builtin(store, engine.into_config())?;

    // Stream stage results to the terminal as they land
    let printer = if verbose {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StageProgress>();
        orchestrator = orchestrator.with_progress(tx);
        Some(tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                println!("  [{}] iteration {}", update.stage, update.iteration);
            }
        }))
    } else {
        None
    };

    let response = orchestrator.process(&request, context, hint).await;

    if let Some(printer) = printer {
        // Dropping the orchestrator closes the progress channel
        drop(orchestrator);
        let _ = printer.await;
    }
    print_response(&response, verbose);

    Ok(())
}

fn print_response(response: &OrchestratorResponse, verbose: bool) {
    println!("Tier: {}", response.tier);
    if let Some(wt) = response.workflow_type {
        println!("Workflow: {}", wt);
    }
    if let Some(ref session_id) = response.session_id {
        println!("Session: {}", session_id);
    }
    if let Some(status) = response.status {
        println!("Status: {}", status);
    }
    if let Some(ref error) = response.error {
        println!("Degraded: {}", error);
    }

    if !response.stage_results.is_empty() {
        let mut names: Vec<&String> = response.stage_results.keys().collect();
        names.sort();
        println!("\nStages:");
        for name in names {
            if verbose {
                println!("  {} → {}", name, response.stage_results[name]);
            } else {
                println!("  {}", name);
            }
        }
    }

    println!("\n{}", response.response);
}

async fn cmd_resume(session_id: String, store_dir: PathBuf, engine: EngineOpts) -> Result<()> {
    let store = Arc::new(JsonCheckpointStore::new(store_dir));
    let orchestrator = Orchestrator::builtin(store, engine.into_config())?;

    let response = orchestrator.resume(&session_id).await;
    print_response(&response, false);

    Ok(())
}

async fn cmd_status(session_id: String, store_dir: PathBuf) -> Result<()> {
    let store = Arc::new(JsonCheckpointStore::new(store_dir));
    let orchestrator = Orchestrator::builtin(store, EngineConfig::default())?;

    match orchestrator.session_status(&session_id).await {
        Some(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        None => anyhow::bail!("Unknown session '{}'", session_id),
    }
}

fn cmd_types() -> Result<()> {
    let store = Arc::new(crate::checkpoint::memory_store::MemoryCheckpointStore::new());
    let orchestrator = Orchestrator::builtin(store, EngineConfig::default())?;

    println!("{:<12} STAGES", "WORKFLOW");
    println!("{}", "-".repeat(72));

    for workflow_type in orchestrator.workflow_types() {
        let graph = orchestrator.graphs().resolve(workflow_type)?;
        println!("{:<12} {}", workflow_type, graph.stages().join(" -> "));
    }

    Ok(())
}

fn cmd_stages() -> Result<()> {
    let registry = crate::stages::StageRegistry::with_builtins();
    let stages = registry.list();

    println!("{:<24} DESCRIPTION", "STAGE");
    println!("{}", "-".repeat(72));

    for (name, description) in &stages {
        println!("{:<24} {}", name, description);
    }

    println!("\nTotal: {} stage(s)", stages.len());
    Ok(())
}

async fn cmd_cleanup(max_age_hours: f64, store_dir: PathBuf) -> Result<()> {
    let store = JsonCheckpointStore::new(store_dir);
    let removed = store.cleanup(max_age_hours).await?;

    println!("Removed {} stale checkpoint(s)", removed);
    Ok(())
}
