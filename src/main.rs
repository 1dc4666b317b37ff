mod handlers;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::event::EventBus;
use weft_core::traits::{CheckpointStore, ContractRegistry};
use weft_core::types::{RunId, StepStatus};
use weft_graph::{NodeKind, WorkflowDescriptor};
use weft_engine::{
    Executor, HandlerRegistry, RunLogger, RunOptions, RunReport, SchemaContractRegistry,
    SqliteCheckpointStore,
};

use crate::handlers::ShellHandler;

#[derive(Parser)]
#[command(name = "weft", version, about = "Workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run {
        /// Workflow file (YAML, JSON or TOML)
        workflow: PathBuf,
        /// Workflow input as KEY=VALUE (VALUE is parsed as JSON when it can be)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Task description handed to the complexity classifier
        #[arg(long)]
        task: Option<String>,
        /// Simulate every step instead of running handlers
        #[arg(long)]
        dry_run: bool,
        /// Use this run id instead of a generated one
        #[arg(long)]
        run_id: Option<String>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume a run from its latest checkpoint
    Resume {
        workflow: PathBuf,
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Load and validate a workflow without running it
    Validate { workflow: PathBuf },
    /// Show the execution order of a workflow
    Plan { workflow: PathBuf },
    /// List runs that can be resumed
    Runs,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { workflow } => {
            let wf = WorkflowDescriptor::load(&workflow)?;
            let graph = wf.to_graph()?;
            println!(
                "{} ({}): {} steps, {} edges, ok",
                wf.id,
                wf.name,
                graph.nodes.len(),
                graph.edges.len()
            );
            Ok(())
        }
        Commands::Plan { workflow } => {
            let wf = WorkflowDescriptor::load(&workflow)?;
            print_plan(&wf)
        }
        Commands::Runs => {
            let store = SqliteCheckpointStore::open(&config.checkpoint_db_path())?;
            let runs = store.list_resumable()?;
            if runs.is_empty() {
                println!("No resumable runs.");
            }
            for run in runs {
                println!(
                    "{}  {:<20} last={:<16} checkpoints={:<4} {}",
                    run.run_id,
                    run.workflow_id,
                    run.last_stage,
                    run.checkpoints,
                    run.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            Ok(())
        }
        Commands::Run {
            workflow,
            inputs,
            task,
            dry_run,
            run_id,
            json,
        } => {
            let wf = WorkflowDescriptor::load(&workflow)?;
            let run_id = run_id.map(|s| RunId::from_string(&s)).unwrap_or_default();
            let mut options = RunOptions::new().with_run_id(run_id.clone());
            options.inputs = parse_inputs(&inputs)?;
            options.task = task;

            let (executor, event_bus) = build_executor(&config, dry_run)?;
            let report = execute(&config, event_bus, run_id, options, |opts| {
                executor.run(&wf, opts)
            })
            .await?;
            finish(&report, json)
        }
        Commands::Resume {
            workflow,
            run_id,
            json,
        } => {
            let wf = WorkflowDescriptor::load(&workflow)?;
            let run_id = RunId::from_string(&run_id);
            let (executor, event_bus) = build_executor(&config, false)?;
            let report = execute(&config, event_bus, run_id.clone(), RunOptions::new(), |opts| {
                executor.resume(&wf, &run_id, opts)
            })
            .await?;
            finish(&report, json)
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    let home = std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".weft").join("config.toml"));
    match home {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(&p)?)
        }
        _ => Ok(AppConfig::default()),
    }
}

fn parse_inputs(raw: &[String]) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    let mut inputs = HashMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("input '{}' is not KEY=VALUE", item))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}

fn build_executor(config: &AppConfig, dry_run: bool) -> anyhow::Result<(Executor, Arc<EventBus>)> {
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace).ok();

    let mut handlers = HandlerRegistry::new();
    handlers.register(NodeKind::Shell.as_str(), ShellHandler);

    let event_bus = Arc::new(EventBus::default());
    let mut builder = Executor::builder(handlers)
        .config(config.clone())
        .event_bus(event_bus.clone())
        .dry_run(dry_run);

    if config.checkpoint.enabled {
        let store: Arc<dyn CheckpointStore> =
            Arc::new(SqliteCheckpointStore::open(&config.checkpoint_db_path())?);
        builder = builder.checkpoint_store(store);
    }
    if !config.contracts.files.is_empty() || config.contracts.dir.is_some() {
        let registry = SchemaContractRegistry::from_config(&config.contracts)?;
        info!(roles = registry.len(), "Loaded role contracts");
        let registry: Arc<dyn ContractRegistry> = Arc::new(registry);
        builder = builder.contracts(registry);
    }
    Ok((builder.build(), event_bus))
}

/// Run with Ctrl-C cancellation and, when enabled, a JSONL run log.
async fn execute<F, Fut>(
    config: &AppConfig,
    event_bus: Arc<EventBus>,
    run_id: RunId,
    mut options: RunOptions,
    start: F,
) -> anyhow::Result<RunReport>
where
    F: FnOnce(RunOptions) -> Fut,
    Fut: std::future::Future<Output = weft_core::error::Result<RunReport>>,
{
    let cancel = CancellationToken::new();
    options.cancel = Some(cancel.clone());

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, cancelling run");
        ctrl_c.cancel();
    });

    let log_task = config.log.enabled.then(|| {
        let logger = RunLogger::new(config.log_dir(), config.log.level);
        tokio::spawn(logger.run(event_bus, run_id, CancellationToken::new()))
    });
    // Let the logger subscribe before the first event.
    tokio::task::yield_now().await;

    let report = start(options).await?;
    if let Some(task) = log_task {
        task.await.ok();
    }
    Ok(report)
}

fn print_plan(wf: &WorkflowDescriptor) -> anyhow::Result<()> {
    let graph = wf.to_graph()?;
    let walker = graph.walker();
    println!("{} ({})", wf.id, wf.name);
    for (i, id) in walker.execution_order()?.iter().enumerate() {
        let Some(node) = walker.node(id) else {
            continue;
        };
        let deps: Vec<String> = graph
            .edges
            .iter()
            .filter(|e| &e.target == id && !walker.is_back_edge(e))
            .map(|e| match e.handle() {
                Some(h) => format!("{}:{}", e.source, h),
                None => e.source.clone(),
            })
            .collect();
        let mut line = format!("{:>3}. {} [{}]", i + 1, id, node.kind);
        if !deps.is_empty() {
            line.push_str(&format!(" <- {}", deps.join(", ")));
        }
        if let Some(role) = &node.data.agent_role {
            line.push_str(&format!(" role={}", role));
        }
        if node.kind == NodeKind::Loop {
            line.push_str(&format!(" body=[{}]", walker.loop_body(id).join(", ")));
        }
        println!("{}", line);
    }
    Ok(())
}

fn finish(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!(
            "Run {} [{}] {} in {}ms (tokens: {}, cost: ${:.4})",
            report.run_id,
            report.workflow_id,
            report.status,
            report.duration_ms,
            report.usage.tokens,
            report.usage.cost
        );
        for result in &report.results {
            let marker = match result.status {
                StepStatus::Success => "ok",
                StepStatus::Skipped => "skip",
                StepStatus::Failed => "FAIL",
                StepStatus::Cancelled => "cancel",
                _ => "?",
            };
            let note = result
                .error
                .as_deref()
                .or(result.reason.as_deref())
                .unwrap_or_default();
            println!("  {:<6} {:<24} {:>6}ms  {}", marker, result.step_id, result.duration_ms, note);
        }
        if !report.unreachable.is_empty() {
            println!("  unreachable: {}", report.unreachable.join(", "));
        }
        for (key, value) in &report.outputs {
            println!("  output {} = {}", key, value);
        }
    }
    if !report.is_success() {
        anyhow::bail!("run {} {}", report.run_id, report.status);
    }
    Ok(())
}
