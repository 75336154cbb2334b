//! `pf` CLI entry-point.
//!
//! Sub-commands:
//! - `run create|get|list|archive|restore|show-details|show-metrics`
//! - `flow test` — run one line (or one node) without persisting a run.
//! - `flow validate` — parse and validate a flow definition.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use batch::{parent_run_sources, BatchEngine, BatchEngineConfig};
use db::entity::RunStatus;
use db::ops::ListViewType;
use db::{Config, Run, RunOperations};
use engine::{ExecutorConfig, FlowExecutor};
use nodes::{ConnectionProvider, FileConnectionProvider, ToolRegistry};
use storage::{DbCacheStorage, LocalStorageOperations};

#[derive(Parser)]
#[command(name = "pf", about = "Flow orchestration engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Batch run management.
    #[command(subcommand)]
    Run(RunCommand),
    /// Flow authoring helpers.
    #[command(subcommand)]
    Flow(FlowCommand),
}

#[derive(Subcommand)]
enum RunCommand {
    /// Create and execute a batch run.
    Create {
        #[arg(long)]
        flow: PathBuf,
        /// Input data file or directory, `alias=path` (repeatable;
        /// bare paths get the alias `data`).
        #[arg(long)]
        data: Vec<String>,
        /// Column mapping entries, `input=${data.column}` or literals.
        #[arg(long = "column-mapping")]
        column_mapping: Vec<String>,
        #[arg(long)]
        name: Option<String>,
        /// Variant selection, `node.variant_id`.
        #[arg(long)]
        variant: Option<String>,
        /// Parent run name for evaluation runs.
        #[arg(long)]
        run: Option<String>,
        #[arg(long, default_value_t = 4)]
        worker_count: usize,
        #[arg(long)]
        line_timeout_sec: Option<u64>,
    },
    /// Show a run record.
    Get { name: String },
    /// List runs, newest first.
    List {
        #[arg(long, default_value_t = 50)]
        max_results: usize,
        #[arg(long)]
        archived_only: bool,
        #[arg(long)]
        include_archived: bool,
    },
    /// Soft-archive a run.
    Archive { name: String },
    /// Restore an archived run.
    Restore { name: String },
    /// Print the per-line inputs/outputs table.
    ShowDetails { name: String },
    /// Print the run's metrics.
    ShowMetrics { name: String },
}

#[derive(Subcommand)]
enum FlowCommand {
    /// Execute one line (or one node) of a flow without creating a run.
    Test {
        #[arg(long)]
        flow: PathBuf,
        /// Flow inputs, `name=value` (values parse as JSON when possible).
        #[arg(long)]
        inputs: Vec<String>,
        /// Run a single node against its recorded defaults instead.
        #[arg(long)]
        node: Option<String>,
    },
    /// Validate a flow definition file.
    Validate {
        #[arg(long)]
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(command) => run_command(command).await,
        Command::Flow(command) => flow_command(command).await,
    }
}

async fn run_ops(config: &Config) -> anyhow::Result<RunOperations> {
    let pool = db::pool::create_pool(config.database_path.as_deref()).await?;
    db::pool::run_migrations(&pool).await?;
    Ok(RunOperations::new(pool))
}

fn load_connections() -> anyhow::Result<HashMap<String, nodes::Connection>> {
    Ok(FileConnectionProvider::from_env()?
        .map(|provider| provider.snapshot())
        .unwrap_or_default())
}

fn parse_pairs(pairs: &[String], what: &str) -> anyhow::Result<BTreeMap<String, Value>> {
    let mut parsed = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid {what} entry '{pair}', expected key=value");
        };
        let value = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        parsed.insert(key.to_string(), value);
    }
    Ok(parsed)
}

fn parse_data_args(data: &[String]) -> BTreeMap<String, PathBuf> {
    data.iter()
        .map(|entry| match entry.split_once('=') {
            Some((alias, path)) => (alias.to_string(), PathBuf::from(path)),
            None => ("data".to_string(), PathBuf::from(entry)),
        })
        .collect()
}

fn parse_variant(variant: &str) -> anyhow::Result<(String, String)> {
    let mut parts = variant.rsplitn(2, '.');
    let variant_id = parts.next().unwrap_or_default();
    let node = parts.next().unwrap_or_default();
    if node.is_empty() || variant_id.is_empty() {
        bail!("invalid variant '{variant}', expected node.variant_id");
    }
    Ok((node.to_string(), variant_id.to_string()))
}

async fn run_command(command: RunCommand) -> anyhow::Result<()> {
    let config = Config::default();
    let ops = run_ops(&config).await?;
    match command {
        RunCommand::Create {
            flow,
            data,
            column_mapping,
            name,
            variant,
            run,
            worker_count,
            line_timeout_sec,
        } => {
            let run_entity = Run::new(&flow, name, variant.clone(), run.clone(), &config)?;
            ops.create(&run_entity).await?;
            info!(run = %run_entity.name, "run created");

            let flow_definition = engine::Flow::load(flow.join("flow.dag.yaml"))?;
            let storage = Arc::new(LocalStorageOperations::new(&run_entity)?);
            let cache_storage = Arc::new(DbCacheStorage::new(ops.pool().clone()));
            let executor = FlowExecutor::create(
                flow_definition,
                &ToolRegistry::with_builtins(),
                &load_connections()?,
                storage.clone(),
                Some(cache_storage),
                ExecutorConfig {
                    node_concurrency: engine::scheduler::DEFAULT_CONCURRENCY_FLOW,
                    variant: variant.as_deref().map(parse_variant).transpose()?,
                },
            )?;

            let parent_sources = match &run {
                Some(parent_name) => {
                    let parent = ops.get(parent_name).await?;
                    let parent_storage = LocalStorageOperations::new(&parent)?;
                    parent_run_sources(&parent_storage)?
                }
                None => BTreeMap::new(),
            };

            let started = chrono::Utc::now();
            ops.update_lifecycle(
                &run_entity.name,
                RunStatus::RUNNING,
                Some(started),
                None,
                None,
            )
            .await?;

            let engine = BatchEngine::new(
                Arc::new(executor),
                storage.clone(),
                BatchEngineConfig {
                    worker_count,
                    line_timeout_sec,
                    max_lines: None,
                },
            );
            let mapping = parse_pairs(&column_mapping, "column mapping")?;
            let outcome = engine
                .run(
                    &run_entity.name,
                    &flow,
                    &parse_data_args(&data),
                    Some(&mapping),
                    parent_sources,
                )
                .await;

            let ended = chrono::Utc::now();
            match outcome {
                Ok(result) => {
                    let mut properties = run_entity.properties();
                    properties.insert(
                        "system_metrics".to_string(),
                        serde_json::to_value(&result.system_metrics)?,
                    );
                    ops.update_lifecycle(
                        &run_entity.name,
                        &result.status.to_string(),
                        Some(started),
                        Some(ended),
                        Some(&properties),
                    )
                    .await?;
                    println!(
                        "Run {} finished: {}/{} lines completed, {} failed.",
                        run_entity.name,
                        result.completed_lines,
                        result.total_lines,
                        result.failed_lines
                    );
                }
                Err(e) => {
                    ops.update_lifecycle(
                        &run_entity.name,
                        RunStatus::FAILED,
                        Some(started),
                        Some(ended),
                        None,
                    )
                    .await?;
                    bail!("run {} failed: {e}", run_entity.name);
                }
            }
        }
        RunCommand::Get { name } => {
            let run = ops.get(&name).await?;
            let storage = LocalStorageOperations::new(&run)?;
            let exception = storage.load_exception();
            println!("name:     {}", run.name);
            println!("status:   {}", run.status);
            println!("flow:     {}", run.flow.display());
            println!("output:   {}", run.output_path.display());
            if !exception.as_object().is_some_and(|m| m.is_empty()) {
                println!("error:    {exception}");
            }
        }
        RunCommand::List {
            max_results,
            archived_only,
            include_archived,
        } => {
            let view = if archived_only {
                ListViewType::ArchivedOnly
            } else if include_archived {
                ListViewType::All
            } else {
                ListViewType::ActiveOnly
            };
            for run in ops.list(max_results, view).await? {
                println!("{}\t{}\t{}", run.name, run.status, run.created_on);
            }
        }
        RunCommand::Archive { name } => {
            ops.archive(&name).await?;
            println!("Run {name} archived.");
        }
        RunCommand::Restore { name } => {
            ops.restore(&name).await?;
            println!("Run {name} restored.");
        }
        RunCommand::ShowDetails { name } => {
            let run = ops.get(&name).await?;
            let storage = LocalStorageOperations::new(&run)?;
            for row in storage.load_inputs_and_outputs()? {
                println!("{row}");
            }
        }
        RunCommand::ShowMetrics { name } => {
            let run = ops.get(&name).await?;
            let storage = LocalStorageOperations::new(&run)?;
            println!("{}", storage.load_metrics()?);
        }
    }
    Ok(())
}

async fn flow_command(command: FlowCommand) -> anyhow::Result<()> {
    match command {
        FlowCommand::Test { flow, inputs, node } => {
            let flow_definition = engine::Flow::load(flow.join("flow.dag.yaml"))?;
            let registry = ToolRegistry::with_builtins();
            let connections = load_connections()?;
            let inputs = parse_pairs(&inputs, "input")?;

            match node {
                Some(node_name) => {
                    let info = FlowExecutor::load_and_exec_node(
                        flow_definition,
                        &node_name,
                        &inputs,
                        &BTreeMap::new(),
                        &registry,
                        &connections,
                        Arc::new(engine::DummyRunStorage),
                    )
                    .await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                None => {
                    let executor = FlowExecutor::create(
                        flow_definition,
                        &registry,
                        &connections,
                        Arc::new(engine::DummyRunStorage),
                        None,
                        ExecutorConfig::default(),
                    )?;
                    let result = executor.exec_line(inputs, None, None).await;
                    println!("{}", serde_json::to_string_pretty(&result.run_info)?);
                }
            }
        }
        FlowCommand::Validate { flow } => {
            let path = if flow.is_dir() { flow.join("flow.dag.yaml") } else { flow };
            let flow_definition =
                engine::Flow::load(&path).with_context(|| format!("loading {}", path.display()))?;
            match engine::dag::validate_flow(&flow_definition) {
                Ok(()) => println!("Flow is valid ({} nodes).", flow_definition.nodes.len()),
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
