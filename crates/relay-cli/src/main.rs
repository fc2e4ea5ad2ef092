use anyhow::Context as _;
use clap::{Parser, Subcommand};
use relay_cli::{agents, logging};
use relay_core::TaskState;
use relay_orchestrator::{Coordinator, RelayConfig, SubmitRequest};
use relay_store::{open_backend, BackendKind};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "relay", version, about = "Relay: named-agent task coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Use a durable file store at this path (overrides config)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Emit logs as JSON (overrides config)
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one task and wait for its outcome
    Run {
        /// Agent name
        agent: String,
        /// Task description, sent as {"task": ...}
        task: String,
        /// Explicit task id
        #[arg(long)]
        task_id: Option<String>,
        /// Raw JSON payload (replaces the task description)
        #[arg(long)]
        payload: Option<String>,
    },
    /// List agents with their load and metrics
    Agents,
    /// Run the research-to-monitoring agent chain in order
    Pipeline {
        /// Topic handed to every stage
        topic: String,
    },
    /// Show a task record and its state history
    Status { task_id: String },
    /// Read or write shared context
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum ContextAction {
    Get {
        key: String,
    },
    Set {
        key: String,
        /// JSON value; anything that does not parse is stored as a string
        value: String,
        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    Delete {
        key: String,
    },
    /// Read a list written with append
    List {
        key: String,
    },
}

async fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
        RelayConfig::load(&cli.config).await?
    } else {
        RelayConfig::default()
    };
    if let Some(path) = &cli.store {
        config.store.kind = BackendKind::File;
        config.store.path = Some(path.clone());
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    logging::init(&config.logging);

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let backend = open_backend(&config.store)
        .await
        .context("Failed to open store")?;
    let registry = agents::demo_registry(&config)?;
    let coordinator = Coordinator::new(registry, backend, config);
    coordinator.start().await?;
    info!(agents = coordinator.list_agents().len(), "Coordinator ready");

    let outcome = run_command(&coordinator, cli.command).await;
    coordinator.shutdown();
    outcome
}

async fn run_command(coordinator: &Coordinator, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            agent,
            task,
            task_id,
            payload,
        } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload is not valid JSON")?,
                None => json!({ "task": task }),
            };
            let mut request = SubmitRequest::new(agent, payload);
            request.task_id = task_id;
            let record = coordinator.submit(request).await?;
            print_json(&record)?;
            if record.state == TaskState::Failed {
                anyhow::bail!("task {} failed", record.task_id);
            }
        }
        Commands::Agents => {
            let loads = coordinator.list_agents();
            let stats = coordinator.stats_json().await;
            print_json(&json!({ "agents": loads, "stats": stats }))?;
        }
        Commands::Pipeline { topic } => {
            let mut stages = Vec::new();
            for agent in agents::PIPELINE {
                let record = coordinator
                    .submit(SubmitRequest::new(agent, json!({ "task": topic })))
                    .await?;
                let failed = record.state == TaskState::Failed;
                info!(agent, task_id = %record.task_id, state = %record.state, "Pipeline stage finished");
                stages.push(record);
                if failed {
                    print_json(&stages)?;
                    anyhow::bail!("pipeline stopped at '{agent}'");
                }
            }
            print_json(&stages)?;
        }
        Commands::Status { task_id } => {
            let record = coordinator.get_status(&task_id).await?;
            let history = coordinator.history(&task_id).await?;
            print_json(&json!({ "record": record, "history": history }))?;
        }
        Commands::Context { action } => match action {
            ContextAction::Get { key } => {
                let value = coordinator.get_context(&key).await?;
                print_json(&value)?;
            }
            ContextAction::Set { key, value, ttl } => {
                coordinator
                    .set_context(&key, parse_value(&value), ttl.map(Duration::from_secs))
                    .await?;
                print_json(&json!({ "status": "ok", "key": key }))?;
            }
            ContextAction::Delete { key } => {
                coordinator.delete_context(&key).await?;
                print_json(&json!({ "status": "deleted", "key": key }))?;
            }
            ContextAction::List { key } => {
                let items = coordinator.context().get_list(&key).await?;
                print_json(&items)?;
            }
        },
        Commands::Config => {}
    }
    Ok(())
}
