//! Kata Server
//!
//! Host binary for the workflow engine: runs the poll loop, the event
//! listener and the JSON API, plus one-shot subcommands for operators.

mod api;
mod settings;
mod skills;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kata_core::{
    BroadcastEventBus, EngineConfig, EventBus, KataDb, KataRegistry, KataStore, TaskEngine,
    TaskExecutor,
};
use serde_json::{Map, Value};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;

#[derive(Parser, Clone)]
#[command(author, version, about = "Kata - durable workflow engine")]
struct Args {
    /// Config file
    #[arg(long, global = true, default_value = settings::CONFIG_PATH)]
    config: PathBuf,
    /// SQLite database file (overrides config and KATA_DATABASE)
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the poll loop and the API server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Seconds between poll cycles
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Phase executions allowed to run at once
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Compile and register a kata file
    Register {
        /// Path to the DSL source
        file: PathBuf,
    },
    /// Spawn a task
    Spawn {
        name: String,
        version: u32,
        /// Initial variables as a JSON object
        #[arg(long)]
        vars: Option<String>,
    },
    /// Execute the current phase of one task
    Execute { task_id: String },
    /// Cancel a task
    Cancel { task_id: String },
    /// Run a single poll cycle
    Tick,
    /// List registered katas
    ListKatas,
}

struct Runtime {
    config: EngineConfig,
    bus: Arc<dyn EventBus>,
    registry: KataRegistry,
    engine: TaskEngine,
    executor: TaskExecutor,
}

impl Runtime {
    fn open(config: EngineConfig) -> anyhow::Result<Self> {
        let db = KataDb::open_at(&config.database_path)?;
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(config.event_bus_capacity));
        let skills = Arc::new(skills::builtin_skills());

        let registry = KataRegistry::new(KataStore::new(&db)).with_skill_check(skills.clone());
        let engine = TaskEngine::new(&db, bus.clone(), &config);
        let executor = TaskExecutor::new(engine.clone(), skills, config.clone());

        Ok(Self {
            config,
            bus,
            registry,
            engine,
            executor,
        })
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_server(runtime: Runtime, port: u16) -> anyhow::Result<()> {
    // Only this process drives the database, so any lease left behind
    // belongs to an execution that died with the previous process.
    runtime.engine.tasks().release_leases()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_handle = runtime.executor.listen_for_events(runtime.bus.clone());
    let poll_handle = {
        let executor = runtime.executor.clone();
        tokio::spawn(async move { executor.run(shutdown_rx).await })
    };

    let app = api::router(AppState {
        registry: runtime.registry.clone(),
        engine: runtime.engine.clone(),
        executor: runtime.executor.clone(),
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!(
        %addr,
        database = %runtime.config.database_path.display(),
        "Kata server listening"
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = poll_handle.await {
        tracing::warn!("Poll loop ended abnormally: {}", e);
    }
    listener_handle.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = settings::load(&args.config)?;
    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    if let Some(CliCommand::Serve {
        poll_interval,
        max_concurrent,
        ..
    }) = &args.command
    {
        if let Some(secs) = poll_interval {
            config.poll_interval_secs = *secs;
        }
        if let Some(n) = max_concurrent {
            config.max_concurrent_dispatch = *n;
        }
    }

    let runtime = Runtime::open(config)?;

    match args.command.unwrap_or(CliCommand::Serve {
        port: 8080,
        poll_interval: None,
        max_concurrent: None,
    }) {
        CliCommand::Serve { port, .. } => run_server(runtime, port).await,
        CliCommand::Register { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let kata = runtime.registry.register(&source)?;
            print_json(&kata)
        }
        CliCommand::Spawn {
            name,
            version,
            vars,
        } => {
            let variables = match vars {
                Some(raw) => Some(
                    serde_json::from_str::<Map<String, Value>>(&raw)
                        .context("--vars must be a JSON object")?,
                ),
                None => None,
            };
            let task = runtime.engine.spawn(&name, version, variables).await?;
            print_json(&task)
        }
        CliCommand::Execute { task_id } => {
            match runtime.executor.execute_phase(&task_id).await? {
                Some(result) => print_json(&result),
                None => {
                    println!("Task {} was not runnable", task_id);
                    Ok(())
                }
            }
        }
        CliCommand::Cancel { task_id } => {
            let task = runtime.engine.cancel(&task_id).await?;
            print_json(&task)
        }
        CliCommand::Tick => {
            let report = runtime.executor.poll_and_execute().await?;
            print_json(&report)
        }
        CliCommand::ListKatas => {
            for key in runtime.registry.list()? {
                println!("{}", key);
            }
            Ok(())
        }
    }
}
