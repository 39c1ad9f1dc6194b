//! `coordinator` binary: parses a DAG file, optionally replays a rescue
//! file, listens for worker registrations, and drives the scheduling loop
//! (SPEC §6 "Coordinator CLI").

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use wrangler_core::coordinator::{Coordinator, CoordinatorConfig};
use wrangler_core::dag::{parse_dag_file, read_rescue, Dag};
use wrangler_core::engine::Engine;
use wrangler_core::fdcache::FdCache;
use wrangler_core::listeners::{DagManLog, JobstateLog, WorkflowEventListener};
use wrangler_core::resource::ResourcePool;
use wrangler_core::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "coordinator")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    dag_file: PathBuf,

    #[arg(long, env = "WRANGLER_NUMWORKERS")]
    numworkers: u32,

    #[arg(long)]
    rescue: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    max_retries: u32,

    #[arg(long, env = "WRANGLER_MAX_WALL_TIME")]
    max_wall_time: Option<u64>,

    #[arg(long, env = "WRANGLER_MAXFDS", default_value_t = 0)]
    maxfds: usize,

    #[arg(long)]
    jobstate_log: Option<PathBuf>,

    #[arg(long)]
    dagman_log: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:9797")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let CliCommand::Run(args) = cli.command;

    if let Err(e) = run(args).await {
        error!(error = %e, "coordinator exited with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let rescue_path = args
        .rescue
        .unwrap_or_else(|| args.dag_file.with_extension("rescue"));

    let tasks = parse_dag_file(&args.dag_file, args.max_retries)?;
    let rescued = read_rescue(&rescue_path)?;
    let dag = Dag::new(tasks, args.max_retries, &rescued)?;

    let mut listeners: Vec<Box<dyn WorkflowEventListener>> = Vec::new();
    if let Some(path) = args.jobstate_log {
        listeners.push(Box::new(JobstateLog::new(path)));
    }
    if let Some(path) = args.dagman_log {
        listeners.push(Box::new(DagManLog::new(path)));
    }

    let engine = Engine::new(dag, ResourcePool::new(), listeners);
    let fdcache = FdCache::new(args.maxfds)?;

    let mut transport = TcpTransport::bind(&args.listen).await?;
    transport.accept_registrations(args.numworkers).await?;

    let config = CoordinatorConfig {
        numworkers: args.numworkers,
        rescue_path,
        max_wall_time: args.max_wall_time.map(Duration::from_secs),
    };

    let mut coordinator = Coordinator::new(transport, engine, fdcache, config);
    coordinator.run_registration().await?;
    coordinator.run_scheduling().await?;
    Ok(())
}
