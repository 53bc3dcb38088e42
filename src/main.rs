//! # testout
//!
//! One binary, three roles:
//!
//! - `testout server`: hosts the message bus and schedules invocations.
//! - `testout agent`: runs batches of tests on this machine with N workers.
//! - `testout run <binary>`: invokes a test binary across the agents and writes results.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use testout::agent::host::AgentHost;
use testout::bus::MessageBus;
use testout::bus::client::HttpBusClient;
use testout::config::*;
use testout::invoker::invocation::Invoker;
use testout::invoker::serializer::JsonResultSerializer;
use testout::runner::libtest::LibtestRunner;
use testout::server::host::ServerHost;

/// Distributed test runner
#[derive(Parser)]
#[command(name = "testout")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "TESTOUT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling server
    Server(ServerArgs),
    /// Run an agent that executes test batches
    Agent(AgentArgs),
    /// Run a test binary across the connected agents
    Run(RunArgs),
}

#[derive(Args)]
struct WorkArgs {
    /// Root folder for per-run workspaces
    #[arg(long, env = "TESTOUT_WORKING_FOLDER", default_value = "./testout-work")]
    working_folder: PathBuf,

    /// Upper bound on one folder transfer, in seconds
    #[arg(long, env = "TESTOUT_TRANSFER_TIMEOUT", default_value_t = 600)]
    transfer_timeout: u64,
}

impl WorkArgs {
    fn config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            working_folder: self.working_folder.clone(),
            transfer_timeout: Duration::from_secs(self.transfer_timeout),
        }
    }
}

#[derive(Args)]
struct ServerArgs {
    /// Address the bus server listens on
    #[arg(long, env = "TESTOUT_BIND", default_value = "0.0.0.0:34872")]
    bind: SocketAddr,

    /// Maximum tests handed to one agent at a time
    #[arg(long, env = "TESTOUT_BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,

    /// Folder holding stats.json
    #[arg(long, env = "TESTOUT_STATE_FOLDER", default_value = "./testout-state")]
    state_folder: PathBuf,

    #[command(flatten)]
    work: WorkArgs,
}

#[derive(Args)]
struct AgentArgs {
    /// Bus server url
    #[arg(long, env = "TESTOUT_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    server_url: String,

    /// Agent name; a uuid is used when absent
    #[arg(long, env = "TESTOUT_AGENT_NAME")]
    name: Option<String>,

    /// Worker count; defaults to the number of CPUs
    #[arg(long, env = "TESTOUT_MAX_WORKERS")]
    max_workers: Option<usize>,

    #[command(flatten)]
    work: WorkArgs,
}

#[derive(Args)]
struct RunArgs {
    /// Test binary to run, e.g. target/debug/deps/mycrate-1234abcd
    test_assembly_path: PathBuf,

    /// Folder shipped to the server; defaults to the binary's folder
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Bus server url
    #[arg(long, env = "TESTOUT_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    server_url: String,

    /// Where the JSON results are written
    #[arg(long, default_value = "testout-results.json")]
    result_filename: PathBuf,

    /// Extra attempts for a failing test
    #[arg(long, default_value_t = 2)]
    max_retry_count: u32,

    /// Seconds without test activity before a batch is failed
    #[arg(long, default_value_t = 1200)]
    test_inactivity_timeout_seconds: u64,

    /// Seconds to wait for the server after losing the connection
    #[arg(long, default_value_t = 120)]
    reconnect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    testout::init_logging(level)?;

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
        Commands::Run(args) => run_invocation(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<ExitCode> {
    let config = ServerConfig {
        bind_addr: args.bind,
        batch_size: args.batch_size,
        ..ServerConfig::default()
    };
    let host = ServerHost::start(
        config,
        ServerConnectionConfig::default(),
        args.work.config(),
        StorageConfig {
            state_folder: args.state_folder,
        },
        Arc::new(LibtestRunner::new()),
    )
    .await?;

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    host.stop().await;
    Ok(ExitCode::SUCCESS)
}

async fn run_agent(args: AgentArgs) -> Result<ExitCode> {
    let host = AgentHost::start(
        AgentConfig {
            name: args.name,
            max_workers: args.max_workers,
        },
        ServerConnectionConfig::new(args.server_url),
        args.work.config(),
        Arc::new(LibtestRunner::new()),
    )
    .await?;

    tracing::info!("Agent workers {:?} started", host.agent_ids());
    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    host.stop().await;
    Ok(ExitCode::SUCCESS)
}

async fn run_invocation(args: RunArgs) -> Result<ExitCode> {
    let connection = ServerConnectionConfig::new(args.server_url);
    let client = HttpBusClient::new(connection.clone());
    let invoker = Invoker::new(
        InvokerConfig {
            test_assembly_path: args.test_assembly_path,
            base_path: args.base_path,
            result_filename: args.result_filename,
            max_retry_count: args.max_retry_count,
            test_inactivity_timeout_seconds: args.test_inactivity_timeout_seconds,
            reconnect_timeout: Duration::from_secs(args.reconnect_timeout),
        },
        connection,
        &WorkspaceConfig::default(),
        client.clone(),
        Arc::new(JsonResultSerializer),
    );

    let outcome = invoker.run().await;
    client.shutdown().await;

    if outcome?.wrote_results() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
