use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use enginepool_worker::config::{
    EngineConfig, LeaseConfig, LogConfig, LogFormat, RetryConfig, StoreConfig, WorkerConfig,
};
use enginepool_worker::engine::ProcessLauncher;
use enginepool_worker::error::WorkerError;
use enginepool_worker::lease::{format_timestamp, LeaseRecord, WorkerId};
use enginepool_worker::store::{connect_with_retry, LeaseStore, RedisConnector};
use enginepool_worker::worker::WorkerController;

#[derive(Parser, Debug)]
#[command(name = "enginepool-worker")]
#[command(version)]
#[command(about = "Automation engine worker with a Redis-backed liveness lease")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Launch an engine and keep its lease alive until recycled or signalled
    Run(RunArgs),

    /// Inspect or recycle lease records
    Lease {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: LeaseCommands,
    },
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Prefix of lease keys
    #[arg(long, env = "LEASE_KEY_PREFIX", default_value = "worker:")]
    key_prefix: String,

    /// Connection attempts before giving up
    #[arg(long, env = "CONNECT_ATTEMPTS", default_value = "3")]
    connect_attempts: u32,

    /// Timeout for a single connect + PING attempt
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "5000")]
    connect_timeout_ms: u64,

    /// Pause between failed connection attempts
    #[arg(long, env = "CONNECT_DELAY_MS", default_value = "1000")]
    connect_delay_ms: u64,
}

impl StoreArgs {
    fn to_config(&self) -> StoreConfig {
        StoreConfig {
            url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            retry: RetryConfig {
                attempts: self.connect_attempts,
                timeout_ms: self.connect_timeout_ms,
                delay_ms: self.connect_delay_ms,
            },
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Lease TTL, refreshed by every heartbeat
    #[arg(long, env = "LEASE_TTL_SECS", default_value = "30")]
    lease_ttl_secs: u64,

    /// TTL left on the lease once shutdown begins
    #[arg(long, env = "TERMINAL_TTL_SECS", default_value = "5")]
    terminal_ttl_secs: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value = "10000")]
    heartbeat_interval_ms: u64,

    /// Port the engine listens on
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Run the engine headless
    #[arg(long, env = "HEADLESS", default_value_t = true, action = clap::ArgAction::Set)]
    headless: bool,

    /// Hostname advertised in place of a loopback host
    #[arg(long, env = "PRIVATE_HOSTNAME")]
    private_hostname: Option<String>,

    /// Engine program
    #[arg(long, env = "ENGINE_COMMAND", default_value = "npx")]
    engine_command: String,

    /// Engine argument, placed before the generated flags (repeatable)
    #[arg(
        long = "engine-arg",
        default_values = ["playwright", "run-server"],
        allow_hyphen_values = true
    )]
    engine_args: Vec<String>,

    /// How long the engine may take to advertise its endpoint
    #[arg(long, env = "ENGINE_STARTUP_TIMEOUT_MS", default_value = "30000")]
    engine_startup_timeout_ms: u64,

    /// Wait after SIGTERM before the engine is killed
    #[arg(long, env = "ENGINE_CLOSE_GRACE_MS", default_value = "10000")]
    engine_close_grace_ms: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl RunArgs {
    fn into_config(self) -> WorkerConfig {
        WorkerConfig {
            store: self.store.to_config(),
            lease: LeaseConfig {
                ttl_secs: self.lease_ttl_secs,
                terminal_ttl_secs: self.terminal_ttl_secs,
                heartbeat_interval_ms: self.heartbeat_interval_ms,
            },
            engine: EngineConfig {
                command: self.engine_command,
                args: self.engine_args,
                port: self.port,
                headless: self.headless,
                private_hostname: self.private_hostname,
                startup_timeout_ms: self.engine_startup_timeout_ms,
                close_grace_ms: self.engine_close_grace_ms,
            },
            log: LogConfig {
                level: self.log_level,
                format: self.log_format,
            },
        }
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum LeaseCommands {
    /// List every lease record
    List,
    /// Show one worker's lease record
    Show {
        /// The worker ID (UUID)
        worker_id: String,
    },
    /// Ask a worker to retire by writing status=recycling
    Recycle {
        /// The worker ID (UUID)
        worker_id: String,
    },
}

#[derive(Serialize)]
struct LeaseListOutput {
    leases: Vec<LeaseRecord>,
    total_count: usize,
}

#[derive(Serialize)]
struct RecycleOutput {
    worker_id: String,
    recycling: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn print_record(record: &LeaseRecord) {
    println!("Worker ID:      {}", record.id);
    println!("Status:         {}", record.status);
    println!("Endpoint:       {}", record.endpoint);
    println!("Started At:     {}", format_timestamp(&record.started_at));
    println!("Last Heartbeat: {}", format_timestamp(&record.last_heartbeat));
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();
    init_logging(&config.log);
    config.validate()?;

    tracing::info!(
        redis_url = %config.store.url,
        port = config.engine.port,
        headless = config.engine.headless,
        heartbeat_interval_ms = config.lease.heartbeat_interval_ms,
        lease_ttl_secs = config.lease.ttl_secs,
        "Worker configuration loaded"
    );

    let connector = Arc::new(RedisConnector::new(&config.store));
    let launcher = Arc::new(ProcessLauncher::new(config.engine.clone()));
    let controller = WorkerController::new(config, connector, launcher);

    let exit = controller.run().await;
    std::process::exit(exit.code);
}

// =============================================================================
// Lease Commands
// =============================================================================

async fn connect_store(args: &StoreArgs) -> Result<Arc<dyn LeaseStore>, Box<dyn std::error::Error>> {
    let config = args.to_config();
    let connector = RedisConnector::new(&config);
    Ok(connect_with_retry(&connector, &config.retry).await?)
}

async fn handle_lease_list(
    store: &dyn LeaseStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut leases = store.list().await?;
    leases.sort_by(|a, b| a.started_at.cmp(&b.started_at));

    match output_format {
        OutputFormat::Json => {
            let output = LeaseListOutput {
                total_count: leases.len(),
                leases,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if leases.is_empty() {
                println!("No leases found.");
            } else {
                println!(
                    "{:<38} {:<14} {:<26} ENDPOINT",
                    "WORKER ID", "STATUS", "LAST HEARTBEAT"
                );
                println!("{}", "-".repeat(100));
                for lease in &leases {
                    println!(
                        "{:<38} {:<14} {:<26} {}",
                        lease.id,
                        lease.status,
                        format_timestamp(&lease.last_heartbeat),
                        lease.endpoint
                    );
                }
                println!();
                println!("{} lease(s)", leases.len());
            }
        }
    }
    Ok(())
}

async fn handle_lease_show(
    store: &dyn LeaseStore,
    worker_id: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let id: WorkerId = worker_id.parse()?;
    let record = store
        .fetch(&id)
        .await?
        .ok_or_else(|| WorkerError::LeaseNotFound(id.to_string()))?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Table => print_record(&record),
    }
    Ok(())
}

async fn handle_lease_recycle(
    store: &dyn LeaseStore,
    worker_id: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let id: WorkerId = worker_id.parse()?;
    if !store.request_recycle(&id).await? {
        return Err(WorkerError::LeaseNotFound(id.to_string()).into());
    }

    match output_format {
        OutputFormat::Json => {
            let output = RecycleOutput {
                worker_id: id.to_string(),
                recycling: true,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => println!("Worker {} marked for recycling", id),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_worker(run_args).await?;
        }
        Commands::Lease { client, command } => {
            init_logging(&LogConfig {
                level: "warn".to_string(),
                format: LogFormat::Text,
            });
            let store = connect_store(&client.store).await?;

            let result = match command {
                LeaseCommands::List => handle_lease_list(store.as_ref(), &client.output).await,
                LeaseCommands::Show { worker_id } => {
                    handle_lease_show(store.as_ref(), &worker_id, &client.output).await
                }
                LeaseCommands::Recycle { worker_id } => {
                    handle_lease_recycle(store.as_ref(), &worker_id, &client.output).await
                }
            };

            store.close().await?;
            result?;
        }
    }

    Ok(())
}
