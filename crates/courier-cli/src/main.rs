use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use courier_core::config::WorkerConfig;
use courier_core::domain::{MessageId, Payload, StoreError, WorkerId};
use courier_core::impls::{LogTransport, SpoolTransport};
use courier_core::observability::init_tracing;
use courier_core::queue::{DEFAULT_MAX_ATTEMPTS, LeasePolicy, RetryPolicy, SqliteMessageStore};
use courier_core::{MessageStore, Transport, WorkerGroup};
use tracing::info;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Cluster-wide outbound message queue")]
struct Cli {
    /// SQLite database shared by every worker process
    #[arg(long, env = "COURIER_DATABASE_URL", default_value = "sqlite://courier.db")]
    database_url: String,

    /// Retry budget per message; must match across the cluster
    #[arg(long, env = "COURIER_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Treat claims older than this as abandoned (0 = claims never expire)
    #[arg(long, env = "COURIER_LEASE_TIMEOUT_SECS", default_value_t = 0)]
    lease_timeout_secs: u64,

    /// Emit JSON logs
    #[arg(long, env = "COURIER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a message and print its id
    Enqueue {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        /// Message body; read from stdin when omitted
        #[arg(long)]
        body: Option<String>,

        /// Send the body as HTML instead of plain text
        #[arg(long)]
        html: bool,
    },
    /// Run delivery workers until ctrl-c
    Work {
        /// Worker identities are `<prefix>-0 .. <prefix>-(n-1)`; keep prefixes unique per host
        #[arg(long, env = "COURIER_WORKER_PREFIX", default_value = "courier")]
        worker_prefix: String,

        #[arg(long, env = "COURIER_WORKERS", default_value_t = 1)]
        workers: usize,

        #[arg(long, env = "COURIER_BATCH_SIZE", default_value_t = courier_core::config::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        #[arg(long, env = "COURIER_SWEEP_INTERVAL_MS", default_value_t = 5000)]
        sweep_interval_ms: u64,

        #[arg(long, value_enum, default_value_t = TransportKind::Log)]
        transport: TransportKind,

        /// Output directory for the spool transport
        #[arg(long, env = "COURIER_SPOOL_DIR", default_value = "spool")]
        spool_dir: PathBuf,
    },
    /// Print message counts per state as JSON
    Status,
    /// Print one message as JSON
    Inspect { id: String },
    /// Return every pending message held by a dead worker identity to the pool
    Release { owner: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Log,
    Spool,
}

async fn open_store(cli: &Cli) -> Result<SqliteMessageStore> {
    let retry = RetryPolicy::new(cli.max_attempts)?;
    let lease = if cli.lease_timeout_secs == 0 {
        LeasePolicy::never_expires()
    } else {
        LeasePolicy::expires_after(Duration::from_secs(cli.lease_timeout_secs))?
    };
    let store = SqliteMessageStore::connect(&cli.database_url, retry)
        .await
        .with_context(|| format!("failed to open store at {}", cli.database_url))?;
    Ok(store.with_lease_policy(lease))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let store = open_store(&cli).await?;

    match cli.command {
        Commands::Enqueue {
            from,
            to,
            subject,
            body,
            html,
        } => {
            let body = match body {
                Some(body) => body,
                None => std::io::read_to_string(std::io::stdin()).context("failed to read body from stdin")?,
            };
            let payload = if html {
                Payload::html(from, to, subject, body)
            } else {
                Payload::text(from, to, subject, body)
            };
            let id = store.enqueue(payload).await?;
            println!("{id}");
        }
        Commands::Work {
            worker_prefix,
            workers,
            batch_size,
            sweep_interval_ms,
            transport,
            spool_dir,
        } => {
            if workers == 0 {
                bail!("--workers must be at least 1");
            }
            let template = WorkerConfig::new(worker_prefix.as_str())
                .with_batch_size(batch_size)
                .with_sweep_interval(Duration::from_millis(sweep_interval_ms));
            let configs = WorkerConfig::numbered(&worker_prefix, workers, &template);

            let transport: Arc<dyn Transport> = match transport {
                TransportKind::Log => Arc::new(LogTransport),
                TransportKind::Spool => {
                    let spool = SpoolTransport::new(spool_dir);
                    info!(dir = %spool.dir().display(), "spooling messages to disk");
                    Arc::new(spool)
                }
            };
            let group = WorkerGroup::spawn(configs, Arc::new(store), transport)?;
            info!(workers = group.len(), "workers running; press ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutdown requested; waiting for in-flight sweeps");
            group.shutdown_and_join().await;
        }
        Commands::Status => {
            let counts = store.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Inspect { id } => {
            let id: MessageId = id.parse().with_context(|| format!("invalid message id: {id}"))?;
            let record = store.get(id).await?.ok_or(StoreError::NotFound(id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Release { owner } => {
            let owner = WorkerId::new(owner);
            if owner.is_empty() {
                bail!("owner must not be empty");
            }
            let released = store.release_owned_by(&owner).await?;
            println!("released {released} message(s) held by {owner}");
        }
    }

    Ok(())
}
