use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shardq_core::{NewEvent, ShardqConfig};
use shardq_store::{EventStore, SqliteStore};
use shardq_worker::{
    validate_partition_count, AcknowledgeHandler, EventSubmitter, LogBus, MessageBus,
    StaticCoordinator, WebhookBus, WorkerNode,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shardq-node")]
#[command(author, version, about = "Sharded event scheduler worker", long_about = None)]
struct Cli {
    /// Path to shardq.toml (defaults to ~/.shardq/shardq.toml)
    #[arg(short, long, env = "SHARDQ_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker node until Ctrl-C
    Run {
        /// Instance name used in logs
        #[arg(short, long)]
        instance: Option<String>,

        /// Partitions to own, e.g. `0,1,2` (overrides cluster.owned_partitions)
        #[arg(short, long, value_delimiter = ',')]
        partitions: Option<Vec<u32>>,
    },

    /// Create the database schema and exit
    InitDb,

    /// Submit one event
    Submit {
        /// Human-readable event name
        #[arg(short, long)]
        name: String,

        /// Opaque payload handed to the task handler
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Event id; a UUID is generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Optional grouping label stored with the event
        #[arg(long)]
        namespace: Option<String>,

        /// Seconds from now until the event is due
        #[arg(short, long, default_value_t = 0)]
        delay_secs: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardq=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ShardqConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::InitDb => {
            open_store(&config)?;
            info!(path = %config.database.path, "database schema ready");
        }
        Command::Submit {
            name,
            payload,
            id,
            namespace,
            delay_secs,
        } => {
            let store: Arc<dyn EventStore> = Arc::new(open_store(&config)?);
            let submitter = EventSubmitter::new(store, config.cluster.num_partitions);
            let event = submitter
                .create_event(NewEvent {
                    id,
                    name,
                    scheduled_time: chrono::Utc::now() + chrono::Duration::seconds(delay_secs),
                    payload,
                    namespace,
                })
                .await?;
            println!("{} partition={}", event.id, event.partition_id);
        }
        Command::Run {
            instance,
            partitions,
        } => {
            if let Some(instance) = instance {
                config.node.instance_name = instance;
            }
            if let Some(partitions) = partitions {
                config.cluster.owned_partitions = partitions;
                config.validate()?;
            }
            run(config).await?;
        }
    }
    Ok(())
}

async fn run(config: ShardqConfig) -> anyhow::Result<()> {
    let cluster = &config.cluster;
    validate_partition_count(
        cluster.num_partitions,
        cluster.coordinator_partitions.unwrap_or(cluster.num_partitions),
    )?;

    let store: Arc<dyn EventStore> = Arc::new(open_store(&config)?);
    let bus: Arc<dyn MessageBus> = match &config.outbox.webhook_url {
        Some(url) => {
            info!(%url, topic = %config.outbox.topic, "publishing outbox to webhook");
            Arc::new(WebhookBus::new(
                url.clone(),
                config.outbox.topic.clone(),
                Duration::from_millis(config.outbox.publish_timeout_ms),
            ))
        }
        None => {
            warn!("no outbox.webhook_url configured; outbox messages are only logged");
            Arc::new(LogBus::new(config.outbox.topic.clone()))
        }
    };

    let node = WorkerNode::new(&config, store, bus, Arc::new(AcknowledgeHandler));
    let coordinator = StaticCoordinator::new(
        cluster.resource_name.clone(),
        cluster.num_partitions,
        cluster.owned_partitions.clone(),
    );
    coordinator.assign(node.state_machine())?;
    if coordinator.partitions().is_empty() {
        warn!("no partitions assigned; node will idle");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = node.start(shutdown_rx);
    info!(
        instance = %node.instance_name(),
        partitions = ?node.tracker().snapshot(),
        "shardq node running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; draining in-flight cycles");
    coordinator.release(node.state_machine())?;
    let _ = shutdown_tx.send(true);
    handle.join().await;
    info!("shardq node stopped");
    Ok(())
}

fn open_store(config: &ShardqConfig) -> anyhow::Result<SqliteStore> {
    let path = &config.database.path;
    ensure_parent_dir(path);
    info!(%path, "opening SQLite database");
    let store = SqliteStore::open(path, Duration::from_millis(config.database.busy_timeout_ms))?;
    Ok(store)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
