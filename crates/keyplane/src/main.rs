// keyplane node binary: loads configuration, opens the metadata store, and
// runs the cluster workers until interrupted. The RPC surface that would
// deliver heartbeats in production attaches to `RaftCluster`'s public
// methods; this binary wires everything beneath it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use keyplane::cluster::RaftCluster;
use keyplane::coordinator::Coordinator;
use keyplane::options::{ReplicationConfig, ScheduleConfig, ScheduleOptions};
use keyplane::scheduler::is_scheduler_registered;
use keyplane::schedulers::register_builtin_schedulers;
use keyplane::storage::MetaStorage;

#[derive(Parser, Debug)]
#[command(name = "keyplane", about = "placement driver for a distributed kv cluster")]
struct NodeArgs {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the metadata store.
    #[arg(long, default_value = "keyplane-data")]
    data_dir: PathBuf,

    /// Numeric cluster id.
    #[arg(long, default_value_t = 1)]
    cluster_id: u64,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct Config {
    schedule: ScheduleConfig,
    replication: ReplicationConfig,
}

impl Config {
    fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    register_builtin_schedulers();

    let config = Config::load(args.config.as_ref())?;
    config
        .schedule
        .validate(is_scheduler_registered)
        .context("invalid schedule configuration")?;

    let storage = MetaStorage::fjall(&args.data_dir, args.cluster_id)
        .context("open metadata store")?;
    // A previously persisted config wins over the file.
    let (schedule, replication) = match storage.load_options()? {
        Some(persisted) => (persisted.schedule, persisted.replication),
        None => (config.schedule, config.replication),
    };
    schedule
        .validate(is_scheduler_registered)
        .context("invalid persisted schedule configuration")?;
    if schedule.max_cold_data_time.get() != std::time::Duration::ZERO {
        tracing::warn!(
            "max-cold-data-time is set but not consumed by any checker yet, ignoring"
        );
    }
    let opts = Arc::new(ScheduleOptions::new(schedule, replication));
    let cluster = RaftCluster::new(args.cluster_id, opts, storage)?;

    let quit = cluster.start();
    let coordinator = Coordinator::new(cluster.clone())?;
    let coordinator_task = tokio::spawn(coordinator.run(quit));

    let bootstrapped = cluster.is_bootstrapped()?;
    info!(
        cluster_id = args.cluster_id,
        data_dir = %args.data_dir.display(),
        bootstrapped,
        "keyplane started"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    cluster.stop();
    let _ = coordinator_task.await;
    Ok(())
}
