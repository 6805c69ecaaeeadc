//! Placement driver binary

use clap::{Parser, Subcommand};
use minikv_pd::common::{parse_duration, Config};
use minikv_pd::coordinator::{ClusterMembership, ClusterSeed, MemoryProbe, MemoryRegister, NodeInfo, Register};
use minikv_pd::ops::verify_cluster;
use minikv_pd::Coordinator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minikv-pd")]
#[command(about = "minikv placement driver")]
#[command(version = minikv_pd::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a placement driver
    Serve {
        /// Node ID (overrides the config file)
        #[arg(long)]
        id: Option<String>,

        /// Advertised address of this coordinator
        #[arg(long, default_value = "0.0.0.0:5000")]
        addr: String,

        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON seed for the in-memory register
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Override the normal migration wait (e.g. "3m")
        #[arg(long)]
        migrate_wait: Option<String>,

        /// How often to log a placement report
        #[arg(long, default_value = "60s")]
        report_interval: String,
    },

    /// Report placement health of a seeded cluster
    Verify {
        /// JSON seed for the in-memory register
        #[arg(long)]
        seed: PathBuf,
    },
}

fn init_tracing(default_level: &str) {
    let level = default_level.to_string();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_seed(path: Option<&Path>) -> anyhow::Result<ClusterSeed> {
    match path {
        Some(path) => Ok(ClusterSeed::load(path)?),
        None => Ok(ClusterSeed::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            addr,
            config,
            seed,
            migrate_wait,
            report_interval,
        } => {
            let mut config = Config::load(config.as_deref())?;
            init_tracing(&config.log_level);

            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(wait) = migrate_wait {
                config.placement.migrate_wait_ms = parse_duration(&wait)?.as_millis() as u64;
            }
            let report_interval = parse_duration(&report_interval)?;

            tracing::info!("minikv-pd {}", minikv_pd::BUILD_INFO);
            let register: Arc<MemoryRegister> = Arc::new(load_seed(seed.as_deref())?.into_register());
            register.init_cluster_id(&config.cluster_key).await?;
            let me = NodeInfo::new(config.node_id.clone(), addr);
            let coord = Coordinator::new(
                config.placement.clone(),
                me,
                register,
                Arc::new(MemoryProbe::new()),
            );
            tracing::info!("coordinator {} joining cluster {}", config.node_id, config.cluster_key);
            coord.start().await?;

            let mut ticker = tokio::time::interval(report_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        res?;
                        tracing::info!("shutdown signal received");
                        break;
                    }
                    _ = coord.stopped() => {
                        coord.stop().await;
                        anyhow::bail!("placement coordinator {} failed", config.node_id);
                    }
                    _ = ticker.tick() => {
                        if !coord.is_leader() {
                            continue;
                        }
                        match coord.verify().await {
                            Ok(report) => tracing::info!(
                                "placement: {}/{} healthy, stable: {}, epoch: {}",
                                report.healthy,
                                report.total_partitions,
                                coord.is_cluster_stable(),
                                report.membership_epoch
                            ),
                            Err(e) => tracing::warn!("placement report failed: {}", e),
                        }
                        tracing::debug!("metrics:\n{}", coord.metrics().to_prometheus());
                    }
                }
            }
            coord.stop().await;
        }

        Commands::Verify { seed } => {
            init_tracing("warn");
            let seed = ClusterSeed::load(&seed)?;
            let membership = ClusterMembership::new();
            membership.apply_live_nodes(seed.data_nodes.clone());
            let register = seed.into_register();

            let report = verify_cluster(&register, &membership).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
