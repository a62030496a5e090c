#![warn(clippy::all)]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

mod config;
mod directory;
mod error;
mod http;
mod identity;
mod metrics;
mod monitoring;
mod orchestrator;

use config::{Config, DEFAULT_CONFIG_PATH};
use directory::{KubeMembership, PeerDirectory};
use http::{AppState, run_server};
use identity::Identity;
use logger::init_tracing;
use metrics::{MetricsAggregator, SourceLabels};
use monitoring::{HttpProber, ProbeExecutor, ProbeScheduler, ScheduleConfig};
use orchestrator::Coordinator;

/// Measures ping and download latency to every other member of the cohort
#[derive(Debug, Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path of the TOML config file. A missing file means defaults.
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Print the effective configuration and exit
    #[clap(long)]
    print_config: bool,
    /// Write the effective configuration to the config path and exit
    #[clap(long, conflicts_with = "print_config")]
    init_config: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::from_config(&cli.config).context("Failed to load configuration")?;
    if cli.print_config {
        println!("{config}");
        return Ok(());
    }
    if cli.init_config {
        let written = config.write_config(&cli.config).context("Failed to write configuration")?;
        info!("Configuration written to {}", written.display());
        return Ok(());
    }
    config.validate()?;

    let bind: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid server.bind address {:?}", config.server.bind))?;
    let addr = SocketAddr::new(bind, config.server.port);

    let client = kube::Client::try_default().await.context("Failed to create kubernetes client")?;
    let identity = Identity::resolve(client.clone()).await.context("Failed to resolve own identity")?;
    info!(
        namespace = %identity.namespace,
        pod = %identity.pod_name,
        node = %identity.node_name,
        zone = %identity.zone,
        "Resolved identity"
    );

    let source = SourceLabels { pod: identity.pod_name.clone(), zone: identity.zone.clone() };
    let aggregator = Arc::new(
        MetricsAggregator::new(&source, config.metrics.label_granularity, config.metrics.retention)
            .context("Failed to register metrics")?,
    );

    let prober = HttpProber::new(config.probe_timeout()).context("Failed to build HTTP client")?;
    let executor = Arc::new(ProbeExecutor::new(Arc::new(prober), config.probe_timeout()));
    let scheduler = ProbeScheduler::new(
        executor,
        aggregator.clone(),
        ScheduleConfig { interval: config.probe_interval(), jitter_max: config.jitter_max() },
    );

    let own_pod = (!config.probe.include_self).then(|| identity.pod_name.clone());
    let membership = KubeMembership::new(
        client,
        &identity.namespace,
        config.directory.label_selector.as_str(),
        own_pod,
        config.server.port,
    );
    let directory = PeerDirectory::new(Arc::new(membership), config.refresh_timeout());
    let coordinator = Coordinator::new(
        directory,
        scheduler,
        aggregator.clone(),
        config.refresh_interval(),
        config.shutdown_grace(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx));

    let payload_bytes = usize::try_from(config.server.download_payload_bytes)
        .context("server.download_payload_bytes does not fit in memory")?;
    let served = run_server(addr, AppState::new(aggregator, payload_bytes)).await;

    info!("HTTP server stopped, shutting down probes");
    shutdown_tx.send_replace(true);
    if let Err(e) = coordinator_task.await {
        warn!("Coordinator task failed: {}", e);
    }

    served.context("HTTP server failed")
}
