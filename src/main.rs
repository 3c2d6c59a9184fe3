//! Controller manager binary

use std::time::Duration;

use clap::{ArgAction, Parser};
use kube::Client;
use tracing::{error, info};

use controller_samples::controller::TestReconciler;
use controller_samples::leader_election::{
    default_identity, resolve_namespace, LeaderElectionConfig, LeaderElector,
};
use controller_samples::manager::{Manager, ManagerConfig};
use controller_samples::probes::parse_bind_address;
use controller_samples::runnable::{IntervalLogger, DEFAULT_INTERVAL};
use controller_samples::telemetry::{self, LogFormat};
use controller_samples::{crd, signals, DEFAULT_METRICS_ADDR, LEADER_ELECTION_ID, POD_NAME_ENV};

/// Controller manager running the Test reconciler and a heartbeat logger
#[derive(Parser, Debug)]
#[command(name = "manager", version, about, long_about = None)]
struct Cli {
    /// The address the metric endpoint binds to ("0" disables it)
    #[arg(long, default_value = DEFAULT_METRICS_ADDR)]
    metrics_addr: String,

    /// Enable leader election, ensuring only one active controller manager
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    enable_leader_election: bool,

    /// Namespace of the leader election Lease (defaults to the pod namespace)
    #[arg(long)]
    leader_election_namespace: Option<String>,

    /// Name of the leader election Lease
    #[arg(long, default_value = LEADER_ELECTION_ID)]
    leader_election_id: String,

    /// Seconds runnables get to stop after a shutdown signal
    #[arg(long, default_value_t = 30)]
    graceful_shutdown_timeout: u64,

    /// Log output format: text or json
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Print the Test CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd::manifest()?);
        return Ok(());
    }

    telemetry::init(cli.log_format)?;

    if let Err(e) = run(cli).await {
        error!(error = %e, "Manager exited with error");
        return Err(e.into());
    }

    info!("Manager exited cleanly");
    Ok(())
}

async fn run(cli: Cli) -> controller_samples::Result<()> {
    let config = ManagerConfig {
        metrics_bind_address: parse_bind_address(&cli.metrics_addr)?,
        graceful_shutdown_timeout: Duration::from_secs(cli.graceful_shutdown_timeout),
    };

    let client = Client::try_default().await?;

    let mut builder = Manager::builder(config);
    if cli.enable_leader_election {
        let namespace = resolve_namespace(cli.leader_election_namespace.as_deref())?;
        let election = LeaderElectionConfig::new(cli.leader_election_id, namespace, default_identity());
        info!(
            lease = %election.lease_name,
            namespace = %election.namespace,
            identity = %election.identity,
            "Leader election enabled"
        );
        builder = builder.leader_election(LeaderElector::new(client.clone(), election)?);
    }
    let mut manager = builder.build()?;

    let pod_name = std::env::var(POD_NAME_ENV).unwrap_or_default();
    IntervalLogger::new(pod_name, DEFAULT_INTERVAL, true)?.setup_with_manager(&mut manager)?;
    TestReconciler::new(client).setup_with_manager(&mut manager)?;

    let shutdown = signals::shutdown_token()?;
    manager.start(shutdown).await
}
