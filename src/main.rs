use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use fleetsim::error::FleetError;
use fleetsim::fleet::{FleetExit, FleetOrchestrator};
use fleetsim::mqtt::{Connector, LoopbackBroker, MqttConnector};
use fleetsim::FleetConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Publish simulated device telemetry to an MQTT broker
#[derive(Debug, Parser)]
#[command(name = "fleetsim", version, about)]
struct Cli {
    /// Fleet configuration file
    #[arg(short = 'f', long = "file", default_value = "config/fleet.toml")]
    file: PathBuf,

    /// Run against an in-process broker that logs every publish
    #[arg(long)]
    dry_run: bool,
}

// how many publishes the dry-run broker keeps around
const DRY_RUN_LOG: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config = FleetConfig::load(&cli.file)?;
    let runtime = config.runtime.clone();

    let connector: Arc<dyn Connector> = if cli.dry_run {
        info!("Dry run: publishing to the in-process broker");
        Arc::new(LoopbackBroker::echoing(DRY_RUN_LOG))
    } else {
        Arc::new(
            MqttConnector::new(config.broker.clone())
                .with_timeouts(runtime.connect_timeout(), runtime.keep_alive())
                .with_capacity(runtime.channel_capacity),
        )
    };

    let orchestrator = match FleetOrchestrator::new(config, connector) {
        Ok(orchestrator) => orchestrator,
        Err(e) => return Err(eyre!("Fleet could not be built: {}", e)),
    };

    let interrupt = orchestrator.interrupt_token();
    let _signal_handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received");
                interrupt.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl+C: {}", e),
        }
    });

    let fleet = match orchestrator.start().await {
        Ok(fleet) => fleet,
        Err(FleetError::ListenerUnavailable { id, reason }) => {
            error!("Not starting devices, listener {} unavailable: {}", id, reason);
            return Ok(());
        }
        Err(e) => return Err(eyre!("Fleet could not be started: {}", e)),
    };

    let exit = fleet.wait().await;
    match exit {
        FleetExit::Interrupted => info!("Simulation interrupted"),
        FleetExit::ListenerLost => warn!("Simulation ended, command listener lost"),
        FleetExit::Drained => info!("Simulation ended, no device left to run"),
    }

    let report = fleet.stop(runtime.shutdown_timeout()).await;
    for failure in report.failures() {
        warn!("Worker failure: {}", failure);
    }
    if !report.is_clean() {
        warn!(
            "Shutdown left {} stuck and {} panicked worker(s)",
            report.stuck.len(),
            report.panicked.len()
        );
    }
    info!("Bye");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
