mod backends;
mod cli;
mod dev;
mod shutdown;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use cellfleet_infra::{AdmissionController, SimulationWorker};
use cellfleet_observability::LogFormat;

use crate::backends::Backends;
use crate::cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cellfleet_observability::init(if args.is_dev() {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    });

    let config = args.worker_config();
    let settings = args.store_settings();
    config.validate().context("invalid worker configuration")?;
    if config.dev_mode {
        settings.check_dev_mode()?;
    }

    let shutdown = shutdown::install_shutdown_handler().context("installing signal handlers")?;

    let Some(backends) = Backends::connect(&settings, &config, &shutdown).await? else {
        info!("shutdown requested before the backends were reachable");
        return Ok(());
    };

    if config.dev_mode {
        if let Err(err) = dev::prepare(&backends).await {
            dev::teardown(&backends).await;
            return Err(err);
        }
    }

    let admission = AdmissionController::with_sysinfo(config.memory_ceiling);
    let worker = Arc::new(SimulationWorker::new(
        backends.context(shutdown.clone()),
        config.clone(),
        admission,
    ));
    let stats = worker.run().await;
    info!(
        jobs_processed = stats.jobs_processed,
        jobs_failed = stats.jobs_failed,
        jobs_abandoned = stats.jobs_abandoned,
        "worker exited"
    );

    if config.dev_mode {
        dev::teardown(&backends).await;
    }
    Ok(())
}
