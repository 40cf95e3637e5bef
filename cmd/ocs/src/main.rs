mod cli;
mod initializers;

use clap::Parser;
use ocs_comms::{RequestSolver, Router};
use ocs_common::Settings;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let options = cli::Options::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(error) = run(options).await {
        error!(%error, "startup failed");
        std::process::exit(1);
    }
}

async fn run(options: cli::Options) -> Result<(), String> {
    let settings = Arc::new(Settings::from_files(&options.config).map_err(|e| e.to_string())?);

    let root = initializers::build_tree(&settings).map_err(|e| e.to_string())?;
    let solver = RequestSolver::new(root, settings.clone());
    let router = Arc::new(Router::new(&options.router_name, solver.clone(), &settings));

    solver.run_tree().await;
    let address = match router.clone().start().await {
        Ok(address) => address,
        Err(error) => {
            // Leave no half-started tree behind.
            solver.stop_tree().await;
            return Err(error.to_string());
        }
    };
    info!(%address, "server is up");

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "can not listen for the interrupt signal");
    }
    info!("shutting down");
    router.stop().await;
    solver.stop_tree().await;
    Ok(())
}
