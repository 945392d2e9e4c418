use std::sync::Arc;

use clap::Parser as _;
use compute_node::cli::{Cli, Commands, RunCmd};
use compute_node::config::Config;
use compute_node::utils::logging::init_logging;
use compute_node::{run_until_shutdown, OrchestratorResult};
use dotenvy::dotenv;
use tracing::info;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();
    info!("Starting compute node");
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { run_command } => {
            run_compute_node(run_command).await.expect("Failed to run compute node");
        }
    }
}

async fn run_compute_node(run_cmd: &RunCmd) -> OrchestratorResult<()> {
    let config = Arc::new(Config::setup(run_cmd).await?);
    run_until_shutdown(config).await
}
