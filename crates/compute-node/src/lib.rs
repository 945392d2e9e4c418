//! Compute-node daemon for the on-chain inference marketplace: indexes
//! request-lifecycle events, claims pending requests, runs the inference
//! backend and settles results (or failures) back on-chain.

use std::sync::Arc;

use color_eyre::eyre::eyre;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod backend;
pub mod cli;
pub mod config;
pub mod content_store;
pub mod error;
pub mod indexer;
pub mod orchestrator;
pub mod server;
pub mod types;
pub mod utils;

pub use error::{OrchestratorError, OrchestratorResult};

use crate::config::Config;
use crate::content_store::PayloadStore;
use crate::error::OtherError;
use crate::indexer::RequestIndexer;
use crate::orchestrator::InferenceOrchestrator;

const NEW_REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Wires the services and runs the node until a shutdown signal arrives.
pub async fn run_until_shutdown(config: Arc<Config>) -> OrchestratorResult<()> {
    config.startup_checks().await?;

    let cancel = CancellationToken::new();
    let marketplace = config.marketplace();

    let events = marketplace
        .subscribe_events()
        .await
        .map_err(|e| OrchestratorError::Other(OtherError::from(e)))?;

    let indexer = Arc::new(RequestIndexer::new(config.marketplace(), config.indexer_config().clone()));
    indexer.index_pending_requests().await;

    let payloads = Arc::new(PayloadStore::new(config.content_store()));
    let orchestrator = Arc::new(InferenceOrchestrator::new(
        marketplace,
        config.backend(),
        payloads,
        Arc::clone(&indexer),
        config.service_params().clone(),
        cancel.child_token(),
    ));

    let (new_request_tx, new_request_rx) = mpsc::channel(NEW_REQUEST_CHANNEL_CAPACITY);
    tokio::spawn(Arc::clone(&indexer).run(events, new_request_tx, cancel.child_token()));
    tokio::spawn(Arc::clone(&orchestrator).run(new_request_rx));

    let server_addr = server::setup_server(Arc::clone(&orchestrator), config.server_params()).await?;
    info!(address = %server_addr, "Status server listening");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| OrchestratorError::Other(OtherError::from(eyre!("failed to listen for shutdown signal: {e}"))))?;
    info!("Shutdown signal received");

    orchestrator.stop().await;
    cancel.cancel();
    info!("Compute node stopped");
    Ok(())
}
