use std::fmt;
use std::time::Duration;

use alloy_primitives::Address;
use color_eyre::eyre::eyre;
use ethereum_marketplace_client::error::MarketplaceClientError;
use thiserror::Error;

/// Fatal errors. Anything surfacing here aborts startup or the main loop;
/// the node must not run in a partially-configured state.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid configuration value for {name}: {message}")]
    InvalidConfig { name: &'static str, message: String },

    #[error("Invalid contract address {value}: {message}")]
    InvalidAddress { value: String, message: String },

    #[error("No RPC endpoint reachable at startup: {0}")]
    NoReachableRpc(String),

    #[error("Compute node {0} is not authorized by the marketplace contract")]
    UnauthorizedNode(Address),

    #[error("Marketplace client error: {0}")]
    MarketplaceClient(#[from] MarketplaceClientError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Other error: {0}")]
    Other(#[from] OtherError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Terminal per-request errors. Each one ends with a best-effort on-chain
/// failure report and a failed-counter bump; none of them crash the process.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Pickup transaction failed: {0}")]
    Pickup(String),

    #[error("Request {request_id} is assigned to {assigned}, not this node")]
    AssignmentMismatch { request_id: u64, assigned: Address },

    #[error("Model {0} is not active")]
    ModelInactive(u64),

    #[error("Failed to fetch on-chain details: {0}")]
    Fetch(String),

    #[error("Inference backend error: {0}")]
    Inference(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Result submission failed: {0}")]
    Submit(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wrapper for errors that do not fit a specific category while keeping the
/// error chain context.
#[derive(Debug)]
pub struct OtherError(color_eyre::eyre::Error);

impl fmt::Display for OtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for OtherError {}

impl From<color_eyre::eyre::Error> for OtherError {
    fn from(err: color_eyre::eyre::Error) -> Self {
        OtherError(err)
    }
}

impl From<String> for OtherError {
    fn from(message: String) -> Self {
        OtherError(eyre!(message))
    }
}
