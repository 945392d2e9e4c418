use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use color_eyre::eyre::Result;
use mockall::automock;
use mockall::predicate::*;
use thiserror::Error;
use tokio::sync::mpsc;

/// On-chain lifecycle of an inference request. Transitions are one-directional:
/// Pending -> Computing -> {Completed | Failed}; a Failed request may move to
/// Refunded by user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Computing,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown request status discriminant: {0}")]
pub struct UnknownStatus(pub u8);

impl TryFrom<u8> for RequestStatus {
    type Error = UnknownStatus;

    fn try_from(value: u8) -> Result<Self, UnknownStatus> {
        match value {
            0 => Ok(RequestStatus::Pending),
            1 => Ok(RequestStatus::Computing),
            2 => Ok(RequestStatus::Completed),
            3 => Ok(RequestStatus::Failed),
            4 => Ok(RequestStatus::Refunded),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Computing => "COMPUTING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Refunded => "REFUNDED",
        };
        f.write_str(s)
    }
}

/// Mirror of the contract's request struct. Only ever mutated on-chain; local
/// copies are read-only snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub request_id: u64,
    pub model_id: u64,
    pub user: Address,
    pub payment: U256,
    pub input_data_hash: String,
    /// Empty until the request is completed.
    pub result_hash: String,
    /// Zero address until the request is picked up.
    pub compute_node: Address,
    pub created_at: u64,
    pub completed_at: u64,
    pub status: RequestStatus,
}

/// Registered model metadata from the marketplace contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub model_id: u64,
    pub name: String,
    pub model_hash: String,
    pub active: bool,
}

/// Typed request-lifecycle event decoded from the contract logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Requested { request_id: u64, user: Address, model_id: u64, payment: U256, input_data_hash: String },
    Computing { request_id: u64, compute_node: Address },
    Completed { request_id: u64, result_hash: String },
    Failed { request_id: u64, reason: String },
}

impl RequestEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            RequestEvent::Requested { request_id, .. }
            | RequestEvent::Computing { request_id, .. }
            | RequestEvent::Completed { request_id, .. }
            | RequestEvent::Failed { request_id, .. } => *request_id,
        }
    }
}

/// Trait every marketplace backend has to implement. State-changing calls are
/// expected to drive their transactions through the backend's retry engine
/// and return only once the transaction has been accepted by the network (or
/// every endpoint/attempt has been exhausted).
#[automock]
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    /// Address of the signing account this node submits transactions from.
    fn node_address(&self) -> Address;

    /// Claim a pending request for this compute node.
    async fn pickup_request(&self, request_id: u64) -> Result<B256>;

    /// Submit the inference result for a request this node picked up.
    async fn submit_result(&self, request_id: u64, result_hash: &str, result_data: &str) -> Result<B256>;

    /// Record an on-chain failure so the user can claim a refund.
    async fn report_failure(&self, request_id: u64, reason: &str) -> Result<B256>;

    /// Claim back the payment of a failed request (user-side entry point,
    /// exposed for completeness).
    async fn request_refund(&self, request_id: u64) -> Result<B256>;

    async fn get_request(&self, request_id: u64) -> Result<InferenceRequest>;

    /// Bulk pending-request view. Can exceed block gas limits on a large
    /// backlog, which is why callers should prefer an indexed view.
    async fn get_pending_requests(&self) -> Result<Vec<u64>>;

    async fn get_request_status(&self, request_id: u64) -> Result<RequestStatus>;

    async fn get_model(&self, model_id: u64) -> Result<ModelInfo>;

    async fn is_authorized_node(&self, node: Address) -> Result<bool>;

    /// Subscribe to request-lifecycle events. The returned channel is fed by
    /// a background watcher task owned by the client.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<RequestEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_discriminant() {
        for (raw, status) in [
            (0u8, RequestStatus::Pending),
            (1, RequestStatus::Computing),
            (2, RequestStatus::Completed),
            (3, RequestStatus::Failed),
            (4, RequestStatus::Refunded),
        ] {
            assert_eq!(RequestStatus::try_from(raw), Ok(status));
        }
        assert_eq!(RequestStatus::try_from(5), Err(UnknownStatus(5)));
    }

    #[test]
    fn event_exposes_request_id() {
        let event = RequestEvent::Completed { request_id: 7, result_hash: "Qm".into() };
        assert_eq!(event.request_id(), 7);
    }
}
