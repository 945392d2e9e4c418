//! Alloy-backed client for the `InferenceMarketplace` contract.
//!
//! State-changing calls are driven through the [`TransactionExecutor`] so
//! pickup, submission, failure reporting and refunds all share one retry,
//! failover and fee-escalation path. Views run against the first live
//! endpoint with plain per-endpoint failover.

use std::future::Future;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use color_eyre::eyre::Result;
use marketplace_client_interface::{
    InferenceRequest, MarketplaceClient, ModelInfo, RequestEvent, RequestStatus,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

pub mod conversion;
pub mod endpoint;
pub mod error;
mod events;
pub mod executor;
pub mod gas;

use crate::endpoint::{EndpointStateReader, HttpEndpoint, LocalWalletSignerMiddleware, RpcEndpointPool};
use crate::error::{MarketplaceClientError, SendTransactionError};
use crate::executor::{RetryConfig, TransactionExecutor};
use crate::gas::{FeeSettings, GasPolicy, GasPolicyConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    interface IInferenceMarketplace {
        struct Request {
            uint256 requestId;
            uint256 modelId;
            address user;
            uint256 payment;
            string inputDataHash;
            string resultHash;
            address computeNode;
            uint256 createdAt;
            uint256 completedAt;
            uint8 status;
        }

        struct Model {
            uint256 modelId;
            string name;
            string modelHash;
            bool active;
        }

        function pickupRequest(uint256 requestId) external;
        function submitResult(uint256 requestId, string calldata resultHash, string calldata resultData) external;
        function reportFailure(uint256 requestId, string calldata reason) external;
        function requestRefund(uint256 requestId) external;

        function getRequest(uint256 requestId) external view returns (Request memory);
        function getPendingRequests() external view returns (uint256[] memory);
        function getRequestStatus(uint256 requestId) external view returns (uint8);
        function getModel(uint256 modelId) external view returns (Model memory);
        function authorizedComputeNodes(address node) external view returns (bool);

        event InferenceRequested(uint256 indexed requestId, address indexed user, uint256 modelId, uint256 payment, string inputDataHash);
        event InferenceComputing(uint256 indexed requestId, address indexed computeNode);
        event InferenceCompleted(uint256 indexed requestId, string resultHash);
        event InferenceFailed(uint256 indexed requestId, string reason);
    }
}

pub type MarketplaceContract =
    IInferenceMarketplace::IInferenceMarketplaceInstance<Http<Client>, LocalWalletSignerMiddleware>;

/// Applies the computed gas settings to a call builder and sends it,
/// classifying the send error for the replacement path.
macro_rules! send_transaction {
    ($call:expr, $gas:expr) => {{
        let call = $call.nonce($gas.nonce).gas($gas.gas_limit);
        let call = match $gas.fee {
            FeeSettings::Legacy { gas_price } => call.gas_price(gas_price),
            FeeSettings::DynamicFee { max_fee_per_gas, max_priority_fee_per_gas } => {
                call.max_fee_per_gas(max_fee_per_gas).max_priority_fee_per_gas(max_priority_fee_per_gas)
            }
        };
        match call.send().await {
            Ok(pending) => Ok(*pending.tx_hash()),
            Err(e) => Err(SendTransactionError::classify(e)),
        }
    }};
}

#[derive(Debug, Clone)]
pub struct EthereumMarketplaceValidatedArgs {
    pub rpc_urls: Vec<Url>,
    pub private_key: String,
    pub marketplace_contract_address: Address,
    pub gas: GasPolicyConfig,
    pub retry: RetryConfig,
}

pub struct EthereumMarketplaceClient {
    executor: TransactionExecutor<HttpEndpoint>,
    signer_address: Address,
}

impl EthereumMarketplaceClient {
    pub fn new_with_args(args: &EthereumMarketplaceValidatedArgs) -> Result<Self, MarketplaceClientError> {
        let signer = args
            .private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| MarketplaceClientError::InvalidPrivateKey(e.to_string()))?;
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let endpoints = args
            .rpc_urls
            .iter()
            .map(|url| {
                Arc::new(HttpEndpoint::connect(
                    url.clone(),
                    wallet.clone(),
                    signer_address,
                    args.marketplace_contract_address,
                ))
            })
            .collect();
        let pool = RpcEndpointPool::new(endpoints)?;
        let executor = TransactionExecutor::new(pool, GasPolicy::new(args.gas.clone()), args.retry.clone());

        info!(node = %signer_address, contract = %args.marketplace_contract_address, "Marketplace client initialized");
        Ok(Self { executor, signer_address })
    }

    /// Read-only calls are queries, not state changes: they skip the
    /// transaction executor but still fail over across endpoints.
    async fn with_live_endpoint<T, F, Fut>(&self, op: F) -> Result<T, MarketplaceClientError>
    where
        F: Fn(Arc<HttpEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, MarketplaceClientError>>,
    {
        let mut last_error: Option<MarketplaceClientError> = None;
        for endpoint in self.executor.pool().endpoints() {
            if !endpoint.check_liveness().await {
                continue;
            }
            match op(Arc::clone(endpoint)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(endpoint = %endpoint.url(), error = %e, "Read call failed, trying next endpoint");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(MarketplaceClientError::NoLiveEndpoint))
    }
}

#[async_trait]
impl MarketplaceClient for EthereumMarketplaceClient {
    fn node_address(&self) -> Address {
        self.signer_address
    }

    async fn pickup_request(&self, request_id: u64) -> Result<B256> {
        let id = U256::from(request_id);
        let tx_hash = self
            .executor
            .execute_with_retry("pickup_request", |endpoint, gas| async move {
                send_transaction!(endpoint.contract().pickupRequest(id), gas)
            })
            .await?;
        info!(request_id, tx_hash = %tx_hash, "Request picked up");
        Ok(tx_hash)
    }

    async fn submit_result(&self, request_id: u64, result_hash: &str, result_data: &str) -> Result<B256> {
        let id = U256::from(request_id);
        let result_hash = result_hash.to_string();
        let result_data = result_data.to_string();
        let tx_hash = self
            .executor
            .execute_with_retry("submit_result", |endpoint, gas| {
                let result_hash = result_hash.clone();
                let result_data = result_data.clone();
                async move {
                    send_transaction!(endpoint.contract().submitResult(id, result_hash, result_data), gas)
                }
            })
            .await?;
        info!(request_id, tx_hash = %tx_hash, "Result submitted");
        Ok(tx_hash)
    }

    async fn report_failure(&self, request_id: u64, reason: &str) -> Result<B256> {
        let id = U256::from(request_id);
        let reason = reason.to_string();
        let tx_hash = self
            .executor
            .execute_with_retry("report_failure", |endpoint, gas| {
                let reason = reason.clone();
                async move { send_transaction!(endpoint.contract().reportFailure(id, reason), gas) }
            })
            .await?;
        info!(request_id, tx_hash = %tx_hash, "Failure reported");
        Ok(tx_hash)
    }

    async fn request_refund(&self, request_id: u64) -> Result<B256> {
        let id = U256::from(request_id);
        let tx_hash = self
            .executor
            .execute_with_retry("request_refund", |endpoint, gas| async move {
                send_transaction!(endpoint.contract().requestRefund(id), gas)
            })
            .await?;
        info!(request_id, tx_hash = %tx_hash, "Refund requested");
        Ok(tx_hash)
    }

    async fn get_request(&self, request_id: u64) -> Result<InferenceRequest> {
        let id = U256::from(request_id);
        let raw = self
            .with_live_endpoint(|endpoint| async move {
                endpoint
                    .contract()
                    .getRequest(id)
                    .call()
                    .await
                    .map(|ret| ret._0)
                    .map_err(|e| MarketplaceClientError::Contract(e.to_string()))
            })
            .await?;
        Ok(conversion::request_from_contract(raw)?)
    }

    async fn get_pending_requests(&self) -> Result<Vec<u64>> {
        let raw = self
            .with_live_endpoint(|endpoint| async move {
                endpoint
                    .contract()
                    .getPendingRequests()
                    .call()
                    .await
                    .map(|ret| ret._0)
                    .map_err(|e| MarketplaceClientError::Contract(e.to_string()))
            })
            .await?;
        Ok(conversion::request_ids(raw)?)
    }

    async fn get_request_status(&self, request_id: u64) -> Result<RequestStatus> {
        let id = U256::from(request_id);
        let raw = self
            .with_live_endpoint(|endpoint| async move {
                endpoint
                    .contract()
                    .getRequestStatus(id)
                    .call()
                    .await
                    .map(|ret| ret._0)
                    .map_err(|e| MarketplaceClientError::Contract(e.to_string()))
            })
            .await?;
        Ok(RequestStatus::try_from(raw).map_err(|e| MarketplaceClientError::Conversion(e.to_string()))?)
    }

    async fn get_model(&self, model_id: u64) -> Result<ModelInfo> {
        let id = U256::from(model_id);
        let raw = self
            .with_live_endpoint(|endpoint| async move {
                endpoint
                    .contract()
                    .getModel(id)
                    .call()
                    .await
                    .map(|ret| ret._0)
                    .map_err(|e| MarketplaceClientError::Contract(e.to_string()))
            })
            .await?;
        Ok(conversion::model_from_contract(raw)?)
    }

    async fn is_authorized_node(&self, node: Address) -> Result<bool> {
        let authorized = self
            .with_live_endpoint(|endpoint| async move {
                endpoint
                    .contract()
                    .authorizedComputeNodes(node)
                    .call()
                    .await
                    .map(|ret| ret._0)
                    .map_err(|e| MarketplaceClientError::Contract(e.to_string()))
            })
            .await?;
        Ok(authorized)
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<RequestEvent>> {
        let endpoint =
            self.executor.pool().first_live().await.ok_or(MarketplaceClientError::NoLiveEndpoint)?;
        info!(endpoint = %endpoint.url(), "Subscribing to marketplace events");
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(events::watch_marketplace_events(endpoint, sender));
        Ok(receiver)
    }
}
