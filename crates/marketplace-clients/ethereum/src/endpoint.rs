//! RPC endpoint handling: one provider pair (plain reads + wallet-filled
//! sends) per configured URL, plus the ordered pool the executor rotates
//! through.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy::eips::BlockNumberOrTag;
use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::Address;
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use mockall::automock;
use tracing::{debug, warn};
use url::Url;

use crate::error::MarketplaceClientError;
use crate::gas::NetworkFees;
use crate::MarketplaceContract;

const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider stack used for transaction submission: recommended fillers plus
/// a local wallet signer.
pub type LocalWalletSignerMiddleware = FillProvider<
    JoinFill<
        JoinFill<Identity, JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>>,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

/// Last observed health of an endpoint. Not persisted across restarts.
#[derive(Debug, Clone, Copy)]
pub struct EndpointState {
    pub healthy: bool,
    pub last_checked: Option<Instant>,
}

/// The chain-state queries the retry engine needs from the endpoint it is
/// currently working against.
#[automock]
#[async_trait]
pub trait EndpointStateReader: Send + Sync {
    fn url(&self) -> &Url;

    /// Cheap liveness probe. A dead endpoint is skipped without consuming a
    /// retry attempt.
    async fn check_liveness(&self) -> bool;

    /// Current transaction count of the signing account on this endpoint.
    async fn signer_nonce(&self) -> Result<u64, MarketplaceClientError>;

    /// Current fee conditions as observed by this endpoint.
    async fn network_fees(&self) -> Result<NetworkFees, MarketplaceClientError>;
}

/// A single HTTP RPC endpoint with its bound contract instance.
pub struct HttpEndpoint {
    url: Url,
    provider: RootProvider<Http<Client>>,
    contract: MarketplaceContract,
    signer_address: Address,
    state: Mutex<EndpointState>,
}

impl HttpEndpoint {
    /// Builds the providers for `url`. Pure construction, no network traffic.
    pub fn connect(url: Url, wallet: EthereumWallet, signer_address: Address, contract_address: Address) -> Self {
        let provider = ProviderBuilder::new().on_http(url.clone());
        let wallet_provider: LocalWalletSignerMiddleware =
            ProviderBuilder::new().with_recommended_fillers().wallet(wallet).on_http(url.clone());
        let contract = crate::IInferenceMarketplace::new(contract_address, wallet_provider);
        Self {
            url,
            provider,
            contract,
            signer_address,
            state: Mutex::new(EndpointState { healthy: false, last_checked: None }),
        }
    }

    pub fn contract(&self) -> &MarketplaceContract {
        &self.contract
    }

    pub fn provider(&self) -> &RootProvider<Http<Client>> {
        &self.provider
    }

    pub fn state(&self) -> EndpointState {
        *self.state.lock().expect("endpoint state lock poisoned")
    }

    fn record_probe(&self, healthy: bool) {
        let mut state = self.state.lock().expect("endpoint state lock poisoned");
        state.healthy = healthy;
        state.last_checked = Some(Instant::now());
    }
}

#[async_trait]
impl EndpointStateReader for HttpEndpoint {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn check_liveness(&self) -> bool {
        let healthy = matches!(
            tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, self.provider.get_block_number()).await,
            Ok(Ok(_))
        );
        if !healthy {
            warn!(endpoint = %self.url, "RPC endpoint failed liveness probe");
        }
        self.record_probe(healthy);
        healthy
    }

    async fn signer_nonce(&self) -> Result<u64, MarketplaceClientError> {
        self.provider
            .get_transaction_count(self.signer_address)
            .await
            .map_err(|e| MarketplaceClientError::Rpc(e.to_string()))
    }

    async fn network_fees(&self) -> Result<NetworkFees, MarketplaceClientError> {
        let gas_price =
            self.provider.get_gas_price().await.map_err(|e| MarketplaceClientError::Rpc(e.to_string()))?;
        let base_fee = match self.provider.get_fee_history(1, BlockNumberOrTag::Latest, &[]).await {
            Ok(history) => history.base_fee_per_gas.last().copied().filter(|fee| *fee > 0),
            Err(e) => {
                debug!(endpoint = %self.url, error = %e, "Fee history unavailable, falling back to legacy pricing");
                None
            }
        };
        let suggested_priority_fee = self.provider.get_max_priority_fee_per_gas().await.unwrap_or(0);
        Ok(NetworkFees { base_fee, suggested_priority_fee, gas_price })
    }
}

/// Ordered list of candidate endpoints. Every outer invocation restarts from
/// the first endpoint; there is no persistent ranking across calls.
pub struct RpcEndpointPool<E> {
    endpoints: Vec<Arc<E>>,
}

impl<E: EndpointStateReader> RpcEndpointPool<E> {
    pub fn new(endpoints: Vec<Arc<E>>) -> Result<Self, MarketplaceClientError> {
        if endpoints.is_empty() {
            return Err(MarketplaceClientError::NoEndpointsConfigured);
        }
        Ok(Self { endpoints })
    }

    pub fn endpoints(&self) -> &[Arc<E>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// First endpoint that passes the liveness probe, in configured order.
    pub async fn first_live(&self) -> Option<Arc<E>> {
        for endpoint in &self.endpoints {
            if endpoint.check_liveness().await {
                return Some(Arc::clone(endpoint));
            }
        }
        None
    }
}
