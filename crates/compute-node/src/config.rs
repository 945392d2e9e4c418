use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use ethereum_marketplace_client::executor::RetryConfig;
use ethereum_marketplace_client::gas::GasPolicyConfig;
use ethereum_marketplace_client::{EthereumMarketplaceClient, EthereumMarketplaceValidatedArgs};
use marketplace_client_interface::MarketplaceClient;
use tracing::info;

use crate::backend::{InferenceBackend, RuleBasedSpamClassifier};
use crate::cli::RunCmd;
use crate::content_store::{ContentStore, IpfsGatewayClient};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::indexer::IndexerConfig;
use crate::orchestrator::ServiceParams;
use crate::server::ServerParams;

/// Everything the daemon needs, built once at startup and dependency-injected
/// into the services. No global state.
pub struct Config {
    chain_id: u64,
    marketplace: Arc<dyn MarketplaceClient>,
    backend: Arc<dyn InferenceBackend>,
    content_store: Arc<dyn ContentStore>,
    service_params: ServiceParams,
    indexer_config: IndexerConfig,
    server_params: ServerParams,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config").field("chain_id", &self.chain_id).finish_non_exhaustive()
    }
}

impl Config {
    /// Validates the raw CLI/environment values and wires the clients.
    /// Missing required values or malformed addresses/keys are fatal here;
    /// the node must not run partially configured.
    pub async fn setup(run_cmd: &RunCmd) -> OrchestratorResult<Self> {
        let marketplace_contract_address = Address::from_str(&run_cmd.marketplace_args.marketplace_contract_address)
            .map_err(|e| OrchestratorError::InvalidAddress {
                value: run_cmd.marketplace_args.marketplace_contract_address.clone(),
                message: e.to_string(),
            })?;

        if run_cmd.gas_args.fee_increase_factor <= 1.0 {
            return Err(OrchestratorError::InvalidConfig {
                name: "fee_increase_factor",
                message: format!("must be greater than 1, got {}", run_cmd.gas_args.fee_increase_factor),
            });
        }
        if run_cmd.gas_args.replacement_bump_percent < 30 {
            return Err(OrchestratorError::InvalidConfig {
                name: "replacement_bump_percent",
                message: format!(
                    "must be at least 30 to outbid a pending transaction, got {}",
                    run_cmd.gas_args.replacement_bump_percent
                ),
            });
        }

        let marketplace_args = EthereumMarketplaceValidatedArgs {
            rpc_urls: run_cmd.marketplace_args.rpc_urls.clone(),
            private_key: run_cmd.marketplace_args.private_key.clone(),
            marketplace_contract_address,
            gas: GasPolicyConfig {
                min_priority_fee: run_cmd.gas_args.min_priority_fee_wei,
                min_gas_price: run_cmd.gas_args.min_gas_price_wei,
                max_gas_price: run_cmd.gas_args.max_gas_price_wei,
                fee_increase_factor: run_cmd.gas_args.fee_increase_factor,
                replacement_bump_percent: run_cmd.gas_args.replacement_bump_percent,
                gas_limit: run_cmd.gas_args.gas_limit,
            },
            retry: RetryConfig {
                max_attempts: run_cmd.retry_args.tx_max_attempts,
                base_delay: Duration::from_millis(run_cmd.retry_args.tx_base_delay_ms),
                max_delay: Duration::from_millis(run_cmd.retry_args.tx_max_delay_ms),
            },
        };
        let marketplace: Arc<dyn MarketplaceClient> =
            Arc::new(EthereumMarketplaceClient::new_with_args(&marketplace_args)?);

        let backend: Arc<dyn InferenceBackend> = Arc::new(RuleBasedSpamClassifier::new());
        let content_store: Arc<dyn ContentStore> = Arc::new(IpfsGatewayClient::new(
            run_cmd.content_args.content_gateway_url.clone(),
            run_cmd.content_args.content_api_url.clone(),
        ));

        Ok(Self {
            chain_id: run_cmd.marketplace_args.chain_id,
            marketplace,
            backend,
            content_store,
            service_params: ServiceParams {
                polling_interval: Duration::from_secs(run_cmd.service_args.polling_interval_secs),
                max_concurrent_requests: run_cmd.service_args.max_concurrent_requests,
                inference_timeout: Duration::from_secs(run_cmd.service_args.inference_timeout_secs),
                drain_timeout: Duration::from_secs(run_cmd.service_args.drain_timeout_secs),
            },
            indexer_config: IndexerConfig {
                cache_ttl: Duration::from_secs(run_cmd.service_args.cache_ttl_secs),
                backfill_interval: Duration::from_secs(run_cmd.service_args.backfill_interval_secs),
                maintenance_interval: Duration::from_secs(run_cmd.service_args.maintenance_interval_secs),
            },
            server_params: ServerParams { host: run_cmd.server_args.host.clone(), port: run_cmd.server_args.port },
        })
    }

    /// Startup probes: at least one RPC endpoint must answer, and the node's
    /// account must be authorized by the contract.
    pub async fn startup_checks(&self) -> OrchestratorResult<()> {
        let node = self.marketplace.node_address();
        let authorized = self
            .marketplace
            .is_authorized_node(node)
            .await
            .map_err(|e| OrchestratorError::NoReachableRpc(e.to_string()))?;
        if !authorized {
            return Err(OrchestratorError::UnauthorizedNode(node));
        }
        info!(node = %node, chain_id = self.chain_id, "Compute node authorized by marketplace contract");
        Ok(())
    }

    pub fn marketplace(&self) -> Arc<dyn MarketplaceClient> {
        Arc::clone(&self.marketplace)
    }

    pub fn backend(&self) -> Arc<dyn InferenceBackend> {
        Arc::clone(&self.backend)
    }

    pub fn content_store(&self) -> Arc<dyn ContentStore> {
        Arc::clone(&self.content_store)
    }

    pub fn service_params(&self) -> &ServiceParams {
        &self.service_params
    }

    pub fn indexer_config(&self) -> &IndexerConfig {
        &self.indexer_config
    }

    pub fn server_params(&self) -> &ServerParams {
        &self.server_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use assert_matches::assert_matches;
    use clap::Parser;

    fn run_cmd(extra: &[&str]) -> RunCmd {
        let mut args = vec![
            "compute-node",
            "run",
            "--rpc-urls",
            "http://localhost:8545",
            "--private-key",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            "--marketplace-contract-address",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
        ];
        args.extend_from_slice(extra);
        let Commands::Run { run_command } = Cli::try_parse_from(args).unwrap().command;
        *run_command
    }

    #[tokio::test]
    async fn valid_configuration_builds() {
        let config = Config::setup(&run_cmd(&[])).await.unwrap();
        assert_eq!(config.service_params().max_concurrent_requests, 5);
        assert_eq!(config.indexer_config().backfill_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn malformed_contract_address_is_fatal() {
        let mut cmd = run_cmd(&[]);
        cmd.marketplace_args.marketplace_contract_address = "not-an-address".into();
        assert_matches!(Config::setup(&cmd).await, Err(OrchestratorError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn malformed_private_key_is_fatal() {
        let mut cmd = run_cmd(&[]);
        cmd.marketplace_args.private_key = "garbage".into();
        assert_matches!(Config::setup(&cmd).await, Err(OrchestratorError::MarketplaceClient(_)));
    }

    #[tokio::test]
    async fn replacement_bump_below_thirty_percent_is_fatal() {
        let cmd = run_cmd(&["--replacement-bump-percent", "10"]);
        assert_matches!(
            Config::setup(&cmd).await,
            Err(OrchestratorError::InvalidConfig { name: "replacement_bump_percent", .. })
        );
    }

    #[tokio::test]
    async fn non_escalating_fee_factor_is_fatal() {
        let cmd = run_cmd(&["--fee-increase-factor", "0.9"]);
        assert_matches!(
            Config::setup(&cmd).await,
            Err(OrchestratorError::InvalidConfig { name: "fee_increase_factor", .. })
        );
    }
}
