//! Retry engine for state-changing contract calls.
//!
//! Every transaction the node sends goes through [`TransactionExecutor`]:
//! endpoint failover in the outer loop, capped exponential backoff in the
//! inner loop, and an immediate same-nonce replacement resubmission when the
//! network rejects an attempt as underpriced.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointStateReader, RpcEndpointPool};
use crate::error::{MarketplaceClientError, SendTransactionError};
use crate::gas::{GasPolicy, GasSettings};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(30) }
    }
}

pub struct TransactionExecutor<E> {
    pool: RpcEndpointPool<E>,
    gas_policy: GasPolicy,
    retry: RetryConfig,
}

impl<E: EndpointStateReader> TransactionExecutor<E> {
    pub fn new(pool: RpcEndpointPool<E>, gas_policy: GasPolicy, retry: RetryConfig) -> Self {
        Self { pool, gas_policy, retry }
    }

    pub fn pool(&self) -> &RpcEndpointPool<E> {
        &self.pool
    }

    /// Runs `operation` until it succeeds or every endpoint and attempt is
    /// exhausted. `operation` performs exactly one on-chain call with the gas
    /// settings and nonce it is handed; settings are recomputed for every
    /// attempt. The first success short-circuits everything else; exhaustion
    /// surfaces the last observed error.
    pub async fn execute_with_retry<F, Fut>(&self, label: &str, operation: F) -> Result<B256, MarketplaceClientError>
    where
        F: Fn(Arc<E>, GasSettings) -> Fut,
        Fut: Future<Output = Result<B256, SendTransactionError>>,
    {
        let mut last_error: Option<String> = None;
        let mut total_attempts = 0u32;

        for endpoint in self.pool.endpoints() {
            // A dead endpoint is skipped without consuming retry attempts.
            if !endpoint.check_liveness().await {
                continue;
            }

            for attempt in 0..self.retry.max_attempts {
                total_attempts += 1;

                let settings = match self.prepare_settings(endpoint, attempt).await {
                    Ok(settings) => settings,
                    Err(e) => {
                        warn!(tx = label, endpoint = %endpoint.url(), attempt, error = %e, "Failed to prepare gas settings");
                        last_error = Some(e.to_string());
                        self.backoff(attempt).await;
                        continue;
                    }
                };

                debug!(tx = label, endpoint = %endpoint.url(), attempt, nonce = settings.nonce, "Sending transaction");
                match operation(Arc::clone(endpoint), settings).await {
                    Ok(tx_hash) => {
                        info!(tx = label, endpoint = %endpoint.url(), attempt, tx_hash = %tx_hash, "Transaction accepted");
                        return Ok(tx_hash);
                    }
                    Err(e) if e.is_replacement_underpriced() => {
                        warn!(tx = label, nonce = settings.nonce, "Transaction underpriced, resubmitting with bumped fees");
                        let replacement = self.gas_policy.compute_replacement_gas_settings(&settings);
                        match operation(Arc::clone(endpoint), replacement).await {
                            Ok(tx_hash) => {
                                info!(tx = label, tx_hash = %tx_hash, "Replacement transaction accepted");
                                return Ok(tx_hash);
                            }
                            Err(e) => {
                                warn!(tx = label, attempt, error = %e, "Replacement transaction failed");
                                last_error = Some(e.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(tx = label, endpoint = %endpoint.url(), attempt, error = %e, "Transaction attempt failed");
                        last_error = Some(e.to_string());
                    }
                }

                if attempt + 1 < self.retry.max_attempts {
                    self.backoff(attempt).await;
                }
            }
            // Attempt counter resets for the next endpoint.
        }

        Err(MarketplaceClientError::EndpointsExhausted {
            attempts: total_attempts,
            last_error: last_error.unwrap_or_else(|| "no live RPC endpoint".to_string()),
        })
    }

    async fn prepare_settings(&self, endpoint: &Arc<E>, attempt: u32) -> Result<GasSettings, MarketplaceClientError> {
        let nonce = endpoint.signer_nonce().await?;
        let fees = endpoint.network_fees().await?;
        Ok(self.gas_policy.compute_gas_settings(&fees, attempt, nonce))
    }

    async fn backoff(&self, attempt: u32) {
        let delay = backoff_delay(&self.retry, attempt);
        sleep(delay).await;
    }
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    retry.base_delay.saturating_mul(2u32.saturating_pow(attempt)).min(retry.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MockEndpointStateReader;
    use crate::gas::{FeeSettings, GasPolicyConfig, NetworkFees};
    use assert_matches::assert_matches;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig { max_attempts, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(4) }
    }

    fn mock_endpoint(name: &str, live: bool) -> MockEndpointStateReader {
        let mut endpoint = MockEndpointStateReader::new();
        endpoint.expect_url().return_const(Url::parse(&format!("http://{name}.localhost:8545")).unwrap());
        endpoint.expect_check_liveness().returning(move || live);
        endpoint.expect_signer_nonce().returning(|| Ok(11));
        endpoint.expect_network_fees().returning(|| {
            Ok(NetworkFees {
                base_fee: Some(10_000_000_000),
                suggested_priority_fee: 2_000_000_000,
                gas_price: 12_000_000_000,
            })
        });
        endpoint
    }

    fn executor(endpoints: Vec<MockEndpointStateReader>, max_attempts: u32) -> TransactionExecutor<MockEndpointStateReader> {
        let pool = RpcEndpointPool::new(endpoints.into_iter().map(Arc::new).collect()).unwrap();
        TransactionExecutor::new(pool, GasPolicy::new(GasPolicyConfig::default()), fast_retry(max_attempts))
    }

    fn send_error(message: &str) -> SendTransactionError {
        SendTransactionError::classify(alloy::contract::Error::TransportError(
            alloy::transports::RpcError::local_usage_str(message),
        ))
    }

    #[tokio::test]
    async fn success_short_circuits_remaining_attempts() {
        let executor = executor(vec![mock_endpoint("a", true)], 5);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute_with_retry("test", |_endpoint, _settings| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(B256::ZERO) }
            })
            .await;

        assert_matches!(result, Ok(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_endpoints_are_skipped_without_consuming_attempts() {
        let endpoints = vec![mock_endpoint("dead1", false), mock_endpoint("dead2", false), mock_endpoint("live", true)];
        let executor = executor(endpoints, 5);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute_with_retry("test", |endpoint, _settings| {
                calls.fetch_add(1, Ordering::SeqCst);
                let url = endpoint.url().clone();
                async move {
                    assert_eq!(url.host_str(), Some("live.localhost"));
                    Ok(B256::ZERO)
                }
            })
            .await;

        assert_matches!(result, Ok(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn underpriced_rejection_triggers_immediate_replacement_on_same_nonce() {
        let executor = executor(vec![mock_endpoint("a", true)], 5);
        let calls = AtomicU32::new(0);
        let first_nonce = AtomicU32::new(0);

        let result = executor
            .execute_with_retry("test", |_endpoint, settings| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    first_nonce.store(settings.nonce as u32, Ordering::SeqCst);
                    return async { Err(send_error("replacement transaction underpriced")) }.boxed();
                }
                // The replacement keeps the nonce and escalates the fees.
                assert_eq!(settings.nonce as u32, first_nonce.load(Ordering::SeqCst));
                assert_matches!(settings.fee, FeeSettings::DynamicFee { .. });
                async { Ok(B256::ZERO) }.boxed()
            })
            .await;

        assert_matches!(result, Ok(_));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausting_every_endpoint_surfaces_the_last_error() {
        let endpoints = vec![mock_endpoint("a", true), mock_endpoint("b", true)];
        let executor = executor(endpoints, 2);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute_with_retry("test", |_endpoint, _settings| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(send_error("insufficient funds")) }
            })
            .await;

        // Two endpoints, two attempts each.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_matches!(
            result,
            Err(MarketplaceClientError::EndpointsExhausted { attempts: 4, last_error }) => {
                assert!(last_error.contains("insufficient funds"));
            }
        );
    }

    #[tokio::test]
    async fn no_live_endpoint_reports_zero_attempts() {
        let executor = executor(vec![mock_endpoint("dead", false)], 3);

        let result = executor
            .execute_with_retry("test", |_endpoint, _settings| async { Ok(B256::ZERO) })
            .await;

        assert_matches!(result, Err(MarketplaceClientError::EndpointsExhausted { attempts: 0, .. }));
    }
}
