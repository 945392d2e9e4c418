//! In-memory view of marketplace request state.
//!
//! The contract's bulk pending-request view can exceed block gas limits once
//! the backlog grows, so everything downstream reads from this index instead:
//! a one-time backfill seeds the pending set, a live event subscription keeps
//! it current, and periodic maintenance bounds memory and corrects drift from
//! missed events (for example after a dropped connection). The indexer never
//! writes on-chain state; on errors it degrades to stale data rather than
//! crashing the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use color_eyre::eyre::Result;
use marketplace_client_interface::{InferenceRequest, MarketplaceClient, RequestEvent, RequestStatus};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Cache entries older than this are evicted during maintenance.
    pub cache_ttl: Duration,
    /// A backfill older than this is re-run during maintenance.
    pub backfill_interval: Duration,
    pub maintenance_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            backfill_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

struct CachedRequest {
    request: InferenceRequest,
    cached_at: Instant,
}

#[derive(Default)]
struct IndexerState {
    pending: BTreeSet<u64>,
    cache: HashMap<u64, CachedRequest>,
}

pub struct RequestIndexer {
    marketplace: Arc<dyn MarketplaceClient>,
    state: RwLock<IndexerState>,
    backfill_in_progress: AtomicBool,
    last_backfill: Mutex<Option<Instant>>,
    config: IndexerConfig,
}

impl RequestIndexer {
    pub fn new(marketplace: Arc<dyn MarketplaceClient>, config: IndexerConfig) -> Self {
        Self {
            marketplace,
            state: RwLock::new(IndexerState::default()),
            backfill_in_progress: AtomicBool::new(false),
            last_backfill: Mutex::new(None),
            config,
        }
    }

    /// Seeds the pending set from the contract's bulk view. Concurrent calls
    /// collapse into one; failures keep the previous (stale) view.
    pub async fn index_pending_requests(&self) {
        if self.backfill_in_progress.swap(true, Ordering::SeqCst) {
            debug!("Backfill already in progress, skipping");
            return;
        }

        match self.marketplace.get_pending_requests().await {
            Ok(ids) => {
                let count = ids.len();
                self.state.write().await.pending = ids.into_iter().collect();
                *self.last_backfill.lock().expect("backfill timestamp lock poisoned") = Some(Instant::now());
                info!(count, "Indexed pending requests from contract backfill");
            }
            Err(e) => warn!(error = %e, "Pending-request backfill failed, keeping stale view"),
        }

        self.backfill_in_progress.store(false, Ordering::SeqCst);
    }

    /// Applies one lifecycle event to the local view. Pure cache mutation.
    pub async fn apply_event(&self, event: RequestEvent) {
        let mut state = self.state.write().await;
        match event {
            RequestEvent::Requested { request_id, user, model_id, payment, input_data_hash } => {
                state.pending.insert(request_id);
                state.cache.insert(
                    request_id,
                    CachedRequest {
                        request: InferenceRequest {
                            request_id,
                            model_id,
                            user,
                            payment,
                            input_data_hash,
                            result_hash: String::new(),
                            compute_node: Address::ZERO,
                            created_at: 0,
                            completed_at: 0,
                            status: RequestStatus::Pending,
                        },
                        cached_at: Instant::now(),
                    },
                );
                debug!(request_id, "Request added to pending set");
            }
            RequestEvent::Computing { request_id, compute_node } => {
                state.pending.remove(&request_id);
                if let Some(entry) = state.cache.get_mut(&request_id) {
                    entry.request.status = RequestStatus::Computing;
                    entry.request.compute_node = compute_node;
                    entry.cached_at = Instant::now();
                }
                debug!(request_id, node = %compute_node, "Request picked up");
            }
            RequestEvent::Completed { request_id, result_hash } => {
                state.pending.remove(&request_id);
                if let Some(entry) = state.cache.get_mut(&request_id) {
                    entry.request.status = RequestStatus::Completed;
                    entry.request.result_hash = result_hash;
                    entry.cached_at = Instant::now();
                }
                debug!(request_id, "Request completed");
            }
            RequestEvent::Failed { request_id, reason } => {
                state.pending.remove(&request_id);
                if let Some(entry) = state.cache.get_mut(&request_id) {
                    entry.request.status = RequestStatus::Failed;
                    entry.cached_at = Instant::now();
                }
                debug!(request_id, reason, "Request failed");
            }
        }
    }

    /// Snapshot of the pending set, replacing the gas-limited on-chain
    /// enumeration for every caller.
    pub async fn get_pending_requests(&self) -> Vec<u64> {
        self.state.read().await.pending.iter().copied().collect()
    }

    /// Cache hit returns immediately; a miss falls back to a direct contract
    /// read and caches the result.
    pub async fn get_request(&self, request_id: u64) -> Result<InferenceRequest> {
        if let Some(entry) = self.state.read().await.cache.get(&request_id) {
            return Ok(entry.request.clone());
        }
        let request = self.marketplace.get_request(request_id).await?;
        self.state
            .write()
            .await
            .cache
            .insert(request_id, CachedRequest { request: request.clone(), cached_at: Instant::now() });
        Ok(request)
    }

    /// Bounds memory and corrects drift: evicts expired cache entries and
    /// re-runs the backfill once the last one is old enough.
    pub async fn perform_maintenance(&self) {
        let now = Instant::now();
        {
            let mut state = self.state.write().await;
            let ttl = self.config.cache_ttl;
            let before = state.cache.len();
            state.cache.retain(|_, entry| now.duration_since(entry.cached_at) < ttl);
            let evicted = before - state.cache.len();
            if evicted > 0 {
                debug!(evicted, "Evicted expired request cache entries");
            }
        }

        let backfill_due = self
            .last_backfill
            .lock()
            .expect("backfill timestamp lock poisoned")
            .map_or(true, |at| at.elapsed() >= self.config.backfill_interval);
        if backfill_due {
            self.index_pending_requests().await;
        }
    }

    /// Single consumer task: drains the typed event channel and runs
    /// maintenance on a timer. Newly requested ids are forwarded so the
    /// orchestrator can react without waiting for the next polling sweep; a
    /// full notification channel is fine, polling is the backup path.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RequestEvent>,
        new_requests: mpsc::Sender<u64>,
        cancel: CancellationToken,
    ) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Indexer stopping");
                    break;
                }
                _ = maintenance.tick() => self.perform_maintenance().await,
                maybe = events.recv(), if events_open => match maybe {
                    Some(event) => {
                        let request_id = event.request_id();
                        let is_new = matches!(event, RequestEvent::Requested { .. });
                        self.apply_event(event).await;
                        if is_new {
                            let _ = new_requests.try_send(request_id);
                        }
                    }
                    None => {
                        warn!("Event channel closed, indexer degrades to periodic backfills");
                        events_open = false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use marketplace_client_interface::MockMarketplaceClient;
    use mockall::predicate::eq;

    fn indexer_with(marketplace: MockMarketplaceClient, config: IndexerConfig) -> RequestIndexer {
        RequestIndexer::new(Arc::new(marketplace), config)
    }

    fn requested(request_id: u64) -> RequestEvent {
        RequestEvent::Requested {
            request_id,
            user: Address::repeat_byte(0x22),
            model_id: 1,
            payment: U256::from(1_000u64),
            input_data_hash: format!("Qm{request_id}"),
        }
    }

    fn computing_request(request_id: u64) -> InferenceRequest {
        InferenceRequest {
            request_id,
            model_id: 1,
            user: Address::repeat_byte(0x22),
            payment: U256::from(1_000u64),
            input_data_hash: format!("Qm{request_id}"),
            result_hash: String::new(),
            compute_node: Address::repeat_byte(0x33),
            created_at: 0,
            completed_at: 0,
            status: RequestStatus::Computing,
        }
    }

    #[tokio::test]
    async fn lifecycle_replay_removes_id_from_pending_once_computing() {
        let indexer = indexer_with(MockMarketplaceClient::new(), IndexerConfig::default());

        indexer.apply_event(requested(42)).await;
        assert_eq!(indexer.get_pending_requests().await, vec![42]);

        indexer
            .apply_event(RequestEvent::Computing { request_id: 42, compute_node: Address::repeat_byte(0x33) })
            .await;
        assert!(indexer.get_pending_requests().await.is_empty());

        indexer.apply_event(RequestEvent::Completed { request_id: 42, result_hash: "QmResult".into() }).await;
        assert!(indexer.get_pending_requests().await.is_empty());

        let cached = indexer.get_request(42).await.unwrap();
        assert_eq!(cached.status, RequestStatus::Completed);
        assert_eq!(cached.result_hash, "QmResult");
    }

    #[tokio::test]
    async fn failure_event_clears_pending_and_marks_cache() {
        let indexer = indexer_with(MockMarketplaceClient::new(), IndexerConfig::default());
        indexer.apply_event(requested(7)).await;
        indexer.apply_event(RequestEvent::Failed { request_id: 7, reason: "backend down".into() }).await;

        assert!(indexer.get_pending_requests().await.is_empty());
        assert_eq!(indexer.get_request(7).await.unwrap().status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn cache_miss_reads_through_the_contract_once() {
        let mut marketplace = MockMarketplaceClient::new();
        marketplace
            .expect_get_request()
            .with(eq(42))
            .times(1)
            .returning(|id| Ok(computing_request(id)));

        let indexer = indexer_with(marketplace, IndexerConfig::default());
        assert_eq!(indexer.get_request(42).await.unwrap().status, RequestStatus::Computing);
        // Served from cache now; a second contract read would violate times(1).
        assert_eq!(indexer.get_request(42).await.unwrap().request_id, 42);
    }

    #[tokio::test]
    async fn backfill_replaces_the_pending_set() {
        let mut marketplace = MockMarketplaceClient::new();
        marketplace.expect_get_pending_requests().times(1).returning(|| Ok(vec![3, 1, 2]));

        let indexer = indexer_with(marketplace, IndexerConfig::default());
        indexer.apply_event(requested(99)).await;
        indexer.index_pending_requests().await;

        assert_eq!(indexer.get_pending_requests().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_backfill_keeps_the_stale_view() {
        let mut marketplace = MockMarketplaceClient::new();
        marketplace
            .expect_get_pending_requests()
            .returning(|| Err(color_eyre::eyre::eyre!("view exceeds gas limit")));

        let indexer = indexer_with(marketplace, IndexerConfig::default());
        indexer.apply_event(requested(5)).await;
        indexer.index_pending_requests().await;

        assert_eq!(indexer.get_pending_requests().await, vec![5]);
    }

    #[tokio::test]
    async fn maintenance_evicts_expired_entries_and_refreshes_backfill() {
        let mut marketplace = MockMarketplaceClient::new();
        marketplace.expect_get_pending_requests().times(1).returning(|| Ok(vec![8]));

        let config = IndexerConfig { cache_ttl: Duration::ZERO, ..IndexerConfig::default() };
        let indexer = indexer_with(marketplace, config);
        indexer.apply_event(requested(8)).await;

        indexer.perform_maintenance().await;

        assert_eq!(indexer.get_pending_requests().await, vec![8]);
        assert!(indexer.state.read().await.cache.is_empty());
    }
}
