//! Per-request state machine: pickup, inference, submit-or-report-failure.
//!
//! The processing map is the sole shared guard: an atomic check-and-insert
//! under its lock gives at-most-one concurrent handler per request id (events
//! and polling may both surface the same request), and the unconditional
//! removal at the end restores the invariant on every path, including panics
//! in the handler. A semaphore bounds how many requests are in flight at
//! once.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::Result;
use futures::FutureExt;
use marketplace_client_interface::MarketplaceClient;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::InferenceBackend;
use crate::content_store::PayloadStore;
use crate::error::RequestError;
use crate::indexer::RequestIndexer;
use crate::types::{NodeStatus, ProcessingEntry, ProcessingStage, Stats};

const READ_RETRY_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ServiceParams {
    pub polling_interval: Duration,
    pub max_concurrent_requests: usize,
    pub inference_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for ServiceParams {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            max_concurrent_requests: 5,
            inference_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct InferenceOrchestrator {
    marketplace: Arc<dyn MarketplaceClient>,
    backend: Arc<dyn InferenceBackend>,
    payloads: Arc<PayloadStore>,
    indexer: Arc<RequestIndexer>,
    processing: Mutex<HashMap<u64, ProcessingEntry>>,
    permits: Semaphore,
    stats: Stats,
    params: ServiceParams,
    cancel: CancellationToken,
}

impl InferenceOrchestrator {
    pub fn new(
        marketplace: Arc<dyn MarketplaceClient>,
        backend: Arc<dyn InferenceBackend>,
        payloads: Arc<PayloadStore>,
        indexer: Arc<RequestIndexer>,
        params: ServiceParams,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            marketplace,
            backend,
            payloads,
            indexer,
            processing: Mutex::new(HashMap::new()),
            permits: Semaphore::new(params.max_concurrent_requests),
            stats: Stats::new(),
            params,
            cancel,
        }
    }

    /// Drives one request through pickup, inference and submission. Safe to
    /// call with the same id from multiple sources concurrently: only the
    /// first caller proceeds past the check-and-insert.
    pub async fn handle_new_request(self: &Arc<Self>, request_id: u64) {
        if self.cancel.is_cancelled() {
            debug!(request_id, "Shutdown in progress, not accepting new requests");
            return;
        }

        {
            let mut processing = self.processing.lock().await;
            if processing.contains_key(&request_id) {
                debug!(request_id, "Request already being processed, ignoring duplicate delivery");
                return;
            }
            processing.insert(
                request_id,
                ProcessingEntry { request_id, started_at: Instant::now(), stage: ProcessingStage::Processing },
            );
        }

        let outcome = AssertUnwindSafe(self.process_request(request_id)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                self.stats.record_success();
                info!(request_id, "Request processed successfully");
            }
            Ok(Err(e)) => {
                warn!(request_id, error = %e, "Request failed, reporting failure on-chain");
                self.report_failure_best_effort(request_id, &e.to_string()).await;
                self.stats.record_failure();
            }
            Err(_) => {
                error!(request_id, "Request handler panicked, reporting failure on-chain");
                self.report_failure_best_effort(request_id, "internal handler error").await;
                self.stats.record_failure();
            }
        }

        // Unconditional removal, even when the failure report above errored.
        self.processing.lock().await.remove(&request_id);
    }

    async fn process_request(&self, request_id: u64) -> Result<(), RequestError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RequestError::Internal(format!("concurrency limiter closed: {e}")))?;

        self.marketplace
            .pickup_request(request_id)
            .await
            .map_err(|e| RequestError::Pickup(e.to_string()))?;
        self.mark_picked_up(request_id).await;

        let request = self
            .read_with_retry("get_request", || self.marketplace.get_request(request_id))
            .await?;
        let node_address = self.marketplace.node_address();
        if request.compute_node != node_address {
            return Err(RequestError::AssignmentMismatch { request_id, assigned: request.compute_node });
        }

        let model = self
            .read_with_retry("get_model", || self.marketplace.get_model(request.model_id))
            .await?;
        if !model.active {
            return Err(RequestError::ModelInactive(model.model_id));
        }

        let payload = self.payloads.resolve(&request.input_data_hash).await;
        let classification =
            match tokio::time::timeout(self.params.inference_timeout, self.backend.classify(&payload)).await {
                Ok(Ok(classification)) => classification,
                Ok(Err(e)) => return Err(RequestError::Inference(e.to_string())),
                Err(_) => return Err(RequestError::Timeout(self.params.inference_timeout)),
            };
        info!(
            request_id,
            label = %classification.label,
            confidence = classification.confidence,
            "Inference finished"
        );

        let result_data = serde_json::json!({
            "request_id": request_id,
            "model_id": model.model_id,
            "label": classification.label,
            "confidence": classification.confidence,
        })
        .to_string();
        let result_hash = self.payloads.store_result(result_data.as_bytes()).await;

        self.marketplace
            .submit_result(request_id, &result_hash, &result_data)
            .await
            .map_err(|e| RequestError::Submit(e.to_string()))?;
        Ok(())
    }

    /// Read-only lookups tolerate transient RPC failure with a small local
    /// retry; they are queries, not state changes, so they stay off the
    /// transaction executor.
    async fn read_with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T, RequestError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 0..READ_RETRY_ATTEMPTS {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    debug!(call = label, attempt, error = %last_error, "Read call failed");
                }
            }
            if attempt + 1 < READ_RETRY_ATTEMPTS {
                sleep(READ_RETRY_DELAY).await;
            }
        }
        Err(RequestError::Fetch(last_error))
    }

    async fn mark_picked_up(&self, request_id: u64) {
        if let Some(entry) = self.processing.lock().await.get_mut(&request_id) {
            entry.stage = ProcessingStage::PickedUp;
        }
    }

    /// Best-effort by design: the request's payment is only refundable once a
    /// failure is recorded on-chain, but a failing report must not mask the
    /// original error or crash the handler.
    async fn report_failure_best_effort(&self, request_id: u64, reason: &str) {
        if let Err(e) = self.marketplace.report_failure(request_id, reason).await {
            error!(request_id, error = %e, "Failed to report request failure on-chain");
        }
    }

    /// Periodic sweep over the indexed pending set; the backup path covering
    /// missed events.
    pub async fn poll_pending_requests(self: &Arc<Self>) {
        let pending = self.indexer.get_pending_requests().await;
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Sweeping pending requests");
        for request_id in pending {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.processing.lock().await.contains_key(&request_id) {
                continue;
            }
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move { orchestrator.handle_new_request(request_id).await });
        }
    }

    /// Main loop: reacts to freshly indexed requests and runs the periodic
    /// sweep until cancelled.
    pub async fn run(self: Arc<Self>, mut new_requests: mpsc::Receiver<u64>) {
        let mut poll = tokio::time::interval(self.params.polling_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notifications_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Orchestrator loop stopping");
                    break;
                }
                _ = poll.tick() => self.poll_pending_requests().await,
                maybe = new_requests.recv(), if notifications_open => match maybe {
                    Some(request_id) => {
                        let orchestrator = Arc::clone(&self);
                        tokio::spawn(async move { orchestrator.handle_new_request(request_id).await });
                    }
                    None => {
                        warn!("New-request channel closed, relying on polling sweeps only");
                        notifications_open = false;
                    }
                },
            }
        }
    }

    /// Stops accepting new work and waits for in-flight requests to drain,
    /// bounded by the configured timeout, so on-chain submissions are not
    /// abandoned mid-transaction.
    pub async fn stop(&self) {
        info!("Stopping orchestrator, draining in-flight requests");
        self.cancel.cancel();

        let deadline = Instant::now() + self.params.drain_timeout;
        loop {
            let remaining = self.processing.lock().await.len();
            if remaining == 0 {
                info!("All in-flight requests drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Drain timeout reached with requests still in flight");
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub async fn status(&self) -> NodeStatus {
        let mut currently_processing: Vec<u64> = self.processing.lock().await.keys().copied().collect();
        currently_processing.sort_unstable();
        NodeStatus {
            uptime_secs: self.stats.uptime().as_secs(),
            stats: self.stats.snapshot(),
            currently_processing,
            backend: self.backend.info(),
        }
    }
}
