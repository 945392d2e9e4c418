//! Poll-based watcher that turns raw contract logs into typed
//! [`RequestEvent`]s on an mpsc channel. The indexer is the single consumer
//! of that channel; this module never touches indexer state itself.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::rpc::types::Log;
use futures::stream::{self, Stream, StreamExt};
use marketplace_client_interface::RequestEvent;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::endpoint::HttpEndpoint;
use crate::error::MarketplaceClientError;
use crate::IInferenceMarketplace::{InferenceCompleted, InferenceComputing, InferenceFailed, InferenceRequested};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

type EventItem = Result<Option<RequestEvent>, String>;
type BoxedEventStream = Pin<Box<dyn Stream<Item = EventItem> + Send>>;

/// Long-running watcher task. Re-establishes the underlying log filters with
/// a delay whenever the stream drops, until the receiving side goes away.
pub(crate) async fn watch_marketplace_events(endpoint: Arc<HttpEndpoint>, sender: mpsc::Sender<RequestEvent>) {
    loop {
        if let Err(e) = stream_events(&endpoint, &sender).await {
            warn!(error = %e, "Marketplace event stream dropped, resubscribing");
        }
        if sender.is_closed() {
            debug!("Event receiver dropped, stopping marketplace watcher");
            return;
        }
        sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn stream_events(
    endpoint: &Arc<HttpEndpoint>,
    sender: &mpsc::Sender<RequestEvent>,
) -> Result<(), MarketplaceClientError> {
    let contract = endpoint.contract();

    let requested = contract.event_filter::<InferenceRequested>().watch().await.map_err(watch_error)?;
    let computing = contract.event_filter::<InferenceComputing>().watch().await.map_err(watch_error)?;
    let completed = contract.event_filter::<InferenceCompleted>().watch().await.map_err(watch_error)?;
    let failed = contract.event_filter::<InferenceFailed>().watch().await.map_err(watch_error)?;

    let mut merged = stream::select_all(vec![
        map_stream(requested.into_stream(), decode_requested),
        map_stream(computing.into_stream(), decode_computing),
        map_stream(completed.into_stream(), decode_completed),
        map_stream(failed.into_stream(), decode_failed),
    ]);

    while let Some(item) = merged.next().await {
        match item {
            Ok(Some(event)) => {
                debug!(request_id = event.request_id(), "Decoded marketplace event");
                if sender.send(event).await.is_err() {
                    return Ok(());
                }
            }
            // An id wider than 64 bits was already logged by the decoder.
            Ok(None) => {}
            Err(message) => return Err(MarketplaceClientError::EventStream { message }),
        }
    }
    Ok(())
}

fn watch_error(error: alloy::transports::RpcError<alloy::transports::TransportErrorKind>) -> MarketplaceClientError {
    MarketplaceClientError::EventStream { message: format!("failed to install log filter: {error}") }
}

fn map_stream<S, E, Err, F>(stream: S, decode: F) -> BoxedEventStream
where
    S: Stream<Item = Result<(E, Log), Err>> + Send + 'static,
    E: Send + 'static,
    Err: std::fmt::Display,
    F: Fn(E) -> Option<RequestEvent> + Send + 'static,
{
    Box::pin(stream.map(move |item| item.map(|(event, _log)| decode(event)).map_err(|e| e.to_string())))
}

fn decode_requested(event: InferenceRequested) -> Option<RequestEvent> {
    Some(RequestEvent::Requested {
        request_id: event_id(event.requestId)?,
        user: event.user,
        model_id: event_id(event.modelId)?,
        payment: event.payment,
        input_data_hash: event.inputDataHash,
    })
}

fn decode_computing(event: InferenceComputing) -> Option<RequestEvent> {
    Some(RequestEvent::Computing { request_id: event_id(event.requestId)?, compute_node: event.computeNode })
}

fn decode_completed(event: InferenceCompleted) -> Option<RequestEvent> {
    Some(RequestEvent::Completed { request_id: event_id(event.requestId)?, result_hash: event.resultHash })
}

fn decode_failed(event: InferenceFailed) -> Option<RequestEvent> {
    Some(RequestEvent::Failed { request_id: event_id(event.requestId)?, reason: event.reason })
}

fn event_id(value: U256) -> Option<u64> {
    match u64::try_from(value) {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(%value, "Event carries a request id wider than 64 bits, skipping");
            None
        }
    }
}
