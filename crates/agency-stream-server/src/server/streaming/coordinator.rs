use crate::server::{
    config::ServerConfig,
    streaming::{
        processor::{BatchSender, stream_batches},
        request::{RequestMachine, RequestState},
    },
    telemetry::{
        increment_requests, increment_requests_skipped, increment_stream_errors,
        record_records_per_request,
    },
};
use agency_stream_core::proto::GenerationRequest;
use futures::{Stream, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::Instrument;

/// Outcome counters for one bidirectional stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub accepted: usize,
    pub skipped: usize,
    pub completed: usize,
    pub aborted: usize,
}

/// Reads generation requests from one stream and runs each accepted request
/// as its own task.
///
/// Requests are tracked independently by their request id: a slow (paced)
/// request never holds up another request on the same stream.
///
/// # Behavior
///
/// - Invalid requests (see [`RequestMachine::begin`]) are logged and skipped;
///   they do not affect other requests.
/// - When the peer finishes sending (half-close), intake stops but requests
///   already accepted run to completion.
/// - An inbound transport error, the peer dropping the response stream, or
///   `cancel` firing cancels every request of this stream.
///
/// Returns once every spawned request task has finished; dropping `resp_tx`
/// then ends the response stream.
pub async fn dispatch_requests<S>(
    mut inbound: S,
    resp_tx: BatchSender,
    config: ServerConfig,
    cancel: CancellationToken,
) -> DispatchSummary
where
    S: Stream<Item = Result<GenerationRequest, Status>> + Unpin,
{
    let mut summary = DispatchSummary::default();
    let mut requests = JoinSet::new();

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            () = resp_tx.closed() => {
                tracing::debug!("Peer dropped the response stream");
                cancel.cancel();
                break;
            }
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(request)) => {
                let mut machine = RequestMachine::new(&request);

                if let Err(e) = machine.begin(&config) {
                    tracing::warn!(
                        request_id = %machine.request_id(),
                        count = request.count,
                        "Skipping request: {e}"
                    );
                    increment_requests_skipped();
                    summary.skipped += 1;
                    continue;
                }

                tracing::info!(
                    request_id = %machine.request_id(),
                    count = machine.total(),
                    batch_size = machine.batch_size(),
                    "Processing request"
                );
                increment_requests();
                record_records_per_request(machine.total() as f64);
                summary.accepted += 1;

                let span = tracing::info_span!("request", request_id = %machine.request_id());
                let resp_tx = resp_tx.clone();
                let cancel = cancel.clone();
                let wait_time = config.wait_time;

                requests.spawn(
                    async move {
                        if let Err(e) =
                            stream_batches(&mut machine, &resp_tx, wait_time, &cancel).await
                        {
                            tracing::warn!(sent = machine.sent(), "Request aborted: {e}");
                        }
                        machine.state()
                    }
                    .instrument(span),
                );
            }
            Some(Err(status)) => {
                tracing::warn!(
                    code = ?status.code(),
                    "Inbound stream failed: {}",
                    status.message()
                );
                increment_stream_errors();
                cancel.cancel();
                break;
            }
            None => {
                tracing::debug!("Peer finished sending requests");
                break;
            }
        }
    }

    while let Some(joined) = requests.join_next().await {
        match joined {
            Ok(RequestState::Completed) => summary.completed += 1,
            Ok(_) => summary.aborted += 1,
            Err(e) => {
                tracing::error!("Request task failed: {e}");
                summary.aborted += 1;
            }
        }
    }

    summary
}
