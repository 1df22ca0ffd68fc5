use crate::server::{
    streaming::request::RequestMachine,
    telemetry::{increment_batches_sent, increment_records_generated},
};
use agency_stream_core::{
    Error, generator,
    proto::{ContractRequestBatch, ContractRequestMessage},
};
use core::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Sending half of a stream's response channel.
pub type BatchSender = mpsc::Sender<Result<ContractRequestBatch, Status>>;

/// Emits every batch of a started request into `resp_tx`.
///
/// Batches are produced strictly one after the other. Between two batches the
/// task sleeps for `wait_time` (when non-zero); the sleep only suspends this
/// request, other requests on the same stream keep going.
///
/// # Behavior
///
/// - Each batch is generated with [`generator::generate`] just before it is
///   sent, tagged with the request id and the final marker from the
///   [`RequestMachine`].
/// - Stops after the final batch ([`RequestState::Completed`]).
/// - On cancellation or when the peer dropped the response stream, stops
///   immediately and leaves the machine [`RequestState::Aborted`]. No partial
///   batch is sent and no final marker is fabricated.
///
/// # Errors
///
/// - [`Error::RequestCancelled`] if `cancel` fires before completion.
/// - [`Error::ChannelError`] if the response stream is gone.
///
/// [`RequestState::Completed`]: crate::server::streaming::request::RequestState::Completed
/// [`RequestState::Aborted`]: crate::server::streaming::request::RequestState::Aborted
pub async fn stream_batches(
    machine: &mut RequestMachine,
    resp_tx: &BatchSender,
    wait_time: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let result = emit_batches(machine, resp_tx, wait_time, cancel).await;
    if result.is_err() {
        machine.abort();
    }
    result
}

async fn emit_batches(
    machine: &mut RequestMachine,
    resp_tx: &BatchSender,
    wait_time: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    while let Some(plan) = machine.next_batch() {
        if cancel.is_cancelled() {
            return Err(Error::RequestCancelled);
        }

        let batch = ContractRequestBatch {
            request_id: machine.request_id().to_string(),
            contract_requests: generator::generate(plan.take)
                .into_iter()
                .map(ContractRequestMessage::from)
                .collect(),
            is_final: plan.is_final,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::RequestCancelled),
            sent = resp_tx.send(Ok(batch)) => {
                sent.map_err(|e| Error::ChannelError {
                    context: format!("Failed to forward batch: {e}"),
                })?;
            }
        }

        machine.commit(plan);
        increment_batches_sent();
        increment_records_generated(plan.take as u64);

        tracing::info!(
            batch = plan.take,
            sent = machine.sent(),
            total = machine.total(),
            is_final = plan.is_final,
            "Sent batch"
        );

        if plan.is_final {
            break;
        }

        if !wait_time.is_zero() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::RequestCancelled),
                () = resp_tx.closed() => {
                    return Err(Error::ChannelError {
                        context: "Response stream closed".to_string(),
                    });
                }
                () = tokio::time::sleep(wait_time) => {}
            }
        }
    }

    Ok(())
}
