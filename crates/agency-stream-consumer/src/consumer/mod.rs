//! # Stream Consumer
//!
//! Drives one generation run end to end:
//!
//! 1. Mint a fresh [`RequestId`] and open a stream through the
//!    [`BatchSource`].
//! 2. Concurrently send exactly one [`GenerationRequest`] (then half-close)
//!    and read batches back.
//! 3. Discard batches tagged with any other request id; ingest the rest
//!    through [`ingest_batch`].
//! 4. Stop after the final batch.
//!
//! Transport failures restart the run from step 1 after a fixed backoff. A
//! stream the generator ends cleanly without a final batch is not retried;
//! the run ends as [`RunOutcome::Incomplete`].
//! Every other failure ends the run. Cancellation is observed by the send
//! path, the read path, ingestion and the backoff.

mod ingest;
mod source;

pub use ingest::{BatchSummary, ingest_batch};
pub use source::{BatchSource, BatchStream, GrpcBatchSource};

use crate::{Error, cache::ExistenceCache, directory::EntityDirectory};
use agency_stream_core::{proto::GenerationRequest, types::RequestId};
use core::time::Duration;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Delay before a failed run is restarted.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// What each run asks the generator for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSettings {
    pub count: i32,
    /// `0` lets the generator use its default.
    pub batch_size: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The final batch of `request_id` was ingested.
    Completed {
        request_id: RequestId,
        received: usize,
        created: usize,
    },
    /// The generator ended the stream without sending the final batch, most
    /// likely because it skipped the request.
    Incomplete {
        request_id: RequestId,
        received: usize,
        created: usize,
    },
    Cancelled,
}

pub struct StreamConsumer<S, D: ?Sized> {
    source: S,
    directory: Arc<D>,
    cache: ExistenceCache,
    settings: RunSettings,
    backoff: Duration,
}

impl<S, D> StreamConsumer<S, D>
where
    S: BatchSource,
    D: EntityDirectory + ?Sized,
{
    pub fn new(source: S, directory: Arc<D>, settings: RunSettings) -> Self {
        Self {
            source,
            directory,
            cache: ExistenceCache::default(),
            settings,
            backoff: DEFAULT_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ExistenceCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &ExistenceCache {
        &self.cache
    }

    /// Runs until the stream of one request ends, the run fails for a
    /// non-transport reason, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Any error that is not [recoverable](Error::is_recoverable), after it
    /// has been logged. Cancellation is reported as [`RunOutcome::Cancelled`],
    /// never as an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome, Error> {
        loop {
            let request_id = RequestId::new();
            let span = tracing::info_span!("run", request_id = %request_id);

            match self.run_once(&request_id, cancel).instrument(span).await {
                Ok(outcome) => return Ok(outcome),
                Err(_) if cancel.is_cancelled() => {
                    tracing::info!(%request_id, "Run cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                Err(e) if e.is_recoverable() => {
                    tracing::error!(
                        %request_id,
                        retry_in_secs = self.backoff.as_secs_f64(),
                        "Stream failed: {e}"
                    );
                }
                Err(e) => {
                    tracing::error!(%request_id, "Run failed: {e}");
                    return Err(e);
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("Cancelled during backoff");
                    return Ok(RunOutcome::Cancelled);
                }
                () = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    async fn run_once(
        &self,
        request_id: &RequestId,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Error> {
        let (tx, rx) = mpsc::channel(1);
        let request = GenerationRequest {
            request_id: request_id.to_string(),
            count: self.settings.count,
            batch_size: self.settings.batch_size,
        };
        let writer =
            tokio::spawn(send_request(tx, request, cancel.clone()).in_current_span());

        let read = self.read_batches(request_id, rx, cancel).await;
        let written = writer.await;

        let outcome = read?;
        written?;
        Ok(outcome)
    }

    async fn read_batches(
        &self,
        request_id: &RequestId,
        requests: mpsc::Receiver<GenerationRequest>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Error> {
        let mut batches = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            opened = self.source.open(ReceiverStream::new(requests)) => opened?,
        };

        let mut received = 0;
        let mut created = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = batches.next() => next,
            };
            let Some(batch) = next else {
                tracing::warn!(received, created, "Stream ended before the final batch");
                return Ok(RunOutcome::Incomplete {
                    request_id: request_id.clone(),
                    received,
                    created,
                });
            };
            let batch = batch?;

            if !request_id.matches(&batch.request_id) {
                tracing::debug!(
                    batch_request_id = %batch.request_id,
                    "Discarding foreign batch"
                );
                continue;
            }

            let summary = ingest_batch(batch, &self.cache, &*self.directory, cancel).await?;
            received += summary.total;
            created += summary.created;

            tracing::info!(
                total = summary.total,
                valid = summary.valid,
                created = summary.created,
                is_final = summary.is_final,
                "Processed batch"
            );

            if summary.is_final {
                return Ok(RunOutcome::Completed {
                    request_id: request_id.clone(),
                    received,
                    created,
                });
            }
        }
    }
}

/// Sends the run's single request, then drops `tx` to half-close the stream.
async fn send_request(
    tx: mpsc::Sender<GenerationRequest>,
    request: GenerationRequest,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        sent = tx.send(request) => {
            if sent.is_err() {
                // The read side reports why the stream went away.
                tracing::debug!("Stream closed before the request was sent");
            }
        }
    }
}
