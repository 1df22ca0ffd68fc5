//! gRPC service implementation for batched contract request generation.
//!
//! This module defines [`ContractStreamService`], the concrete implementation
//! of the [`ContractRequestGenerator`] service defined in `agency.proto`. It
//! exposes one bidirectional streaming endpoint: clients
//! write generation requests and read back batches of synthetic contract
//! requests.
//!
//! ## Responsibilities
//!
//! - Spawn one dispatcher task per stream via [`dispatch_requests`].
//! - Track in-flight streams and refuse new ones while shutting down.
//! - Cancel every remaining stream once the drain timeout expires, ending it
//!   with `UNAVAILABLE` so the peer knows to retry elsewhere or later.

use crate::server::{
    config::ServerConfig,
    streaming::coordinator::dispatch_requests,
    telemetry::{
        decrement_streams_inflight, increment_stream_errors, increment_streams_inflight,
        record_stream_duration,
    },
};
use agency_stream_core::{
    Error,
    proto::{
        ContractRequestBatch, GenerationRequest,
        contract_request_generator_server::{
            ContractRequestGenerator, ContractRequestGeneratorServer,
        },
    },
};
use core::{pin::Pin, time::Duration};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming, codec::CompressionEncoding};
use tracing::Instrument;

/// Streaming gRPC service producing synthetic contract requests.
///
/// Cloning is cheap; clones share the shutdown token and in-flight counter, so
/// the copy handed to tonic and the copy kept for shutdown observe the same
/// state.
#[derive(Clone)]
pub struct ContractStreamService {
    config: ServerConfig,
    shutdown_token: CancellationToken,
    accepting: Arc<AtomicBool>,
    streams_inflight: Arc<AtomicUsize>,
}

impl ContractStreamService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shutdown_token: CancellationToken::new(),
            accepting: Arc::new(AtomicBool::new(true)),
            streams_inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams whose dispatcher has not finished yet.
    pub fn streams_inflight(&self) -> usize {
        self.streams_inflight.load(Ordering::Acquire)
    }

    /// Gracefully shuts the service down.
    ///
    /// - Refuses new streams with `UNAVAILABLE`.
    /// - Waits up to `shutdown_timeout` for in-flight streams to drain.
    /// - Cancels the shared token, aborting whatever is still running.
    pub async fn shutdown(&self) {
        tracing::info!("Refusing new streams");
        self.accepting.store(false, Ordering::Release);

        tracing::info!(
            "Draining in-flight streams ({} active)",
            self.streams_inflight()
        );
        let drained = timeout(self.config.shutdown_timeout, async {
            while self.streams_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight streams drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} streams still active)",
                self.streams_inflight()
            ),
        }

        tracing::debug!("Cancelling remaining requests via shutdown token");
        self.shutdown_token.cancel();

        tracing::info!("Generator service shutdown complete");
    }
}

/// Wraps the service in its tonic server with compression enabled.
pub fn build_generator_service(
    service: ContractStreamService,
) -> ContractRequestGeneratorServer<ContractStreamService> {
    ContractRequestGeneratorServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

/// Keeps the in-flight count accurate however the dispatcher task ends.
struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        Self(counter)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
    }
}

#[tonic::async_trait]
impl ContractRequestGenerator for ContractStreamService {
    type ContractRequestStreamStream =
        Pin<Box<dyn Stream<Item = Result<ContractRequestBatch, Status>> + Send>>;

    /// Opens a bidirectional generation stream.
    ///
    /// The response stream is returned immediately; a background dispatcher
    /// feeds it until every accepted request has completed or been aborted.
    async fn contract_request_stream(
        &self,
        req: Request<Streaming<GenerationRequest>>,
    ) -> Result<Response<Self::ContractRequestStreamStream>, Status> {
        if !self.accepting.load(Ordering::Acquire) || self.shutdown_token.is_cancelled() {
            increment_stream_errors();
            return Err(Error::ServiceShutdown.into());
        }

        let peer = req.remote_addr();
        let inbound = req.into_inner();
        let (resp_tx, resp_rx) = mpsc::channel(self.config.stream_buffer_size);
        let guard = InflightGuard::new(Arc::clone(&self.streams_inflight));
        let status_tx = resp_tx.clone();
        let shutdown = self.shutdown_token.clone();
        let connection = shutdown.child_token();
        let config = self.config.clone();
        let start = std::time::Instant::now();

        let span = tracing::info_span!("stream", peer = ?peer);
        let fut = async move {
            let _guard = guard;
            tracing::info!(
                default_batch_size = config.default_batch_size,
                wait_time_secs = config.wait_time.as_secs(),
                "Generator stream started"
            );

            let summary = dispatch_requests(inbound, resp_tx, config, connection).await;
            record_stream_duration(start.elapsed().as_millis() as f64);

            if shutdown.is_cancelled() {
                // Best effort: the peer may already be gone.
                let sent = timeout(
                    Duration::from_secs(1),
                    status_tx.send(Err(Error::ServiceShutdown.into())),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    tracing::debug!("Failed to forward shutdown status");
                }
            }

            tracing::info!(
                accepted = summary.accepted,
                skipped = summary.skipped,
                completed = summary.completed,
                aborted = summary.aborted,
                "Generator stream finished"
            );
        };

        tokio::spawn(fut.instrument(span));

        Ok(Response::new(Box::pin(ReceiverStream::new(resp_rx))))
    }
}
