use agency_stream_core::proto::{
    ContractRequestBatch, GenerationRequest,
    contract_request_generator_client::ContractRequestGeneratorClient,
};
use core::pin::Pin;
use std::sync::Arc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{
    Status,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

pub type BatchStream = Pin<Box<dyn Stream<Item = Result<ContractRequestBatch, Status>> + Send>>;

/// Opens a generation stream: `requests` goes out, batches come back.
#[tonic::async_trait]
pub trait BatchSource: Send + Sync {
    async fn open(
        &self,
        requests: ReceiverStream<GenerationRequest>,
    ) -> Result<BatchStream, Status>;
}

#[tonic::async_trait]
impl<T: BatchSource + ?Sized> BatchSource for Arc<T> {
    async fn open(
        &self,
        requests: ReceiverStream<GenerationRequest>,
    ) -> Result<BatchStream, Status> {
        (**self).open(requests).await
    }
}

/// [`BatchSource`] backed by the gRPC generator.
#[derive(Clone, Debug)]
pub struct GrpcBatchSource {
    client: ContractRequestGeneratorClient<Channel>,
}

impl GrpcBatchSource {
    /// Connects lazily: an unreachable generator surfaces as `UNAVAILABLE`
    /// from [`open`](BatchSource::open).
    pub fn new(endpoint: Endpoint) -> Self {
        let client = ContractRequestGeneratorClient::new(endpoint.connect_lazy())
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate);
        Self { client }
    }
}

#[tonic::async_trait]
impl BatchSource for GrpcBatchSource {
    async fn open(
        &self,
        requests: ReceiverStream<GenerationRequest>,
    ) -> Result<BatchStream, Status> {
        let mut client = self.client.clone();
        let response = client.contract_request_stream(requests).await?;
        Ok(Box::pin(response.into_inner()))
    }
}
