pub mod error;
pub mod generator;
pub mod types;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from `proto/agency.proto`.
///
/// ## Service
///
/// - `ContractRequestGenerator::ContractRequestStream` - bidirectional stream.
///   The client writes `GenerationRequest`s; the server answers each accepted
///   request with a sequence of `ContractRequestBatch`es carrying the same
///   `request_id`, the last of which has `is_final = true`.
pub mod proto {
    tonic::include_proto!("agency");
}
