//! Error types shared by the batch generator service and its clients.
//!
//! [`Error`] converts into [`tonic::Status`] so that failures raised while
//! serving a stream can be surfaced to the peer with a meaningful code.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the contract request stream.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Internal channel send/receive failure (e.g. the peer dropped the
    /// response stream).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A generation request that cannot be served (non-positive count, count
    /// above the configured limit, negative batch size).
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A record on the wire that does not decode into a valid
    /// [`ContractRequestRecord`](crate::types::ContractRequestRecord).
    #[error("Invalid record: {reason}")]
    InvalidRecord { reason: String },

    /// The request was cancelled before its final batch was emitted.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {context}"))
            }
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::InvalidRecord { reason } => Status::data_loss(reason),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_errors_to_status_codes() {
        let cases = [
            (
                Error::ChannelError {
                    context: "closed".into(),
                },
                Code::Internal,
            ),
            (
                Error::InvalidRequest {
                    reason: "count".into(),
                },
                Code::InvalidArgument,
            ),
            (
                Error::InvalidRecord {
                    reason: "status".into(),
                },
                Code::DataLoss,
            ),
            (Error::RequestCancelled, Code::Cancelled),
            (Error::ServiceShutdown, Code::Unavailable),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn invalid_request_reason_is_the_status_message() {
        let status = Status::from(Error::InvalidRequest {
            reason: "Count must be greater than 0".into(),
        });
        assert_eq!(status.message(), "Count must be greater than 0");
    }
}
