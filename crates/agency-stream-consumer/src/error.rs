use crate::directory::DirectoryError;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Failures that end a consumer run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The stream could not be opened or failed mid-flight.
    #[error("Transport error: {0}")]
    Transport(#[from] Status),

    /// A record on the stream does not decode.
    #[error(transparent)]
    Record(#[from] agency_stream_core::Error),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// The request writer task panicked or was aborted.
    #[error("Request writer failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the run should be retried with a new request id.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
