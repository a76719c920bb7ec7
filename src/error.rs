use std::time::Duration;

use thiserror::Error;

/// Errors reported by a chat source while opening or reading a session.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid channel url '{0}'")]
    InvalidUrl(String),
    #[error("source rejected the session: {0}")]
    Rejected(String),
    #[error("failed to start chat fetcher '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("source connection dropped: {0}")]
    Disconnected(String),
}

impl SourceError {
    /// Whether the supervisor may open a fresh session after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SourceError::Disconnected(_))
    }
}

/// Errors writing canonical records to the output stream.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to encode record")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write record")]
    Io(#[from] std::io::Error),
    #[error("sink did not accept a record within {0:?}")]
    Timeout(Duration),
}

/// A raw record that cannot be turned into a chat message.
#[derive(Error, Debug)]
pub enum MalformedRecord {
    #[error("record is not valid UTF-8: {0}")]
    Encoding(#[source] std::str::Utf8Error),
    #[error("record is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("record does not match the chat message shape: {0}")]
    Shape(#[source] serde_json::Error),
}

/// Fatal conditions that stop the ingestion pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("chat source failed")]
    Source(#[from] SourceError),
    #[error("output sink failed")]
    Sink(#[from] SinkError),
}

impl PipelineError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Source(_) => 2,
            PipelineError::Sink(_) => 3,
        }
    }
}
