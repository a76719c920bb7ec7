pub mod command;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MalformedRecord, SourceError};

/// Parameters shared by every session the supervisor opens.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub url: String,
    pub categories: Vec<String>,
    pub inactivity_timeout: Duration,
}

/// One record pulled from a session. Undecodable records are surfaced
/// instead of ending the session.
pub type RawRecord = Result<Value, MalformedRecord>;

/// Opens chat sessions for a channel.
#[async_trait]
pub trait Source: Send + Sync {
    async fn open(&self, request: &SessionRequest) -> Result<Box<dyn Session>, SourceError>;
}

/// A single connection to the chat source.
#[async_trait]
pub trait Session: Send {
    /// Pull the next record. `Ok(None)` means the session ended normally.
    ///
    /// Must be cancel-safe: the supervisor races it against timeouts and shutdown.
    async fn next_record(&mut self) -> Result<Option<RawRecord>, SourceError>;

    /// Release the underlying connection.
    async fn close(&mut self);
}
