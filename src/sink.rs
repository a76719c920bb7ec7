use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::SinkError;
use crate::platform::CanonicalMessage;

/// Writes one JSON object per line and flushes after every record.
///
/// Each record is handed to the writer as a single buffer. If the writer
/// accepts only part of it and then stalls past the timeout, those bytes stay
/// written; the caller treats the timeout as fatal, so at most the final line
/// of the stream can be incomplete.
pub struct JsonLinesSink<W> {
    writer: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W, write_timeout: Duration) -> Self {
        Self {
            writer,
            write_timeout,
        }
    }

    /// Write and flush `record`. A writer that stalls past the timeout is an error.
    pub async fn emit(&mut self, record: &CanonicalMessage) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let timeout = self.write_timeout;
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(&line).await?;
            writer.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| SinkError::Timeout(timeout))??;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}
