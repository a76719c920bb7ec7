use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{RawRecord, Session, SessionRequest, Source};
use crate::config::SourceConfig;
use crate::error::{MalformedRecord, SourceError};

/// Runs an external chat fetcher per session and reads one JSON record per
/// stdout line.
pub struct CommandSource {
    command: String,
    args: Vec<String>,
    fatal_exit_codes: Vec<i32>,
}

impl CommandSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            fatal_exit_codes: config.fatal_exit_codes.clone(),
        }
    }

    fn render_args(&self, request: &SessionRequest) -> Vec<String> {
        let categories = request.categories.join(",");
        let timeout = request.inactivity_timeout.as_secs_f64().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", &request.url)
                    .replace("{categories}", &categories)
                    .replace("{timeout}", &timeout)
            })
            .collect()
    }
}

/// Accept only absolute http(s) URLs with a host.
pub fn validate_url(url: &str) -> Result<(), SourceError> {
    let invalid = || SourceError::InvalidUrl(url.to_string());

    // Url::parse trims surrounding whitespace; the fetcher would not.
    if url.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let parsed = Url::parse(url).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid());
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

#[async_trait]
impl Source for CommandSource {
    async fn open(&self, request: &SessionRequest) -> Result<Box<dyn Session>, SourceError> {
        validate_url(&request.url)?;

        let args = self.render_args(request);
        debug!("Starting chat fetcher: {} {:?}", self.command, args);

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Disconnected("fetcher stdout unavailable".to_string()))?;

        // Forward fetcher diagnostics and keep the last line as the failure cause.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                let mut last = None;
                // Keep draining on bad bytes so the fetcher never blocks on a full pipe.
                while matches!(reader.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    debug!("fetcher: {}", line);
                    if !line.trim().is_empty() {
                        last = Some(line.to_string());
                    }
                    buf.clear();
                }
                last
            })
        });

        info!("Chat fetcher started (pid {:?})", child.id());

        Ok(Box::new(CommandSession {
            child,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
            stderr_task,
            fatal_exit_codes: self.fatal_exit_codes.clone(),
        }))
    }
}

struct CommandSession {
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Bytes of the current line; survives a cancelled read.
    pending: Vec<u8>,
    stderr_task: Option<JoinHandle<Option<String>>>,
    fatal_exit_codes: Vec<i32>,
}

impl CommandSession {
    async fn last_stderr_line(&mut self) -> String {
        match self.stderr_task.take() {
            Some(task) => task.await.ok().flatten().unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Classify how the fetcher ended once its stdout is exhausted.
    async fn finish(&mut self) -> Result<Option<RawRecord>, SourceError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SourceError::Disconnected(format!("failed to wait for fetcher: {}", e)))?;

        match status.code() {
            Some(0) => Ok(None),
            Some(code) if self.fatal_exit_codes.contains(&code) => {
                let cause = self.last_stderr_line().await;
                Err(SourceError::Rejected(format!(
                    "fetcher exited with status {}: {}",
                    code, cause
                )))
            }
            _ => {
                let cause = self.last_stderr_line().await;
                Err(SourceError::Disconnected(format!(
                    "fetcher exited with {}: {}",
                    status, cause
                )))
            }
        }
    }
}

#[async_trait]
impl Session for CommandSession {
    async fn next_record(&mut self) -> Result<Option<RawRecord>, SourceError> {
        loop {
            let read = self
                .stdout
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(|e| {
                    SourceError::Disconnected(format!("failed to read fetcher output: {}", e))
                })?;
            if read == 0 {
                return self.finish().await;
            }

            let bytes = std::mem::take(&mut self.pending);
            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line.trim(),
                Err(e) => return Ok(Some(Err(MalformedRecord::Encoding(e)))),
            };
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(line).map_err(MalformedRecord::Json)));
        }
    }

    async fn close(&mut self) {
        let exited = matches!(self.child.try_wait(), Ok(Some(_)));
        if !exited {
            if let Err(e) = self.child.kill().await {
                warn!("Failed to stop chat fetcher: {}", e);
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
