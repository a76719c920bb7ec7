use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::SourceError;
use crate::source::{RawRecord, Session, SessionRequest, Source};

/// Why a session stopped producing records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The source closed the session on its own.
    Completed,
    /// Nothing arrived within the inactivity window.
    Inactive,
    /// The connection failed in a way a fresh session can recover from.
    Dropped(String),
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Completed => write!(f, "completed"),
            SessionEnd::Inactive => write!(f, "inactive"),
            SessionEnd::Dropped(reason) => write!(f, "dropped ({})", reason),
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Record(RawRecord),
    SessionEnded(SessionEnd),
}

/// Exponential pause after sessions that failed to deliver anything.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    streak: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            streak: 0,
        }
    }

    fn delay(&self) -> Duration {
        if self.streak == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (self.streak - 1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn fail(&mut self) {
        self.streak = self.streak.saturating_add(1);
    }

    fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Keeps a session to the source open for as long as the source allows,
/// reconnecting without limit on inactivity, session end and recoverable
/// disconnects. Only non-recoverable errors escape.
///
/// Reconnects are immediate (plus the configured fixed delay) after a session
/// that delivered records or went inactive. After a failed open, or a session
/// that completed or dropped without delivering anything, the next open waits
/// an exponential backoff so a fetcher that exits at once is not respawned in
/// a tight loop.
pub struct Supervisor<S> {
    source: S,
    request: SessionRequest,
    policy: ReconnectPolicy,
    backoff: Backoff,
    session: Option<Box<dyn Session>>,
    open_attempts: u64,
    sessions_opened: u64,
    delivered: bool,
}

impl<S: Source> Supervisor<S> {
    pub fn new(source: S, request: SessionRequest, policy: ReconnectPolicy) -> Self {
        Self {
            source,
            request,
            policy,
            backoff: Backoff::new(policy.backoff_initial, policy.backoff_max),
            session: None,
            open_attempts: 0,
            sessions_opened: 0,
            delivered: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_some()
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened
    }

    /// Wait for the next record or session boundary, opening a session first
    /// if none is active. Cancel-safe: an interrupted call leaves any open
    /// session in place for the next call or for [`Supervisor::shutdown`].
    pub async fn next_event(&mut self) -> Result<Event, SourceError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => self.connect().await?,
        };
        let session = self.session.insert(session);

        let inactivity_timeout = self.request.inactivity_timeout;
        let end = match tokio::time::timeout(inactivity_timeout, session.next_record()).await {
            Ok(Ok(Some(record))) => {
                self.delivered = true;
                self.backoff.reset();
                return Ok(Event::Record(record));
            }
            Ok(Ok(None)) => SessionEnd::Completed,
            Err(_) => SessionEnd::Inactive,
            Ok(Err(e)) if e.is_recoverable() => SessionEnd::Dropped(e.to_string()),
            Ok(Err(e)) => {
                self.close_session().await;
                return Err(e);
            }
        };

        self.close_session().await;
        if !self.delivered && end != SessionEnd::Inactive {
            self.backoff.fail();
        }
        info!("Session {} ended: {}", self.sessions_opened, end);
        Ok(Event::SessionEnded(end))
    }

    /// Close the active session, if any.
    pub async fn shutdown(&mut self) {
        if self.session.is_some() {
            info!("Closing session {}", self.sessions_opened);
            self.close_session().await;
        }
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    async fn connect(&mut self) -> Result<Box<dyn Session>, SourceError> {
        loop {
            if self.open_attempts > 0 {
                let delay = self.policy.delay + self.backoff.delay();
                if !delay.is_zero() {
                    debug!("Waiting {:?} before reconnecting", delay);
                    tokio::time::sleep(delay).await;
                }
            }
            self.open_attempts += 1;

            match self.source.open(&self.request).await {
                Ok(session) => {
                    self.sessions_opened += 1;
                    self.delivered = false;
                    info!(
                        "Session {} opened for {} (categories: {})",
                        self.sessions_opened,
                        self.request.url,
                        self.request.categories.join(",")
                    );
                    return Ok(session);
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Failed to open session: {}. Retrying...", e);
                    self.backoff.fail();
                }
                Err(e) => return Err(e),
            }
        }
    }
}
