use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dedup::DedupStore;
use crate::error::PipelineError;
use crate::normalize::Normalizer;
use crate::platform::RawMessage;
use crate::sink::JsonLinesSink;
use crate::source::{RawRecord, Source};
use crate::supervisor::{Event, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Connecting,
    Streaming,
    Sweeping,
    Terminated,
    Fatal,
}

/// Counters reported when the pipeline stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sessions: u64,
    pub received: u64,
    pub emitted: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub filtered: u64,
}

/// Drives records from the supervisor through dedup and normalization into
/// the sink, one at a time and in arrival order.
pub struct Pipeline<S, W> {
    supervisor: Supervisor<S>,
    dedup: DedupStore,
    normalizer: Normalizer,
    sink: JsonLinesSink<W>,
    message_types: Option<Vec<String>>,
    max_messages: Option<u64>,
    state: PipelineState,
    summary: RunSummary,
    // Dedup timestamps follow the runtime's monotonic clock from this origin.
    clock_origin: (DateTime<Utc>, Instant),
    last_sweep: DateTime<Utc>,
}

impl<S: Source, W: AsyncWrite + Unpin + Send> Pipeline<S, W> {
    pub fn new(
        supervisor: Supervisor<S>,
        dedup: DedupStore,
        normalizer: Normalizer,
        sink: JsonLinesSink<W>,
    ) -> Self {
        let wall = Utc::now();
        Self {
            supervisor,
            dedup,
            normalizer,
            sink,
            message_types: None,
            max_messages: None,
            state: PipelineState::Idle,
            summary: RunSummary::default(),
            clock_origin: (wall, Instant::now()),
            last_sweep: wall,
        }
    }

    /// Stop cleanly after this many records have been emitted.
    pub fn with_max_messages(mut self, max_messages: Option<u64>) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Only relay records whose `message_type` is in this list.
    pub fn with_message_types(mut self, message_types: Option<Vec<String>>) -> Self {
        self.message_types = message_types;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run until `shutdown` resolves, the message limit is reached, or a fatal
    /// error occurs. The active session is closed in every case.
    ///
    /// Shutdown is observed while waiting on the source. A record already
    /// being written is finished first, which takes at most the sink's write
    /// timeout, so the output never ends in a partial line on a clean stop.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunSummary, PipelineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            if self.limit_reached() {
                info!("Reached the limit of {} messages", self.summary.emitted);
                break;
            }

            let next = if self.supervisor.is_streaming() {
                PipelineState::Streaming
            } else {
                PipelineState::Connecting
            };
            self.set_state(next);

            let event = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = self.supervisor.next_event() => event,
            };

            let outcome = match event {
                Ok(Event::Record(record)) => self.handle_record(record).await,
                Ok(Event::SessionEnded(_)) => {
                    self.sweep();
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };

            if let Err(e) = outcome {
                self.set_state(PipelineState::Fatal);
                self.supervisor.shutdown().await;
                return Err(e);
            }
        }

        self.supervisor.shutdown().await;
        self.set_state(PipelineState::Terminated);
        Ok(self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            sessions: self.supervisor.sessions_opened(),
            ..self.summary.clone()
        }
    }

    async fn handle_record(&mut self, record: RawRecord) -> Result<(), PipelineError> {
        self.summary.received += 1;

        let raw = match record.and_then(RawMessage::from_value) {
            Ok(raw) => raw,
            Err(e) => {
                self.summary.malformed += 1;
                warn!("Skipping malformed record: {}", e);
                return Ok(());
            }
        };

        if !self.accepts(&raw) {
            self.summary.filtered += 1;
            debug!("Skipping message {} of type {:?}", raw.id, raw.message_type);
            return Ok(());
        }

        // A busy session may never end, so expire ids in-stream once per ttl.
        let now = self.now();
        if now - self.last_sweep >= self.dedup.ttl() {
            self.evict_expired(now);
        }

        if self.dedup.seen(&raw.id) {
            self.summary.duplicates += 1;
            debug!("Skipping duplicate message {}", raw.id);
            return Ok(());
        }

        self.dedup.record(&raw.id, now);
        let canonical = self.normalizer.normalize(raw);
        self.sink.emit(&canonical).await?;
        self.summary.emitted += 1;
        Ok(())
    }

    fn accepts(&self, raw: &RawMessage) -> bool {
        match (&self.message_types, &raw.message_type) {
            (Some(allowed), Some(kind)) => allowed.iter().any(|t| t == kind),
            _ => true,
        }
    }

    fn sweep(&mut self) {
        self.set_state(PipelineState::Sweeping);
        let now = self.now();
        self.evict_expired(now);
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        self.last_sweep = now;
        let evicted = self.dedup.sweep(now);
        info!(
            "Swept {} expired message ids, tracking {}",
            evicted,
            self.dedup.tracked()
        );
    }

    fn limit_reached(&self) -> bool {
        self.max_messages
            .is_some_and(|max| self.summary.emitted >= max)
    }

    fn now(&self) -> DateTime<Utc> {
        let (wall, origin) = self.clock_origin;
        let elapsed = chrono::Duration::from_std(origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        wall + elapsed
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            debug!("Pipeline state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    #[cfg(test)]
    fn into_sink(self) -> JsonLinesSink<W> {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NormalizerConfig, ReconnectPolicy};
    use crate::error::SourceError;
    use crate::platform::CanonicalMessage;
    use crate::source::scripted::{Script, ScriptStats, ScriptedSource, Step};
    use crate::source::SessionRequest;
    use serde_json::{json, Value};
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    fn youtube(id: &str) -> Step {
        Step::Record(json!({
            "id": id,
            "message": format!("message {}", id),
            "message_type": "text_message",
            "author": {"name": "Viewer"}
        }))
    }

    fn build<W: AsyncWrite + Unpin + Send>(
        scripts: Vec<Script>,
        ttl: chrono::Duration,
        writer: W,
    ) -> (Pipeline<ScriptedSource, W>, Arc<ScriptStats>) {
        let source = ScriptedSource::new(scripts);
        let stats = source.stats();
        let request = SessionRequest {
            url: "https://www.youtube.com/watch?v=jfKfPfyJRdk".to_string(),
            categories: vec!["messages".to_string()],
            inactivity_timeout: Duration::from_secs(10),
        };
        let policy = ReconnectPolicy {
            delay: Duration::ZERO,
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
        };
        let pipeline = Pipeline::new(
            Supervisor::new(source, request, policy),
            DedupStore::new(ttl),
            Normalizer::new(&NormalizerConfig::default()),
            JsonLinesSink::new(writer, Duration::from_secs(5)),
        );
        (pipeline, stats)
    }

    fn pipeline_for(scripts: Vec<Script>) -> (Pipeline<ScriptedSource, Vec<u8>>, Arc<ScriptStats>) {
        build(scripts, chrono::Duration::seconds(3600), Vec::new())
    }

    fn emitted(pipeline: Pipeline<ScriptedSource, Vec<u8>>) -> Vec<CanonicalMessage> {
        let output = pipeline.into_sink().into_inner();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn bodies(messages: &[CanonicalMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.message.as_str()).collect()
    }

    fn never() -> std::future::Pending<()> {
        std::future::pending()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_does_not_repeat_messages() {
        let (mut pipeline, stats) = pipeline_for(vec![
            Script::Open(vec![youtube("a"), youtube("b"), Step::Stall]),
            Script::Open(vec![youtube("b"), youtube("c")]),
            Script::Refuse(SourceError::Rejected("stream over".into())),
        ]);

        let err = pipeline.run(never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::Rejected(_))));
        assert_eq!(pipeline.state(), PipelineState::Fatal);

        let summary = pipeline.summary();
        assert_eq!(summary.sessions, 2);
        assert_eq!(summary.emitted, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(stats.closed(), 2);

        let out = emitted(pipeline);
        assert_eq!(bodies(&out), vec!["message a", "message b", "message c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_one_record_per_distinct_id() {
        let ids = ["a", "b", "a", "c", "b", "a", "d"];
        let first: Vec<Step> = ids.iter().map(|id| youtube(id)).collect();
        let second: Vec<Step> = ids.iter().rev().map(|id| youtube(id)).collect();
        let (mut pipeline, _) = pipeline_for(vec![Script::Open(first), Script::Open(second)]);

        pipeline.run(never()).await.unwrap_err();
        let summary = pipeline.summary();
        assert_eq!(summary.received, 14);
        assert_eq!(summary.emitted, 4);
        assert_eq!(summary.duplicates, 10);
        assert_eq!(emitted(pipeline).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_open_writes_nothing() {
        let (mut pipeline, _) = pipeline_for(vec![Script::Refuse(SourceError::InvalidUrl(
            "nope".into(),
        ))]);

        let err = pipeline.run(never()).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(pipeline.state(), PipelineState::Fatal);
        assert!(emitted(pipeline).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_writes_after_fatal_error() {
        let (mut pipeline, _) = pipeline_for(vec![Script::Open(vec![
            youtube("a"),
            Step::Fail(SourceError::Rejected("banned".into())),
            youtube("b"),
        ])]);

        pipeline.run(never()).await.unwrap_err();
        assert_eq!(bodies(&emitted(pipeline)), vec!["message a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_records_are_skipped() {
        let (mut pipeline, _) = pipeline_for(vec![Script::Open(vec![
            Step::Garbage("{not json"),
            Step::Record(json!({"message": "no id", "author": {"name": "x"}})),
            Step::Record(json!({"id": "no-author", "message": "x"})),
            youtube("ok"),
        ])]);

        pipeline.run(never()).await.unwrap_err();
        let summary = pipeline.summary();
        assert_eq!(summary.malformed, 3);
        assert_eq!(summary.emitted, 1);
        assert_eq!(bodies(&emitted(pipeline)), vec!["message ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_messages() {
        let (pipeline, stats) = pipeline_for(vec![Script::Open(vec![
            youtube("1"),
            youtube("2"),
            youtube("3"),
        ])]);
        let mut pipeline = pipeline.with_max_messages(Some(2));

        let summary = pipeline.run(never()).await.unwrap();
        assert_eq!(summary.emitted, 2);
        assert_eq!(pipeline.state(), PipelineState::Terminated);
        assert_eq!(stats.closed(), 1);
        assert_eq!(bodies(&emitted(pipeline)), vec!["message 1", "message 2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_type_filter() {
        let (pipeline, _) = pipeline_for(vec![Script::Open(vec![
            youtube("text"),
            Step::Record(json!({
                "id": "paid", "message": "thanks", "message_type": "paid_message",
                "author": {"name": "Donor"}
            })),
            Step::Record(json!({"id": "untyped", "message": "hi", "author": {"name": "x"}})),
        ])]);
        let mut pipeline = pipeline.with_message_types(Some(vec!["text_message".to_string()]));

        pipeline.run(never()).await.unwrap_err();
        assert_eq!(pipeline.summary().filtered, 1);
        assert_eq!(bodies(&emitted(pipeline)), vec!["message text", "hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session_and_keeps_output() {
        let (mut pipeline, stats) =
            pipeline_for(vec![Script::Open(vec![youtube("a"), Step::Stall])]);

        let summary = pipeline
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(summary.emitted, 1);
        assert_eq!(pipeline.state(), PipelineState::Terminated);
        assert_eq!(stats.closed(), 1);
        assert_eq!(bodies(&emitted(pipeline)), vec!["message a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_ids_are_admitted_again() {
        let (mut pipeline, _) = build(
            vec![
                Script::Open(vec![youtube("a"), Step::Stall]),
                Script::Open(vec![youtube("a")]),
            ],
            chrono::Duration::seconds(5),
            Vec::new(),
        );

        pipeline.run(never()).await.unwrap_err();
        assert_eq!(bodies(&emitted(pipeline)), vec!["message a", "message a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_session_keeps_dedup_bounded() {
        let mut steps = Vec::new();
        for i in 0..1000 {
            steps.push(Step::Wait(Duration::from_secs(1)));
            steps.push(youtube(&i.to_string()));
        }
        let (pipeline, stats) = build(
            vec![Script::Open(steps)],
            chrono::Duration::seconds(5),
            Vec::new(),
        );
        let mut pipeline = pipeline.with_max_messages(Some(1000));

        let summary = pipeline.run(never()).await.unwrap();
        assert_eq!(summary.emitted, 1000);
        assert_eq!(summary.sessions, 1);
        assert_eq!(stats.closed(), 1);
        // One record per second with a 5s ttl, swept at least every 5s.
        assert!(pipeline.dedup.tracked() <= 11, "tracked {}", pipeline.dedup.tracked());
    }

    /// Holds every write until a deadline passes.
    struct SlowWriter {
        written: Vec<u8>,
        delay: Pin<Box<tokio::time::Sleep>>,
        ready: bool,
    }

    impl SlowWriter {
        fn new(delay: Duration) -> Self {
            Self {
                written: Vec::new(),
                delay: Box::pin(tokio::time::sleep(delay)),
                ready: false,
            }
        }
    }

    impl AsyncWrite for SlowWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if !self.ready {
                std::task::ready!(self.delay.as_mut().poll(cx));
                self.ready = true;
            }
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_write_finishes_the_record() {
        let (mut pipeline, stats) = build(
            vec![Script::Open(vec![youtube("a"), Step::Stall])],
            chrono::Duration::seconds(3600),
            SlowWriter::new(Duration::from_secs(2)),
        );

        let started = Instant::now();
        let summary = pipeline
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(summary.emitted, 1);
        assert_eq!(stats.closed(), 1);

        let output = String::from_utf8(pipeline.into_sink().into_inner().written).unwrap();
        assert!(output.ends_with('\n'));
        let record: CanonicalMessage = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(record.message, "message a");
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_fatal() {
        let (mut pipeline, stats) = build(
            vec![Script::Open(vec![youtube("a"), youtube("b")])],
            chrono::Duration::seconds(3600),
            BrokenPipe,
        );

        let err = pipeline.run(never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Sink(_)));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(pipeline.summary().received, 1);
        assert_eq!(stats.closed(), 1);
    }

    #[test]
    fn test_canonical_records_have_every_field() {
        let value: Value = serde_json::to_value(CanonicalMessage {
            message: "m".into(),
            author: "a".into(),
            emotes: vec![],
            badges: vec![],
            colour: "#808080".into(),
        })
        .unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["author", "badges", "colour", "emotes", "message"]);
    }
}
