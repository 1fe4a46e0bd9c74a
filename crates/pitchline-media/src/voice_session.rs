//! Realtime voice session: bridges one client audio stream to streaming STT,
//! detects end of turn from transcript silence, and answers with a generated
//! reply plus synthesized speech.
//!
//! Two tasks run per session. The ingress task only moves client audio into
//! the bounded [`audio_queue`](crate::audio_queue); the event loop is the
//! session's sole transcript writer and the only place turn decisions are
//! made. They share a [`CancellationToken`]: whichever ends first cancels the
//! other.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pitchline_core::config::RealtimeConfig;
use pitchline_core::protocol::ServerMessage;
use pitchline_core::registry::SessionWriter;
use pitchline_core::session::Speaker;
use pitchline_providers::{ReplyGenerator, ReplyRequest};

use crate::audio_queue::{AudioQueueClosed, AudioSender, audio_queue};
use crate::stt::{SttError, StreamingTranscriber, TranscriptKind, TranscriptionStream};
use crate::tts::SpeechSynthesizer;
use crate::turn::TurnDetector;

/// Inbound client traffic after the session has been set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Audio(Bytes),
    /// Client asked to end the call.
    End,
}

/// External collaborators a voice session talks to.
#[derive(Clone)]
pub struct VoicePipeline {
    pub transcriber: Arc<dyn StreamingTranscriber>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
}

/// Session-fatal failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Upstream(#[from] SttError),

    #[error("transcription stream closed")]
    UpstreamClosed,

    #[error("audio queue closed")]
    AudioQueueClosed,

    #[error("client connection gone")]
    ClientGone,
}

#[derive(Debug)]
pub enum SessionEnd {
    /// Client stream finished or disconnected.
    ClientClosed,
    /// Client sent an explicit end.
    EndRequested,
    /// Cancelled from outside (e.g. server shutdown).
    Cancelled,
    Failed(SessionError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub turns: u64,
    pub reply_failures: u64,
    pub synthesis_failures: u64,
}

#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngressEnd {
    ClientClosed,
    EndRequested,
    Cancelled,
    QueueClosed,
}

#[derive(Debug)]
struct IngressReport {
    end: IngressEnd,
    frames: u64,
    dropped: u64,
}

/// Move client audio into the queue until the client stops, asks to end,
/// the queue closes, or the session is cancelled. Always cancels on exit.
async fn run_ingress<S>(
    mut frames: S,
    audio: AudioSender,
    cancel: CancellationToken,
    session_id: String,
) -> IngressReport
where
    S: Stream<Item = ClientFrame> + Unpin,
{
    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break IngressEnd::Cancelled,
            frame = frames.next() => frame,
        };
        match frame {
            None => break IngressEnd::ClientClosed,
            Some(ClientFrame::End) => break IngressEnd::EndRequested,
            Some(ClientFrame::Audio(bytes)) if bytes.is_empty() => {}
            Some(ClientFrame::Audio(bytes)) => match audio.push(bytes) {
                Ok(false) => {}
                Ok(true) => {
                    let dropped = audio.dropped();
                    if dropped == 1 || dropped % 100 == 0 {
                        warn!(%session_id, dropped, "Audio queue full, dropping oldest frames");
                    }
                }
                Err(AudioQueueClosed) => break IngressEnd::QueueClosed,
            },
        }
    };

    cancel.cancel();
    debug!(%session_id, ?end, frames = audio.pushed(), "Audio ingress finished");
    IngressReport {
        end,
        frames: audio.pushed(),
        dropped: audio.dropped(),
    }
}

pub struct VoiceSession {
    writer: SessionWriter,
    config: RealtimeConfig,
    pipeline: VoicePipeline,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl VoiceSession {
    pub fn new(
        writer: SessionWriter,
        config: RealtimeConfig,
        pipeline: VoicePipeline,
        outbound: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            writer,
            config,
            pipeline,
            outbound,
            cancel,
        }
    }

    fn session_id(&self) -> &str {
        self.writer.session().id()
    }

    /// Run the session to completion. The writer claim is released when this
    /// returns; finalization is the caller's job.
    pub async fn run<S>(self, frames: S) -> SessionReport
    where
        S: Stream<Item = ClientFrame> + Send + Unpin + 'static,
    {
        let session_id = self.session_id().to_string();
        let mut stats = SessionStats::default();

        let (audio_tx, audio_rx) = audio_queue(self.config.audio_queue_capacity);
        let mut stream = match self.pipeline.transcriber.connect(audio_rx).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%session_id, error = %e, "Could not open transcription stream");
                return SessionReport {
                    end: SessionEnd::Failed(e.into()),
                    stats,
                };
            }
        };

        if self
            .outbound
            .send(ServerMessage::Ready {
                session_id: session_id.clone(),
            })
            .await
            .is_err()
        {
            drop(audio_tx);
            stream.close(self.config.stt_close_timeout()).await;
            return SessionReport {
                end: SessionEnd::Failed(SessionError::ClientGone),
                stats,
            };
        }

        info!(%session_id, policy = ?self.config.turn_policy, "Voice session started");

        let ingress = tokio::spawn(run_ingress(
            frames,
            audio_tx,
            self.cancel.clone(),
            session_id.clone(),
        ));

        let loop_result = self.event_loop(&mut stream, &mut stats).await;
        self.cancel.cancel();
        stream.close(self.config.stt_close_timeout()).await;

        let ingress = ingress.await.unwrap_or_else(|e| {
            warn!(%session_id, error = %e, "Audio ingress task failed");
            IngressReport {
                end: IngressEnd::Cancelled,
                frames: 0,
                dropped: 0,
            }
        });
        stats.frames_in = ingress.frames;
        stats.frames_dropped = ingress.dropped;

        let end = match loop_result {
            Err(e) => SessionEnd::Failed(e),
            Ok(()) => match ingress.end {
                IngressEnd::ClientClosed => SessionEnd::ClientClosed,
                IngressEnd::EndRequested => SessionEnd::EndRequested,
                IngressEnd::Cancelled => SessionEnd::Cancelled,
                IngressEnd::QueueClosed => SessionEnd::Failed(SessionError::AudioQueueClosed),
            },
        };

        info!(
            %session_id,
            ?end,
            turns = stats.turns,
            frames = stats.frames_in,
            dropped = stats.frames_dropped,
            "Voice session ended"
        );
        SessionReport { end, stats }
    }

    async fn event_loop(
        &self,
        stream: &mut TranscriptionStream,
        stats: &mut SessionStats,
    ) -> Result<(), SessionError> {
        let mut detector = TurnDetector::new(self.config.turn_policy, self.config.silence_threshold());
        let mut tick = tokio::time::interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                event = stream.next_event() => match event {
                    Some(Ok(event)) => self.on_transcript(event.kind, event.text, &mut detector).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(SessionError::UpstreamClosed),
                },
                _ = tick.tick() => {
                    if let Some(text) = detector.poll(Instant::now()) {
                        stats.turns += 1;
                        self.complete_turn(text, stats).await?;
                    }
                }
            }
        }
    }

    async fn on_transcript(
        &self,
        kind: TranscriptKind,
        text: String,
        detector: &mut TurnDetector,
    ) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        match kind {
            TranscriptKind::Partial => {
                if self.config.forward_partials {
                    self.send(ServerMessage::Partial {
                        partial: text.to_string(),
                    })
                    .await?;
                }
            }
            TranscriptKind::Final => {
                self.writer.append(Speaker::User, text);
                detector.observe_final(text, Instant::now());
                debug!(session_id = %self.session_id(), chars = text.len(), "Final transcript");
                self.send(ServerMessage::Transcript {
                    transcript: text.to_string(),
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Generate and deliver the prospect's reply. Collaborator failures stay
    /// inside the turn; only a lost client is fatal.
    async fn complete_turn(&self, text: String, stats: &mut SessionStats) -> Result<(), SessionError> {
        let session = self.writer.session();
        let request = ReplyRequest {
            user_text: text,
            history: self.writer.rendered_history(),
            persona: session.persona().to_string(),
            offer: session.offer().to_string(),
        };
        let started = Instant::now();

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            reply = self.pipeline.replies.reply(&request) => reply,
        };
        let reply = reply.and_then(|r| {
            let r = r.trim().to_string();
            if r.is_empty() {
                anyhow::bail!("model returned an empty reply");
            }
            Ok(r)
        });
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                stats.reply_failures += 1;
                warn!(session_id = %session.id(), error = %e, "Reply generation failed, dropping turn");
                return self
                    .send(ServerMessage::error(format!("Reply generation failed: {e}")))
                    .await;
            }
        };
        self.writer.append(Speaker::Agent, reply.as_str());

        let audio = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            audio = self.pipeline.speech.synthesize(&reply) => audio,
        };
        let ai_audio = match audio {
            Ok(bytes) => Some(BASE64.encode(&bytes)),
            Err(e) => {
                stats.synthesis_failures += 1;
                warn!(session_id = %session.id(), error = %e, "Speech synthesis failed, sending text only");
                None
            }
        };

        info!(
            session_id = %session.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            has_audio = ai_audio.is_some(),
            "Turn complete"
        );
        self.send(ServerMessage::Reply {
            ai_reply: reply,
            ai_audio,
        })
        .await
    }

    async fn send(&self, msg: ServerMessage) -> Result<(), SessionError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SessionError::ClientGone)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;

    use pitchline_core::config::TurnPolicy;
    use pitchline_core::registry::{SessionEntry, SessionRegistry};
    use pitchline_core::session::Transcript;

    use super::*;
    use crate::audio_queue::AudioReceiver;
    use crate::stt::{SttResult, TranscriptEvent};

    struct FakeTranscriber {
        events: Mutex<Option<mpsc::Receiver<SttResult>>>,
        audio_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StreamingTranscriber for FakeTranscriber {
        async fn connect(&self, mut audio: AudioReceiver) -> Result<TranscriptionStream, SttError> {
            let events = self
                .events
                .lock()
                .take()
                .ok_or_else(|| SttError::Connect("already connected".into()))?;
            let seen = Arc::clone(&self.audio_seen);
            let task = tokio::spawn(async move {
                while audio.recv().await.is_some() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
            Ok(TranscriptionStream::new(events, None, Some(task)))
        }
    }

    #[derive(Default)]
    struct FakeReplies {
        calls: Mutex<Vec<ReplyRequest>>,
        fail_first: usize,
    }

    #[async_trait]
    impl ReplyGenerator for FakeReplies {
        async fn reply(&self, request: &ReplyRequest) -> anyhow::Result<String> {
            let mut calls = self.calls.lock();
            calls.push(request.clone());
            if calls.len() <= self.fail_first {
                anyhow::bail!("model unavailable");
            }
            Ok("Who is this?".into())
        }
    }

    struct FakeSpeech {
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSpeech {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<Bytes> {
            if self.fail {
                anyhow::bail!("voice service down");
            }
            Ok(Bytes::from_static(b"mp3"))
        }
    }

    struct Harness {
        events: mpsc::Sender<SttResult>,
        frames: mpsc::Sender<ClientFrame>,
        outbound: mpsc::Receiver<ServerMessage>,
        replies: Arc<FakeReplies>,
        entry: Arc<SessionEntry>,
        audio_seen: Arc<AtomicUsize>,
        handle: JoinHandle<SessionReport>,
    }

    impl Harness {
        fn start(config: RealtimeConfig, replies: FakeReplies, speech_fails: bool) -> Self {
            let registry = SessionRegistry::new();
            let entry = registry
                .create(Some("s1".into()), "CFO at a logistics firm", "Payroll software", Transcript::new())
                .unwrap();
            let writer = entry.claim_writer().unwrap();

            let (events_tx, events_rx) = mpsc::channel(16);
            let (frames_tx, frames_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = mpsc::channel(16);
            let audio_seen = Arc::new(AtomicUsize::new(0));
            let replies = Arc::new(replies);

            let pipeline = VoicePipeline {
                transcriber: Arc::new(FakeTranscriber {
                    events: Mutex::new(Some(events_rx)),
                    audio_seen: Arc::clone(&audio_seen),
                }),
                replies: Arc::clone(&replies) as Arc<dyn ReplyGenerator>,
                speech: Arc::new(FakeSpeech { fail: speech_fails }),
            };
            let session = VoiceSession::new(writer, config, pipeline, out_tx, CancellationToken::new());
            let handle = tokio::spawn(session.run(ReceiverStream::new(frames_rx)));

            Self {
                events: events_tx,
                frames: frames_tx,
                outbound: out_rx,
                replies,
                entry,
                audio_seen,
                handle,
            }
        }

        async fn recv(&mut self) -> ServerMessage {
            self.outbound.recv().await.expect("outbound closed")
        }

        async fn say(&self, text: &str) {
            self.events
                .send(Ok(TranscriptEvent::final_text(text)))
                .await
                .unwrap();
        }

        async fn assert_quiet(&mut self) {
            let next = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv()).await;
            assert!(next.is_err(), "unexpected message: {next:?}");
        }

        async fn finish(self) -> SessionReport {
            drop(self.frames);
            self.handle.await.unwrap()
        }
    }

    fn ready() -> ServerMessage {
        ServerMessage::Ready {
            session_id: "s1".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_reply_after_silence() {
        let mut h = Harness::start(RealtimeConfig::default(), FakeReplies::default(), false);
        assert_eq!(h.recv().await, ready());

        let t0 = Instant::now();
        h.say("I'm not interested").await;
        assert_eq!(
            h.recv().await,
            ServerMessage::Transcript {
                transcript: "I'm not interested".into()
            }
        );

        let reply = h.recv().await;
        let elapsed = t0.elapsed();
        assert!(elapsed > Duration::from_millis(2500), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2800), "fired late: {elapsed:?}");
        assert_eq!(
            reply,
            ServerMessage::Reply {
                ai_reply: "Who is this?".into(),
                ai_audio: Some(BASE64.encode(b"mp3")),
            }
        );

        {
            let calls = h.replies.calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].user_text, "I'm not interested");
            assert_eq!(calls[0].history.matches("User:").count(), 1);
            assert_eq!(calls[0].persona, "CFO at a logistics firm");
        }

        h.assert_quiet().await;
        assert_eq!(h.replies.calls.lock().len(), 1);
        assert_eq!(
            h.entry.rendered_history(),
            "User: I'm not interested\nAgent: Who is this?"
        );

        let entry = Arc::clone(&h.entry);
        let report = h.finish().await;
        assert!(matches!(report.end, SessionEnd::ClientClosed));
        assert_eq!(report.stats.turns, 1);
        assert!(!entry.has_writer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_within_threshold_fire_once() {
        let mut h = Harness::start(RealtimeConfig::default(), FakeReplies::default(), false);
        assert_eq!(h.recv().await, ready());

        let t0 = Instant::now();
        h.say("Hi").await;
        h.recv().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.say("Hi there").await;
        h.recv().await;

        assert!(matches!(h.recv().await, ServerMessage::Reply { .. }));
        assert!(t0.elapsed() > Duration::from_millis(3500));
        h.assert_quiet().await;

        {
            let calls = h.replies.calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].user_text, "Hi Hi there");
        }
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_policy_uses_last_fragment() {
        let config = RealtimeConfig {
            turn_policy: TurnPolicy::Latest,
            ..RealtimeConfig::default()
        };
        let mut h = Harness::start(config, FakeReplies::default(), false);
        h.recv().await;

        h.say("Hi").await;
        h.recv().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.say("Hi there").await;
        h.recv().await;

        assert!(matches!(h.recv().await, ServerMessage::Reply { .. }));
        h.assert_quiet().await;
        {
            let calls = h.replies.calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].user_text, "Hi there");
            assert!(calls[0].history.contains("User: Hi\nUser: Hi there"));
        }
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_sends_null_audio() {
        let mut h = Harness::start(RealtimeConfig::default(), FakeReplies::default(), true);
        h.recv().await;

        h.say("What does it cost?").await;
        h.recv().await;
        assert_eq!(
            h.recv().await,
            ServerMessage::Reply {
                ai_reply: "Who is this?".into(),
                ai_audio: None,
            }
        );

        let report = h.finish().await;
        assert_eq!(report.stats.synthesis_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partials_do_not_touch_state() {
        let config = RealtimeConfig {
            forward_partials: true,
            ..RealtimeConfig::default()
        };
        let mut h = Harness::start(config, FakeReplies::default(), false);
        h.recv().await;

        h.events
            .send(Ok(TranscriptEvent::partial("I'm not")))
            .await
            .unwrap();
        assert_eq!(
            h.recv().await,
            ServerMessage::Partial {
                partial: "I'm not".into()
            }
        );

        h.assert_quiet().await;
        assert!(h.entry.history().is_empty());
        assert!(h.replies.calls.lock().is_empty());
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_failure_aborts_turn_only() {
        let replies = FakeReplies {
            fail_first: 1,
            ..FakeReplies::default()
        };
        let mut h = Harness::start(RealtimeConfig::default(), replies, false);
        h.recv().await;

        h.say("Hello").await;
        h.recv().await;
        match h.recv().await {
            ServerMessage::Error { error } => assert!(error.contains("model unavailable")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(h.entry.rendered_history(), "User: Hello");

        h.say("Anyone there?").await;
        h.recv().await;
        assert!(matches!(h.recv().await, ServerMessage::Reply { .. }));
        {
            let calls = h.replies.calls.lock();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[1].user_text, "Anyone there?");
        }
        assert_eq!(
            h.entry.rendered_history(),
            "User: Hello\nUser: Anyone there?\nAgent: Who is this?"
        );

        let report = h.finish().await;
        assert!(matches!(report.end, SessionEnd::ClientClosed));
        assert_eq!(report.stats.reply_failures, 1);
        assert_eq!(report.stats.turns, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_close_tears_down_ingress() {
        let mut h = Harness::start(RealtimeConfig::default(), FakeReplies::default(), false);
        h.recv().await;

        let Harness {
            events,
            frames,
            entry,
            handle,
            ..
        } = h;
        drop(events);

        let report = handle.await.unwrap();
        assert!(matches!(
            report.end,
            SessionEnd::Failed(SessionError::UpstreamClosed)
        ));
        // Ingress stopped even though the client side is still open.
        assert!(frames.is_closed());
        assert!(!entry.has_writer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_forwarded_until_end() {
        let mut h = Harness::start(RealtimeConfig::default(), FakeReplies::default(), false);
        h.recv().await;

        for i in 0..3u8 {
            h.frames
                .send(ClientFrame::Audio(Bytes::from(vec![i; 320])))
                .await
                .unwrap();
        }
        h.frames.send(ClientFrame::Audio(Bytes::new())).await.unwrap();
        h.frames.send(ClientFrame::End).await.unwrap();

        let audio_seen = Arc::clone(&h.audio_seen);
        let report = h.handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::EndRequested));
        assert_eq!(report.stats.frames_in, 3);
        assert_eq!(report.stats.frames_dropped, 0);
        assert_eq!(audio_seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_gone_before_ready() {
        let h = Harness::start(RealtimeConfig::default(), FakeReplies::default(), false);
        let Harness {
            outbound, handle, ..
        } = h;
        drop(outbound);

        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::Failed(SessionError::ClientGone)));
    }
}
