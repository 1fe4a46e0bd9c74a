//! Speech-to-text: the realtime transcription stream used by voice sessions
//! and a batch client for whole recordings.
//!
//! Both speak AssemblyAI. Realtime audio travels as base64 JSON frames;
//! transcripts come back as `PartialTranscript` / `FinalTranscript` messages.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use pitchline_core::config::TranscriptionConfig;

use crate::audio_queue::AudioReceiver;

const DEFAULT_REALTIME_URL: &str = "wss://api.assemblyai.com/v2/realtime/ws";
const DEFAULT_BASE_URL: &str = "https://api.assemblyai.com";

/// Upstream silence after which the connection is considered dead.
const WS_MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on batch transcript polls before giving up.
const MAX_TRANSCRIPT_POLLS: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    /// Interim, may still be revised.
    Partial,
    /// Stable; will not be revised.
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: text.into(),
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("STT connection failed: {0}")]
    Connect(String),

    #[error("failed to send audio upstream: {0}")]
    Send(String),

    #[error("STT provider error: {0}")]
    Provider(String),

    #[error("STT connection idle for {0:?}")]
    IdleTimeout(Duration),
}

/// Item delivered by a transcription stream.
pub type SttResult = Result<TranscriptEvent, SttError>;

/// A live transcription connection. Audio is pulled from the
/// [`AudioReceiver`] handed to [`StreamingTranscriber::connect`]; events are
/// read with [`TranscriptionStream::next_event`].
pub struct TranscriptionStream {
    events: mpsc::Receiver<SttResult>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TranscriptionStream {
    pub fn new(
        events: mpsc::Receiver<SttResult>,
        shutdown: Option<oneshot::Sender<()>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            shutdown,
            task,
        }
    }

    /// Next event. `None` means the upstream connection is gone.
    pub async fn next_event(&mut self) -> Option<SttResult> {
        self.events.recv().await
    }

    /// Ask the upstream to terminate, waiting at most `grace` for the
    /// connection task before aborting it.
    pub async fn close(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if timeout(grace, &mut task).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "STT connection did not close in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for TranscriptionStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens realtime transcription connections.
#[async_trait]
pub trait StreamingTranscriber: Send + Sync {
    async fn connect(&self, audio: AudioReceiver) -> Result<TranscriptionStream, SttError>;
}

/// Transcribes a complete recording.
#[async_trait]
pub trait BatchTranscriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes) -> anyhow::Result<String>;
}

// --- Realtime ---

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type")]
enum RealtimeMessage {
    SessionBegins {
        #[serde(default)]
        session_id: Option<String>,
    },
    PartialTranscript {
        #[serde(default)]
        text: String,
    },
    FinalTranscript {
        #[serde(default)]
        text: String,
    },
    SessionTerminated,
}

/// What the connection task should do with one upstream text frame.
#[derive(Debug, PartialEq)]
enum Upstream {
    Event(TranscriptEvent),
    Begin(Option<String>),
    Terminated,
    Error(String),
    Ignored,
}

fn parse_upstream(text: &str) -> Upstream {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Upstream::Ignored;
    };
    if let Some(err) = value.get("error") {
        return Upstream::Error(
            err.as_str()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
        );
    }
    match serde_json::from_value::<RealtimeMessage>(value) {
        Ok(RealtimeMessage::SessionBegins { session_id }) => Upstream::Begin(session_id),
        Ok(RealtimeMessage::PartialTranscript { text }) => {
            Upstream::Event(TranscriptEvent::partial(text))
        }
        Ok(RealtimeMessage::FinalTranscript { text }) => {
            Upstream::Event(TranscriptEvent::final_text(text))
        }
        Ok(RealtimeMessage::SessionTerminated) => Upstream::Terminated,
        Err(_) => Upstream::Ignored,
    }
}

fn audio_message(frame: &[u8]) -> Message {
    let payload = serde_json::json!({ "audio_data": BASE64.encode(frame) });
    Message::Text(payload.to_string().into())
}

fn terminate_message() -> Message {
    Message::Text(r#"{"terminate_session":true}"#.into())
}

/// AssemblyAI realtime transcription.
pub struct AssemblyAiRealtime {
    api_key: String,
    url: String,
    sample_rate: u32,
    event_capacity: usize,
}

impl AssemblyAiRealtime {
    pub fn new(api_key: impl Into<String>, url: Option<&str>, sample_rate: u32) -> Self {
        Self {
            api_key: api_key.into(),
            url: url.unwrap_or(DEFAULT_REALTIME_URL).to_string(),
            sample_rate,
            event_capacity: 256,
        }
    }

    pub fn from_config(config: &TranscriptionConfig, sample_rate: u32) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;
        Ok(Self::new(api_key, config.realtime_url.as_deref(), sample_rate))
    }

    fn endpoint(&self) -> String {
        format!("{}?sample_rate={}", self.url, self.sample_rate)
    }
}

#[async_trait]
impl StreamingTranscriber for AssemblyAiRealtime {
    async fn connect(&self, mut audio: AudioReceiver) -> Result<TranscriptionStream, SttError> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| SttError::Connect(format!("invalid realtime URL: {e}")))?;
        let auth = HeaderValue::from_str(&self.api_key)
            .map_err(|e| SttError::Connect(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| SttError::Connect(e.to_string()))?;
        info!(sample_rate = self.sample_rate, "Connected to AssemblyAI realtime");

        let (sink, stream) = ws.split();
        let (events_tx, events_rx) = mpsc::channel::<SttResult>(self.event_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(relay(sink, stream, audio, events_tx, shutdown_rx));

        Ok(TranscriptionStream::new(events_rx, Some(shutdown_tx), Some(task)))
    }
}

/// Pump audio up and transcripts down until either side ends. The idle
/// timer only restarts when the upstream says something.
async fn relay<S, R, E>(
    mut sink: S,
    mut stream: R,
    mut audio: AudioReceiver,
    events_tx: mpsc::Sender<SttResult>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut sent_frames: u64 = 0;
    let mut audio_open = true;
    let idle = tokio::time::sleep(WS_MESSAGE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = audio.recv(), if audio_open => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(audio_message(&frame)).await {
                        let _ = events_tx.send(Err(SttError::Send(e.to_string()))).await;
                        break;
                    }
                    sent_frames += 1;
                }
                None => {
                    debug!(sent_frames, "Audio queue closed, terminating STT session");
                    audio_open = false;
                    let _ = sink.send(terminate_message()).await;
                }
            },

            message = stream.next() => {
                idle.as_mut().reset(Instant::now() + WS_MESSAGE_TIMEOUT);
                match message {
                    Some(Ok(Message::Text(text))) => match parse_upstream(&text) {
                        Upstream::Event(event) => {
                            if events_tx.send(Ok(event)).await.is_err() {
                                debug!("Transcript receiver dropped");
                                break;
                            }
                        }
                        Upstream::Begin(id) => {
                            info!(upstream_session = ?id, "AssemblyAI session started");
                        }
                        Upstream::Terminated => {
                            info!(sent_frames, "AssemblyAI session terminated");
                            break;
                        }
                        Upstream::Error(err) => {
                            warn!(error = %err, "AssemblyAI realtime error");
                            let _ = events_tx.send(Err(SttError::Provider(err))).await;
                            break;
                        }
                        Upstream::Ignored => {
                            debug!(len = text.len(), "Ignoring unrecognized STT message");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "AssemblyAI WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events_tx
                            .send(Err(SttError::Provider(format!("WebSocket error: {e}"))))
                            .await;
                        break;
                    }
                    None => {
                        info!("AssemblyAI WebSocket stream ended");
                        break;
                    }
                }
            },

            _ = &mut idle => {
                warn!(sent_frames, "No message from AssemblyAI in {WS_MESSAGE_TIMEOUT:?}");
                let _ = events_tx.send(Err(SttError::IdleTimeout(WS_MESSAGE_TIMEOUT))).await;
                break;
            }

            _ = &mut shutdown_rx => {
                debug!(sent_frames, "Closing AssemblyAI realtime session");
                if audio_open {
                    let _ = sink.send(terminate_message()).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

// --- Batch ---

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    id: String,
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// AssemblyAI upload → transcript → poll.
pub struct AssemblyAiClient {
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl AssemblyAiClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>, poll_interval: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            poll_interval,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &TranscriptionConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;
        Ok(Self::new(
            api_key,
            config.base_url.as_deref(),
            Duration::from_millis(config.poll_interval_ms),
        ))
    }

    async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }
        Ok(resp)
    }

    async fn upload(&self, audio: Bytes) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/v2/upload", self.base_url))
            .header("Authorization", &self.api_key)
            .body(audio)
            .send()
            .await?;
        let upload: UploadResponse = Self::check(resp).await?.json().await?;
        Ok(upload.upload_url)
    }

    async fn create_transcript(&self, audio_url: &str) -> anyhow::Result<TranscriptResponse> {
        let resp = self
            .client
            .post(format!("{}/v2/transcript", self.base_url))
            .header("Authorization", &self.api_key)
            .json(&serde_json::json!({ "audio_url": audio_url }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn fetch_transcript(&self, id: &str) -> anyhow::Result<TranscriptResponse> {
        let resp = self
            .client
            .get(format!("{}/v2/transcript/{id}", self.base_url))
            .header("Authorization", &self.api_key)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

/// Interpret a transcript status. `Ok(None)` means still in progress.
fn finished_text(transcript: &TranscriptResponse) -> anyhow::Result<Option<String>> {
    match transcript.status.as_str() {
        "completed" => Ok(Some(transcript.text.clone().unwrap_or_default())),
        "error" => anyhow::bail!(
            "Transcription failed: {}",
            transcript.error.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(None),
    }
}

#[async_trait]
impl BatchTranscriber for AssemblyAiClient {
    async fn transcribe(&self, audio: Bytes) -> anyhow::Result<String> {
        let bytes = audio.len();
        let audio_url = self.upload(audio).await?;
        let mut transcript = self.create_transcript(&audio_url).await?;
        debug!(bytes, transcript_id = %transcript.id, "Transcription queued");

        for _ in 0..MAX_TRANSCRIPT_POLLS {
            if let Some(text) = finished_text(&transcript)? {
                debug!(transcript_id = %transcript.id, chars = text.len(), "Transcription complete");
                return Ok(text.trim().to_string());
            }
            tokio::time::sleep(self.poll_interval).await;
            transcript = self.fetch_transcript(&transcript.id).await?;
        }
        anyhow::bail!(
            "Transcription {} still {} after {MAX_TRANSCRIPT_POLLS} polls",
            transcript.id,
            transcript.status
        )
    }
}
