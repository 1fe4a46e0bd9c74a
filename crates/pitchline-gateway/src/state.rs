//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use pitchline_core::archive::SessionArchive;
use pitchline_core::config::{Config, RealtimeConfig};
use pitchline_core::registry::SessionRegistry;
use pitchline_media::stt::{BatchTranscriber, StreamingTranscriber};
use pitchline_media::tts::SpeechSynthesizer;
use pitchline_media::voice_session::VoicePipeline;
use pitchline_providers::{CallCoach, ReplyGenerator};

/// External collaborators, shared by every handler.
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn StreamingTranscriber>,
    pub batch: Arc<dyn BatchTranscriber>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub coach: Arc<dyn CallCoach>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub archive: Arc<dyn SessionArchive>,
}

/// Registration of one live audio stream.
#[derive(Debug, Clone)]
pub struct LiveStream {
    id: u64,
    token: CancellationToken,
}

impl LiveStream {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Shared gateway state accessible from all connections and handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub realtime: RealtimeConfig,
    pub sessions: SessionRegistry,
    pub services: Services,
    /// Cancellation handles for sessions with a live audio stream.
    streams: Mutex<HashMap<String, LiveStream>>,
    next_stream_id: AtomicU64,
    /// Parent of every stream token; cancelled on server shutdown.
    pub shutdown: CancellationToken,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Arc<Config>, services: Services) -> Self {
        let realtime = config.realtime();
        Self {
            config,
            realtime,
            sessions: SessionRegistry::new(),
            services,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    pub fn pipeline(&self) -> VoicePipeline {
        VoicePipeline {
            transcriber: Arc::clone(&self.services.transcriber),
            replies: Arc::clone(&self.services.replies),
            speech: Arc::clone(&self.services.speech),
        }
    }

    /// Register a live stream for a session. `None` if one is already registered.
    pub fn open_stream(&self, session_id: &str) -> Option<LiveStream> {
        let mut streams = self.streams.lock();
        if streams.contains_key(session_id) {
            return None;
        }
        let stream = LiveStream {
            id: self.next_stream_id.fetch_add(1, Ordering::Relaxed),
            token: self.shutdown.child_token(),
        };
        streams.insert(session_id.to_string(), stream.clone());
        Some(stream)
    }

    /// Unregister `stream`. A newer registration under the same id is left alone.
    pub fn close_stream(&self, session_id: &str, stream: &LiveStream) {
        let mut streams = self.streams.lock();
        if streams.get(session_id).is_some_and(|s| s.id == stream.id) {
            streams.remove(session_id);
        }
    }

    /// Cancel a live stream, if any. Returns whether one was running.
    pub fn cancel_stream(&self, session_id: &str) -> bool {
        match self.streams.lock().remove(session_id) {
            Some(stream) => {
                stream.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn live_streams(&self) -> usize {
        self.streams.lock().len()
    }
}
