//! Request/response endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Form, Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use pitchline_core::archive::{SessionListing, SessionRecord};
use pitchline_core::error::PitchlineError;
use pitchline_core::session::{Speaker, Transcript};
use pitchline_providers::{CallContext, ReplyRequest};

use crate::finish::{CallSummary, FinishOutcome, finish_session};
use crate::state::AppState;

/// JSON error body `{"error": ...}` with a status derived from the failure kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PitchlineError> for ApiError {
    fn from(err: PitchlineError) -> Self {
        let status = match &err {
            PitchlineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            PitchlineError::SessionInactive(_) | PitchlineError::SessionBusy(_) => {
                StatusCode::CONFLICT
            }
            PitchlineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PitchlineError::Provider(_)
            | PitchlineError::Transcription(_)
            | PitchlineError::Synthesis(_)
            | PitchlineError::Archive(_) => StatusCode::BAD_GATEWAY,
            PitchlineError::Config(_)
            | PitchlineError::Io(_)
            | PitchlineError::Json(_)
            | PitchlineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        } else {
            debug!(status = %self.status, error = %self.message, "Request rejected");
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(self.status.as_str());
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn provider_err(e: anyhow::Error) -> ApiError {
    PitchlineError::Provider(e.to_string()).into()
}

fn transcription_err(e: anyhow::Error) -> ApiError {
    PitchlineError::Transcription(e.to_string()).into()
}

fn required(value: &str, name: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{name} is required")));
    }
    Ok(())
}

/// Multipart body: the `file` part plus any text fields.
#[derive(Debug, Default)]
struct Upload {
    file: Option<Bytes>,
    fields: HashMap<String, String>,
}

impl Upload {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut upload = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read file: {e}")))?;
                upload.file = Some(data);
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid field {name}: {e}")))?;
                upload.fields.insert(name, text);
            }
        }
        Ok(upload)
    }

    fn file(&mut self) -> ApiResult<Bytes> {
        match self.file.take() {
            Some(data) if !data.is_empty() => Ok(data),
            _ => Err(ApiError::bad_request("file is required")),
        }
    }

    fn field(&self, name: &str) -> ApiResult<String> {
        let value = self.fields.get(name).cloned().unwrap_or_default();
        required(&value, name)?;
        Ok(value)
    }

    fn optional(&self, name: &str) -> String {
        self.fields.get(name).cloned().unwrap_or_default()
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len(),
        "streams": state.live_streams(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StartSessionForm {
    pub persona: String,
    pub offer: String,
    #[serde(default)]
    pub history: String,
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Form(form): Form<StartSessionForm>,
) -> ApiResult<Json<Value>> {
    required(&form.persona, "persona")?;
    required(&form.offer, "offer")?;
    let entry = state.sessions.create(
        None,
        form.persona,
        form.offer,
        Transcript::with_preamble(form.history),
    )?;
    Ok(Json(json!({ "session_id": entry.id() })))
}

#[derive(Debug, Deserialize)]
pub struct EndSessionForm {
    pub session_id: String,
}

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Form(form): Form<EndSessionForm>,
) -> ApiResult<Json<CallSummary>> {
    match finish_session(&state, &form.session_id).await? {
        FinishOutcome::AlreadyFinished => {
            Err(PitchlineError::SessionNotFound(form.session_id).into())
        }
        FinishOutcome::Empty => Ok(Json(CallSummary {
            score: None,
            feedback: String::new(),
            title: String::new(),
        })),
        FinishOutcome::Archived(summary) => Ok(Json(summary)),
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub user_input: String,
    #[serde(default)]
    pub history: String,
    pub persona: String,
    pub offer: String,
}

pub async fn generate_response(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Json<Value>> {
    required(&req.user_input, "user_input")?;
    let reply = state
        .services
        .replies
        .reply(&ReplyRequest {
            user_text: req.user_input,
            history: req.history,
            persona: req.persona,
            offer: req.offer,
        })
        .await
        .map_err(provider_err)?;
    Ok(Json(json!({ "reply": reply })))
}

#[derive(Debug, Deserialize)]
pub struct ScoreRequest {
    pub history: String,
    pub persona: String,
    pub offer: String,
}

pub async fn score_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScoreRequest>,
) -> ApiResult<Json<Value>> {
    required(&req.history, "history")?;
    let score = state
        .services
        .coach
        .score(&CallContext {
            history: req.history,
            persona: req.persona,
            offer: req.offer,
        })
        .await
        .map_err(provider_err)?;
    Ok(Json(json!({ "score": score.score, "feedback": score.feedback })))
}

pub async fn transcribe_audio(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut upload = Upload::read(multipart).await?;
    let transcript = state
        .services
        .batch
        .transcribe(upload.file()?)
        .await
        .map_err(transcription_err)?;
    Ok(Json(json!({ "transcript": transcript })))
}

/// One push-to-talk turn against a live session.
pub async fn transcribe_and_respond(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut upload = Upload::read(multipart).await?;
    let session_id = upload.field("session_id")?;
    let audio = upload.file()?;

    let entry = state.sessions.get(&session_id)?;
    let writer = entry.claim_writer()?;

    let transcript = state
        .services
        .batch
        .transcribe(audio)
        .await
        .map_err(transcription_err)?;
    if transcript.trim().is_empty() {
        return Err(ApiError::bad_request("no speech detected"));
    }
    writer.append(Speaker::User, transcript.as_str());

    let reply = state
        .services
        .replies
        .reply(&ReplyRequest {
            user_text: transcript.clone(),
            history: writer.rendered_history(),
            persona: entry.persona().to_string(),
            offer: entry.offer().to_string(),
        })
        .await
        .map_err(provider_err)?;
    writer.append(Speaker::Agent, reply.as_str());

    Ok(Json(json!({ "transcript": transcript, "ai_reply": reply })))
}

/// Score a complete recorded call.
pub async fn upload_call(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut upload = Upload::read(multipart).await?;
    let persona = upload.field("persona")?;
    let offer = upload.field("offer")?;
    let history = upload.optional("history");
    let audio = upload.file()?;

    let transcript = state
        .services
        .batch
        .transcribe(audio)
        .await
        .map_err(transcription_err)?;

    let full = if history.trim().is_empty() {
        transcript.clone()
    } else {
        format!("{}\n{}", history.trim(), transcript)
    };
    let score = state
        .services
        .coach
        .score(&CallContext {
            history: full,
            persona,
            offer,
        })
        .await
        .map_err(provider_err)?;

    Ok(Json(json!({
        "transcript": transcript,
        "score": score.score,
        "feedback": score.feedback,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TtsForm {
    pub text: String,
}

pub async fn tts(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TtsForm>,
) -> ApiResult<Response> {
    required(&form.text, "text")?;
    let audio = state
        .services
        .speech
        .synthesize(&form.text)
        .await
        .map_err(|e| ApiError::from(PitchlineError::Synthesis(e.to_string())))?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response())
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SessionListing>>> {
    Ok(Json(state.services.archive.list().await?))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    state
        .services
        .archive
        .get(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| PitchlineError::SessionNotFound(session_id).into())
}
