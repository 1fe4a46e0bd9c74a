//! Session finalization: the one teardown path for every way a call ends.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use pitchline_core::archive::SessionRecord;
use pitchline_core::error::Result;
use pitchline_providers::CallContext;

use crate::state::AppState;

/// Upper bound on waiting for an in-flight turn to land before the
/// transcript is archived.
const WRITER_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Scored summary returned to whoever ended the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub score: Option<i64>,
    pub feedback: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Another caller already finished this session (or it never existed).
    AlreadyFinished,
    /// Nothing was said; nothing archived.
    Empty,
    /// Scored, titled, and archived once.
    Archived(CallSummary),
}

/// End a session: remove it from the registry, stop its live stream, and
/// archive a scored summary when it has any history.
///
/// Only the caller whose registry removal succeeds does any work, so racing
/// callers (socket disconnect vs. explicit end) never archive twice. The
/// transcript is read after the current writer lets go, so a turn that was
/// mid-flight when the stream was cancelled is still archived.
pub async fn finish_session(state: &AppState, session_id: &str) -> Result<FinishOutcome> {
    let Some(entry) = state.sessions.remove(session_id) else {
        return Ok(FinishOutcome::AlreadyFinished);
    };
    entry.deactivate();
    state.cancel_stream(session_id);

    if tokio::time::timeout(WRITER_RELEASE_TIMEOUT, entry.writer_released())
        .await
        .is_err()
    {
        warn!(session_id, "Writer still held, archiving transcript as it stands");
    }

    let history = entry.history();
    if history.is_empty() {
        info!(session_id, "Session ended with no conversation");
        return Ok(FinishOutcome::Empty);
    }

    let call = CallContext {
        history: history.render(),
        persona: entry.persona().to_string(),
        offer: entry.offer().to_string(),
    };
    let coach = &state.services.coach;
    let (score, title) = tokio::join!(coach.score(&call), coach.title(&call));

    let (score, feedback) = match score {
        Ok(s) => (s.score, s.feedback),
        Err(e) => {
            warn!(session_id, error = %e, "Scoring failed");
            (None, format!("Scoring unavailable: {e}"))
        }
    };
    let title = match title {
        Ok(t) if !t.is_empty() => t,
        Ok(_) => fallback_title(&entry.created_at()),
        Err(e) => {
            warn!(session_id, error = %e, "Title generation failed");
            fallback_title(&entry.created_at())
        }
    };

    let record = SessionRecord {
        session_id: session_id.to_string(),
        persona: call.persona,
        offer: call.offer,
        history: call.history,
        score,
        feedback: feedback.clone(),
        title: title.clone(),
        created_at: entry.created_at().timestamp(),
    };
    state.services.archive.insert(&record).await?;

    info!(session_id, ?score, turns = history.len(), "Session archived");
    Ok(FinishOutcome::Archived(CallSummary {
        score,
        feedback,
        title,
    }))
}

fn fallback_title(created_at: &chrono::DateTime<chrono::Utc>) -> String {
    format!("Sales call {}", created_at.format("%Y-%m-%d %H:%M"))
}
