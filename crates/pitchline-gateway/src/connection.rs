//! `/ws/salescall` connection lifecycle: init frame, session attach or
//! create, realtime voice session, finalization.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt, future};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pitchline_core::error::{PitchlineError, Result};
use pitchline_core::protocol::{ClientControl, ClientInit, ServerMessage};
use pitchline_core::registry::{SessionEntry, SessionWriter};
use pitchline_core::session::Transcript;
use pitchline_media::voice_session::{ClientFrame, SessionEnd, VoiceSession};

use crate::finish::{FinishOutcome, finish_session};
use crate::state::{AppState, LiveStream};

/// How long a client has to send its init frame.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;

/// Handle one realtime sales-call connection.
pub async fn handle_salescall(state: Arc<AppState>, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let init = match read_init(&mut ws_rx).await {
        Ok(Some(init)) => init,
        Ok(None) => {
            debug!("Client left before sending init frame");
            return;
        }
        Err(msg) => {
            reject(&mut ws_tx, msg).await;
            return;
        }
    };

    let entry = match open_session(&state, init) {
        Ok(entry) => entry,
        Err(e) => {
            reject(&mut ws_tx, e.to_string()).await;
            return;
        }
    };
    let session_id = entry.id().to_string();

    let (writer, stream) = match attach_stream(&state, &entry) {
        Ok(attached) => attached,
        Err(e) => {
            warn!(%session_id, error = %e, "Rejecting stream");
            reject(&mut ws_tx, e.to_string()).await;
            return;
        }
    };

    info!(%session_id, "Sales call stream opened");
    #[cfg(feature = "metrics")]
    crate::metrics::record_stream_open();

    let cancel = stream.token().clone();
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(state.realtime.client_queue_capacity.max(1));
    let writer_task = tokio::spawn(write_loop(ws_tx, out_rx, cancel.clone()));

    let session = VoiceSession::new(
        writer,
        state.realtime.clone(),
        state.pipeline(),
        out_tx.clone(),
        cancel,
    );
    let report = session.run(client_frames(ws_rx, session_id.clone())).await;
    state.close_stream(&session_id, &stream);

    #[cfg(feature = "metrics")]
    crate::metrics::record_stream_close(&report.stats);

    if let SessionEnd::Failed(e) = &report.end {
        let _ = out_tx.send(ServerMessage::error(e.to_string())).await;
    }

    match finish_session(&state, &session_id).await {
        Ok(FinishOutcome::Archived(summary)) => {
            if matches!(report.end, SessionEnd::EndRequested) {
                let _ = out_tx
                    .send(ServerMessage::Summary {
                        score: summary.score,
                        feedback: summary.feedback,
                        title: summary.title,
                    })
                    .await;
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(%session_id, error = %e, "Failed to finalize session");
            let _ = out_tx
                .send(ServerMessage::error(format!("Failed to save session: {e}")))
                .await;
        }
    }

    drop(out_tx);
    let _ = writer_task.await;
    info!(%session_id, end = ?report.end, "Sales call stream closed");
}

/// Wait for the first text frame and parse it as [`ClientInit`].
/// `Ok(None)` means the client went away first.
async fn read_init(
    ws_rx: &mut SplitStream<WebSocket>,
) -> std::result::Result<Option<ClientInit>, String> {
    let first = tokio::time::timeout(INIT_TIMEOUT, async {
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => return Some("".into()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .map_err(|_| "Timed out waiting for session init".to_string())?;

    let Some(text) = first else {
        return Ok(None);
    };
    serde_json::from_str::<ClientInit>(text.as_str())
        .map(Some)
        .map_err(|e| format!("Expected session init JSON: {e}"))
}

/// Attach to a known session or create one from the init frame.
fn open_session(state: &AppState, init: ClientInit) -> Result<Arc<SessionEntry>> {
    if let Some(id) = init.session_id.as_deref().filter(|id| !id.trim().is_empty()) {
        if let Ok(entry) = state.sessions.get(id) {
            debug!(session_id = id, "Attaching to existing session");
            return Ok(entry);
        }
    }

    let persona = init.persona.unwrap_or_default();
    let offer = init.offer.unwrap_or_default();
    if persona.trim().is_empty() || offer.trim().is_empty() {
        return Err(PitchlineError::InvalidRequest(
            "persona and offer are required to start a session".into(),
        ));
    }
    state
        .sessions
        .create(init.session_id, persona, offer, Transcript::new())
}

/// Register a stream for `entry` and claim its writer.
///
/// The stream is registered before the claim so that a concurrent
/// [`finish_session`] either cancels this stream's token or leaves a
/// deactivated entry that the claim and the re-check below refuse. A second
/// stream for the same session is turned away.
pub fn attach_stream(
    state: &AppState,
    entry: &Arc<SessionEntry>,
) -> Result<(SessionWriter, LiveStream)> {
    let session_id = entry.id();
    let stream = state
        .open_stream(session_id)
        .ok_or_else(|| PitchlineError::SessionBusy(session_id.to_string()))?;

    let claimed = entry.claim_writer().and_then(|writer| {
        let current = state.sessions.get(session_id)?;
        if !Arc::ptr_eq(&current, entry) || !entry.is_active() {
            return Err(PitchlineError::SessionInactive(session_id.to_string()));
        }
        Ok(writer)
    });
    match claimed {
        Ok(writer) => Ok((writer, stream)),
        Err(e) => {
            state.close_stream(session_id, &stream);
            Err(e)
        }
    }
}

/// Client messages after init: binary frames are audio, `{"type":"end"}`
/// ends the call, anything else is ignored. The stream stops at close or
/// on a transport error.
fn client_frames(ws_rx: SplitStream<WebSocket>, session_id: String) -> BoxStream<'static, ClientFrame> {
    ws_rx
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(move |msg| {
            let frame = match msg {
                Ok(Message::Binary(data)) => Some(ClientFrame::Audio(data)),
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientControl>(text.as_str()) {
                    Ok(ClientControl::End) => Some(ClientFrame::End),
                    Err(_) => {
                        debug!(%session_id, len = text.len(), "Ignoring text frame");
                        None
                    }
                },
                _ => None,
            };
            future::ready(frame)
        })
        .boxed()
}

/// Forward outbound messages to the socket until every sender is gone.
async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<ServerMessage>, cancel: CancellationToken) {
    while let Some(msg) = rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(error = %e, "Client socket write failed");
            cancel.cancel();
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Send a diagnostic and close, used before a session is running.
async fn reject(ws_tx: &mut WsSink, msg: String) {
    debug!(error = %msg, "Rejecting connection");
    if let Ok(text) = serde_json::to_string(&ServerMessage::error(msg)) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}
