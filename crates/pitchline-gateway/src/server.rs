//! Axum server: realtime WebSocket route plus HTTP endpoints.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State, WebSocketUpgrade};
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::handle_salescall;
use crate::handlers;
use crate::state::AppState;

/// Uploaded call recordings can be large.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let origins = state
        .config
        .server
        .as_ref()
        .map(|s| s.cors_origins.clone())
        .unwrap_or_default();
    let cors = cors_layer(&origins);

    let router = Router::new()
        .route("/ws/salescall", get(ws_handler))
        .route("/health", get(handlers::health))
        .route("/start-session", post(handlers::start_session))
        .route("/end-session", post(handlers::end_session))
        .route("/generate-response", post(handlers::generate_response))
        .route("/score-call", post(handlers::score_call))
        .route("/transcribe-audio", post(handlers::transcribe_audio))
        .route("/transcribe-and-respond", post(handlers::transcribe_and_respond))
        .route("/upload-call", post(handlers::upload_call))
        .route("/tts", post(handlers::tts))
        .route("/sessions", get(handlers::list_sessions))
        .route("/session/{session_id}", get(handlers::get_session));

    #[cfg(feature = "metrics")]
    let router = router
        .route("/metrics", get(metrics_handler))
        .route_layer(axum::middleware::from_fn(track_requests));

    router
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Start the gateway on the configured bind address, shutting down on Ctrl+C.
pub async fn start_gateway(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.bind_addr());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Pitchline listening on {addr}");
    serve(state, listener, shutdown_signal()).await
}

/// Serve on an existing listener until `shutdown` resolves. Live streams are
/// cancelled so each still runs its own finalization.
pub async fn serve<F>(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::clone(&state));
    let token = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            token.cancel();
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_salescall(state, socket))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (axum::http::StatusCode::OK, handle.render()),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ),
    }
}

#[cfg(feature = "metrics")]
async fn track_requests(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let route = req
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    crate::metrics::record_request(&route, start.elapsed().as_secs_f64());
    response
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
