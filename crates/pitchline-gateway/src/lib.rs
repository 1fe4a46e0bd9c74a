//! HTTP + WebSocket gateway for Pitchline.
//!
//! Hosts the `/ws/salescall` realtime bridge and the request/response
//! endpoints, and owns the process-wide session registry they share.

pub mod connection;
pub mod finish;
pub mod handlers;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{build_router, serve, start_gateway};
pub use state::{AppState, LiveStream, Services};
